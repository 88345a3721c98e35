//! sandpad: a script playground that runs every script in a fresh,
//! isolated JavaScript sandbox and shows its console output.

pub mod bridge;
pub mod config;
pub mod console;
pub mod editor;
pub mod error;
pub mod format;
pub mod protocol;
pub mod runtime;
pub mod sandbox;
pub mod value;
