//! Isolated execution contexts.
//!
//! The controller side lives in [`manager`] plus one module per isolation
//! back-end ([`process`], [`thread`]). Everything that runs *inside* a
//! sandbox lives in [`worker`] and the modules it drives.
//!
//! A sandbox is reachable only through frames: the controller posts
//! [`ControllerMessage`]s and reads back raw JSON lines, which the manager
//! tags with the sandbox identity before anyone decodes them.

pub mod engine;
pub mod manager;
pub mod net;
pub mod process;
#[cfg(test)]
pub mod scripted;
pub mod thread;
pub mod timers;
pub mod worker;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{Config, Isolation};
use crate::error::SandboxError;
use crate::protocol::ControllerMessage;

pub use manager::SandboxManager;

/// Identity of one sandbox instance. A fresh one is minted for every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxId(Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, enough to tell runs apart in logs
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Active,
    Disposed,
}

/// One raw frame as received from a sandbox, attributed to its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: SandboxId,
    pub frame: String,
}

/// A live isolated context, as seen from the controller.
pub trait Sandbox: Send {
    fn id(&self) -> SandboxId;

    fn state(&self) -> SandboxState;

    /// Marks the sandbox as the one the manager currently routes to.
    fn activate(&mut self);

    /// Hands out the stream of raw outbound frames. Only the first call
    /// returns `Some`.
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<String>>;

    fn post(&self, message: &ControllerMessage) -> Result<(), SandboxError>;

    /// Destroys the context. Idempotent.
    fn dispose(&mut self);
}

/// Creates sandboxes running the bootstrap program.
pub trait SandboxFactory: Send + Sync {
    fn create(&self, id: SandboxId) -> Result<Box<dyn Sandbox>, SandboxError>;

    /// Human-readable description of the isolation mode
    fn description(&self) -> String;
}

/// Builds the factory selected by `[sandbox] isolation`.
pub fn factory_from_config(config: &Config) -> anyhow::Result<Arc<dyn SandboxFactory>> {
    let options = worker::WorkerOptions::from_config(config);
    let factory: Arc<dyn SandboxFactory> = match config.sandbox.isolation {
        Isolation::Process => {
            let program = match &config.sandbox.worker_program {
                Some(path) => path.clone(),
                None => std::env::current_exe()?,
            };
            Arc::new(process::ProcessSandboxFactory::new(program, &options))
        }
        Isolation::Thread => Arc::new(thread::ThreadSandboxFactory::new(options)),
    };
    Ok(factory)
}
