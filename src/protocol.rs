//! Wire protocol between the controller and a sandbox.
//!
//! Every frame is one JSON document with a `t` tag:
//!
//! - controller → sandbox: `{"t":"run","code":"…"}`
//! - sandbox → controller: `{"t":"ready"}`,
//!   `{"t":"console","p":{"m":"log","a":[…]}}`, `{"t":"error","p":"…"}`
//!
//! Decoding is tolerant: an unknown tag yields an `Unknown` variant so the
//! receiver can drop it, only a frame that is not JSON at all is an error.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::console::LogKind;
use crate::value::RemoteValue;

/// Messages sent by the controller to a sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    /// Evaluate `code` as the body of a top-level module.
    Run { code: String },
    Unknown(String),
}

/// Messages sent by a sandbox to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxMessage {
    /// The bootstrap program has installed its interceptors.
    Ready,
    Console(ConsoleReport),
    /// An uncaught exception or rejection, already described as text.
    Error(String),
    Unknown(String),
}

/// One intercepted `console.*` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleReport {
    #[serde(rename = "m")]
    pub level: LogKind,
    #[serde(rename = "a", default)]
    pub args: Vec<RemoteValue>,
}

/// Envelope shared by both directions: the tag plus whatever else the
/// frame carries, kept as raw JSON until the tag is known.
#[derive(Debug, Deserialize)]
struct RawFrame {
    t: String,
    #[serde(default)]
    p: Value,
    #[serde(default)]
    code: Option<String>,
}

// ── Controller → sandbox ─────────────────────────────────

pub fn encode_controller_frame(message: &ControllerMessage) -> String {
    match message {
        ControllerMessage::Run { code } => json!({ "t": "run", "code": code }).to_string(),
        ControllerMessage::Unknown(tag) => json!({ "t": tag }).to_string(),
    }
}

pub fn decode_controller_frame(frame: &str) -> Result<ControllerMessage, serde_json::Error> {
    let raw: RawFrame = serde_json::from_str(frame)?;
    match (raw.t.as_str(), raw.code) {
        ("run", Some(code)) => Ok(ControllerMessage::Run { code }),
        _ => Ok(ControllerMessage::Unknown(raw.t)),
    }
}

// ── Sandbox → controller ─────────────────────────────────

pub fn encode_sandbox_frame(message: &SandboxMessage) -> String {
    match message {
        SandboxMessage::Ready => json!({ "t": "ready" }).to_string(),
        SandboxMessage::Console(report) => json!({ "t": "console", "p": report }).to_string(),
        SandboxMessage::Error(description) => json!({ "t": "error", "p": description }).to_string(),
        SandboxMessage::Unknown(tag) => json!({ "t": tag }).to_string(),
    }
}

pub fn decode_sandbox_frame(frame: &str) -> Result<SandboxMessage, serde_json::Error> {
    let raw: RawFrame = serde_json::from_str(frame)?;
    match raw.t.as_str() {
        "ready" => Ok(SandboxMessage::Ready),
        "console" => Ok(SandboxMessage::Console(serde_json::from_value(raw.p)?)),
        "error" => {
            let description = match raw.p {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Ok(SandboxMessage::Error(description))
        }
        _ => Ok(SandboxMessage::Unknown(raw.t)),
    }
}
