//! The event loop running inside a sandbox.
//!
//! One loop per sandbox, on a thread of its own: it waits for inbound
//! frames, timer deadlines and network completions, and hands each to the
//! [`Engine`] in arrival order. The same loop serves both isolation modes;
//! only the transport differs (stdio in a child process, channels on a
//! thread).

use std::io::{BufRead, Write};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Instant;

use anyhow::{anyhow, Context as _};
use tracing::{debug, info, warn};

use super::engine::Engine;
use super::net::FetchResponse;
use crate::config::Config;
use crate::error::SandboxError;
use crate::protocol::{decode_controller_frame, encode_sandbox_frame, ControllerMessage, SandboxMessage};

/// Worker-side destination of outbound frames.
pub trait Outbox {
    fn post(&self, frame: String);
}

#[derive(Debug)]
pub enum WorkerEvent {
    /// A raw frame from the controller.
    Inbound(String),
    FetchDone {
        id: u32,
        outcome: Result<FetchResponse, String>,
    },
    /// The controller is gone or disposed this sandbox.
    Shutdown,
}

/// Engine settings, passed to a child worker as command-line flags.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub allow_network: bool,
    pub loop_iteration_limit: Option<u64>,
    pub recursion_limit: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            allow_network: true,
            loop_iteration_limit: None,
            recursion_limit: None,
        }
    }
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allow_network: config.sandbox.allow_network,
            loop_iteration_limit: config.engine.loop_iteration_limit,
            recursion_limit: config.engine.recursion_limit,
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.allow_network {
            args.push("--no-network".to_string());
        }
        if let Some(limit) = self.loop_iteration_limit {
            args.push("--loop-limit".to_string());
            args.push(limit.to_string());
        }
        if let Some(limit) = self.recursion_limit {
            args.push("--recursion-limit".to_string());
            args.push(limit.to_string());
        }
        args
    }

    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--no-network" => options.allow_network = false,
                "--loop-limit" => {
                    let value = args.next().ok_or_else(|| anyhow!("--loop-limit needs a value"))?;
                    options.loop_iteration_limit =
                        Some(value.parse().with_context(|| format!("invalid --loop-limit {value}"))?);
                }
                "--recursion-limit" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--recursion-limit needs a value"))?;
                    options.recursion_limit = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid --recursion-limit {value}"))?,
                    );
                }
                other => return Err(anyhow!("unknown sandbox-worker option: {other}")),
            }
        }
        Ok(options)
    }
}

/// Runs the sandbox event loop until `Shutdown` or until every sender is gone.
///
/// `loopback` is handed to helpers (fetch threads) that feed completions
/// back into this loop.
pub fn serve(
    events: Receiver<WorkerEvent>,
    loopback: Sender<WorkerEvent>,
    outbox: Rc<dyn Outbox>,
    options: WorkerOptions,
) -> Result<(), SandboxError> {
    let mut engine = match Engine::boot(outbox.clone(), loopback, &options) {
        Ok(engine) => engine,
        Err(e) => {
            outbox.post(encode_sandbox_frame(&SandboxMessage::Error(e.to_string())));
            return Err(e);
        }
    };
    debug!("Sandbox worker booted");

    loop {
        let event = match engine.next_timer_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match events.recv_timeout(wait) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match events.recv() {
                Ok(event) => Some(event),
                Err(_) => break,
            },
        };

        match event {
            None => engine.fire_due_timers(Instant::now()),
            Some(WorkerEvent::Inbound(frame)) => match decode_controller_frame(&frame) {
                Ok(ControllerMessage::Run { code }) => {
                    debug!("Run request ({} bytes)", code.len());
                    engine.run_module(&code);
                }
                Ok(ControllerMessage::Unknown(tag)) => {
                    debug!("Ignoring controller frame with tag '{tag}'");
                }
                Err(e) => warn!("Malformed controller frame: {e}"),
            },
            Some(WorkerEvent::FetchDone { id, outcome }) => engine.settle_fetch(id, outcome),
            Some(WorkerEvent::Shutdown) => break,
        }
    }

    debug!("Sandbox worker stopped");
    Ok(())
}

// ── Child-process entry point ────────────────────────────

/// Writes each frame as one line on stdout.
struct StdoutOutbox;

impl Outbox for StdoutOutbox {
    fn post(&self, frame: String) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{frame}").and_then(|_| stdout.flush()) {
            debug!("Controller pipe closed: {e}");
        }
    }
}

/// `sandpad sandbox-worker [FLAGS]`: serves one sandbox over stdin/stdout
/// until stdin reaches EOF or the process is killed.
pub fn serve_stdio<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<()> {
    let options = WorkerOptions::from_args(args)?;
    info!("Sandbox worker started (pid {})", std::process::id());

    let (tx, rx) = mpsc::channel();
    let stdin_tx = tx.clone();
    std::thread::Builder::new()
        .name("sandbox-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if stdin_tx.send(WorkerEvent::Inbound(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read controller frame: {e}");
                        break;
                    }
                }
            }
            let _ = stdin_tx.send(WorkerEvent::Shutdown);
        })?;

    serve(rx, tx, Rc::new(StdoutOutbox), options)?;
    Ok(())
}
