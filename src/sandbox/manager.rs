use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Envelope, Sandbox, SandboxFactory, SandboxId, SandboxState};
use crate::error::SandboxError;
use crate::protocol::ControllerMessage;

/// Owns the single "current sandbox" slot.
///
/// Every frame a sandbox emits is forwarded by a listener task into one
/// shared envelope channel, tagged with the sandbox identity. Creating a
/// sandbox always disposes the previous one first, and disposing aborts
/// its listener, so at most one sandbox can ever feed the channel.
pub struct SandboxManager {
    factory: Arc<dyn SandboxFactory>,
    current: Option<ActiveSandbox>,
    envelope_tx: mpsc::UnboundedSender<Envelope>,
}

struct ActiveSandbox {
    sandbox: Box<dyn Sandbox>,
    listener: JoinHandle<()>,
}

impl SandboxManager {
    /// Returns the manager and the receiving end of the envelope channel.
    pub fn new(factory: Arc<dyn SandboxFactory>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
        let manager = Self {
            factory,
            current: None,
            envelope_tx,
        };
        (manager, envelope_rx)
    }

    /// Disposes the current sandbox (if any), then creates a fresh one,
    /// makes it the Active sandbox and attaches its listener.
    pub fn create_sandbox(&mut self) -> Result<SandboxId, SandboxError> {
        self.dispose_sandbox();

        let id = SandboxId::new();
        let mut sandbox = self.factory.create(id)?;
        let Some(mut frames) = sandbox.take_frames() else {
            sandbox.dispose();
            return Err(SandboxError::Bootstrap(format!(
                "sandbox {id} has no frame stream"
            )));
        };
        sandbox.activate();

        let envelope_tx = self.envelope_tx.clone();
        let listener = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if envelope_tx.send(Envelope { source: id, frame }).is_err() {
                    break;
                }
            }
            debug!("Sandbox {id} listener finished");
        });

        info!("Sandbox {id} created ({})", self.factory.description());
        self.current = Some(ActiveSandbox { sandbox, listener });
        Ok(id)
    }

    /// Detaches the listener and destroys the current sandbox. No-op when
    /// there is none.
    pub fn dispose_sandbox(&mut self) {
        if let Some(mut active) = self.current.take() {
            active.listener.abort();
            active.sandbox.dispose();
            info!("Sandbox {} disposed", active.sandbox.id());
        }
    }

    pub fn active_id(&self) -> Option<SandboxId> {
        self.current.as_ref().map(|active| active.sandbox.id())
    }

    pub fn state(&self) -> Option<SandboxState> {
        self.current.as_ref().map(|active| active.sandbox.state())
    }

    /// Sends `message` to the Active sandbox.
    pub fn post(&self, message: &ControllerMessage) -> Result<(), SandboxError> {
        match &self.current {
            Some(active) => active.sandbox.post(message),
            None => Err(SandboxError::NoSandbox),
        }
    }

    pub fn description(&self) -> String {
        self.factory.description()
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        self.dispose_sandbox();
    }
}
