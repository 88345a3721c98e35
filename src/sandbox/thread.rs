//! Thread isolation: the worker loop on a dedicated OS thread.
//!
//! The JS context never leaves its thread and frames travel over channels.
//! Disposing closes the worker's inbox; a script stuck in a tight loop
//! keeps its thread busy until the loop ends (or hits the configured
//! iteration limit), but nothing it sends is delivered any more.

use std::rc::Rc;
use std::sync::mpsc as std_mpsc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::worker::{self, Outbox, WorkerEvent, WorkerOptions};
use super::{Sandbox, SandboxFactory, SandboxId, SandboxState};
use crate::error::SandboxError;
use crate::protocol::{encode_controller_frame, ControllerMessage};

pub struct ThreadSandboxFactory {
    options: WorkerOptions,
}

impl ThreadSandboxFactory {
    pub fn new(options: WorkerOptions) -> Self {
        Self { options }
    }
}

impl SandboxFactory for ThreadSandboxFactory {
    fn create(&self, id: SandboxId) -> Result<Box<dyn Sandbox>, SandboxError> {
        let (event_tx, event_rx) = std_mpsc::channel::<WorkerEvent>();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
        let loopback = event_tx.clone();
        let options = self.options.clone();

        std::thread::Builder::new()
            .name(format!("sandbox-{id}"))
            .spawn(move || {
                let outbox: Rc<dyn Outbox> = Rc::new(ChannelOutbox(frame_tx));
                if let Err(e) = worker::serve(event_rx, loopback, outbox, options) {
                    error!("Sandbox {id} worker failed: {e}");
                }
            })
            .map_err(SandboxError::Spawn)?;

        Ok(Box::new(ThreadSandbox {
            id,
            state: SandboxState::Created,
            events: event_tx,
            frames: Some(frame_rx),
        }))
    }

    fn description(&self) -> String {
        "thread".to_string()
    }
}

struct ChannelOutbox(mpsc::UnboundedSender<String>);

impl Outbox for ChannelOutbox {
    fn post(&self, frame: String) {
        // Receiver dropped: the sandbox was disposed, nobody listens
        let _ = self.0.send(frame);
    }
}

struct ThreadSandbox {
    id: SandboxId,
    state: SandboxState,
    events: std_mpsc::Sender<WorkerEvent>,
    frames: Option<mpsc::UnboundedReceiver<String>>,
}

impl Sandbox for ThreadSandbox {
    fn id(&self) -> SandboxId {
        self.id
    }

    fn state(&self) -> SandboxState {
        self.state
    }

    fn activate(&mut self) {
        if self.state == SandboxState::Created {
            self.state = SandboxState::Active;
        }
    }

    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.frames.take()
    }

    fn post(&self, message: &ControllerMessage) -> Result<(), SandboxError> {
        if self.state == SandboxState::Disposed {
            return Err(SandboxError::Closed(self.id));
        }
        self.events
            .send(WorkerEvent::Inbound(encode_controller_frame(message)))
            .map_err(|_| SandboxError::Closed(self.id))
    }

    fn dispose(&mut self) {
        if self.state == SandboxState::Disposed {
            return;
        }
        self.state = SandboxState::Disposed;
        self.frames = None;
        if self.events.send(WorkerEvent::Shutdown).is_err() {
            debug!("Sandbox {} worker already stopped", self.id);
        }
    }
}

impl Drop for ThreadSandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}
