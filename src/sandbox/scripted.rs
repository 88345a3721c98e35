//! In-memory sandboxes driven by the test itself.
//!
//! Frames are injected through a [`ScriptedHandle`], run requests are
//! recorded instead of executed. Lets lifecycle and routing tests run
//! without a JS engine and without timing assumptions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{Sandbox, SandboxFactory, SandboxId, SandboxState};
use crate::error::SandboxError;
use crate::protocol::{encode_sandbox_frame, ControllerMessage, SandboxMessage};

#[derive(Clone, Default)]
pub struct ScriptedFactory {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Default)]
struct Shared {
    handles: Vec<ScriptedHandle>,
    fail: bool,
    auto_ready: bool,
}

/// Test-side view of one scripted sandbox.
#[derive(Clone)]
pub struct ScriptedHandle {
    pub id: SandboxId,
    frames: mpsc::UnboundedSender<String>,
    posted: Arc<Mutex<Vec<ControllerMessage>>>,
    disposed: Arc<AtomicBool>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sandbox announces `ready` as soon as it is created.
    pub fn auto_ready() -> Self {
        let factory = Self::default();
        factory.lock().auto_ready = true;
        factory
    }

    /// Every `create` fails as if the isolated context could not be spawned.
    pub fn failing() -> Self {
        let factory = Self::default();
        factory.lock().fail = true;
        factory
    }

    pub fn created(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn handle(&self, index: usize) -> ScriptedHandle {
        self.lock().handles[index].clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }
}

impl ScriptedHandle {
    pub fn send_raw(&self, frame: &str) {
        // The receiver is gone once the manager detached this sandbox
        let _ = self.frames.send(frame.to_string());
    }

    pub fn send(&self, message: &SandboxMessage) {
        self.send_raw(&encode_sandbox_frame(message));
    }

    pub fn posted(&self) -> Vec<ControllerMessage> {
        self.posted.lock().unwrap().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl SandboxFactory for ScriptedFactory {
    fn create(&self, id: SandboxId) -> Result<Box<dyn Sandbox>, SandboxError> {
        let mut shared = self.lock();
        if shared.fail {
            return Err(SandboxError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "scripted spawn failure",
            )));
        }
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let handle = ScriptedHandle {
            id,
            frames: frames_tx,
            posted: Arc::new(Mutex::new(Vec::new())),
            disposed: Arc::new(AtomicBool::new(false)),
        };
        if shared.auto_ready {
            handle.send(&SandboxMessage::Ready);
        }
        shared.handles.push(handle.clone());
        Ok(Box::new(ScriptedSandbox {
            handle,
            state: SandboxState::Created,
            frames: Some(frames_rx),
        }))
    }

    fn description(&self) -> String {
        "scripted".to_string()
    }
}

struct ScriptedSandbox {
    handle: ScriptedHandle,
    state: SandboxState,
    frames: Option<mpsc::UnboundedReceiver<String>>,
}

impl Sandbox for ScriptedSandbox {
    fn id(&self) -> SandboxId {
        self.handle.id
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
            return Err(SandboxError::Closed(self.handle.id));
        }
        self.handle.posted.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn dispose(&mut self) {
        self.state = SandboxState::Disposed;
        self.frames = None;
        self.handle.disposed.store(true, Ordering::SeqCst);
    }
}
