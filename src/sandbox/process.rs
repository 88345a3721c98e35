//! Process isolation: each sandbox is a child `sandpad sandbox-worker`.
//!
//! Frames are newline-delimited JSON on the child's stdin/stdout; its
//! stderr is inherited so worker logs show up next to the controller's.
//! Disposing kills the child, which also stops code that never yields.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::worker::WorkerOptions;
use super::{Sandbox, SandboxFactory, SandboxId, SandboxState};
use crate::error::SandboxError;
use crate::protocol::{encode_controller_frame, ControllerMessage};

pub struct ProcessSandboxFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSandboxFactory {
    /// Runs `program sandbox-worker` with flags derived from `options`.
    pub fn new(program: PathBuf, options: &WorkerOptions) -> Self {
        let mut args = vec!["sandbox-worker".to_string()];
        args.extend(options.to_args());
        Self::with_command(program, args)
    }

    /// Runs an arbitrary command speaking the frame protocol on stdio.
    pub fn with_command(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl SandboxFactory for ProcessSandboxFactory {
    fn create(&self, id: SandboxId) -> Result<Box<dyn Sandbox>, SandboxError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(SandboxError::Spawn)?;

        let missing = |what: &str| SandboxError::Spawn(std::io::Error::other(format!("worker {what} not captured")));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        debug!("Sandbox {id} spawned as pid {:?}", child.id());

        // Reader: child stdout → frame channel
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if frame_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Sandbox {id} closed its stdout");
                        break;
                    }
                    Err(e) => {
                        warn!("Sandbox {id} read error: {e}");
                        break;
                    }
                }
            }
        });

        // Writer: inbox → child stdin
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = inbox_rx.recv().await {
                let written = async {
                    stdin.write_all(frame.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    debug!("Sandbox {id} stdin closed: {e}");
                    break;
                }
            }
        });

        Ok(Box::new(ProcessSandbox {
            id,
            state: SandboxState::Created,
            child: Some(child),
            inbox: inbox_tx,
            frames: Some(frame_rx),
            tasks: vec![reader, writer],
        }))
    }

    fn description(&self) -> String {
        format!("process ({})", self.program.display())
    }
}

struct ProcessSandbox {
    id: SandboxId,
    state: SandboxState,
    child: Option<Child>,
    inbox: mpsc::UnboundedSender<String>,
    frames: Option<mpsc::UnboundedReceiver<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Sandbox for ProcessSandbox {
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
        self.inbox
            .send(encode_controller_frame(message))
            .map_err(|_| SandboxError::Closed(self.id))
    }

    fn dispose(&mut self) {
        if self.state == SandboxState::Disposed {
            return;
        }
        self.state = SandboxState::Disposed;
        self.frames = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!("Sandbox {} already exited: {e}", self.id);
            }
            // Reap in the background so the child does not linger as a zombie
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = child.wait().await;
                });
            }
        }
        debug!("Sandbox {} killed", self.id);
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}
