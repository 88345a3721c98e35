//! Run Orchestrator: the controller's event loop.
//!
//! One task owns the [`Playground`]. Every input (UI commands, envelopes
//! from the sandbox, the ready deadline, the watchdog) is handled one at a
//! time, so no state here needs locking.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bridge::{Delivery, MessageBridge};
use crate::config::SandboxConfig;
use crate::console::{LogKind, OutputSink};
use crate::editor::SourceEditor;
use crate::error::SandboxError;
use crate::protocol::ControllerMessage;
use crate::sandbox::{Envelope, SandboxFactory, SandboxId, SandboxManager};

/// UI wiring: what the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    Run,
    Clear,
    Stop,
    Help,
    Quit,
}

impl UiEvent {
    /// Parses one interactive command line (`/run`, `/clear`, …).
    pub fn parse(line: &str) -> Result<Self, String> {
        match line.trim() {
            "/run" | "/r" => Ok(UiEvent::Run),
            "/clear" | "/c" => Ok(UiEvent::Clear),
            "/stop" | "/s" => Ok(UiEvent::Stop),
            "/help" | "/h" | "/?" => Ok(UiEvent::Help),
            "/quit" | "/q" | "/exit" => Ok(UiEvent::Quit),
            other => Err(format!("Unknown command: {other} (try /help)")),
        }
    }
}

/// A run request held back until its sandbox says it is ready.
struct PendingRun {
    id: SandboxId,
    source: String,
    deadline: Instant,
}

struct Watchdog {
    id: SandboxId,
    deadline: Instant,
}

enum Wake {
    Envelope(Option<Envelope>),
    ReadyTimeout,
    Watchdog,
}

pub struct Playground<S: OutputSink> {
    manager: SandboxManager,
    bridge: MessageBridge<S>,
    envelopes: mpsc::UnboundedReceiver<Envelope>,
    pending: Option<PendingRun>,
    watchdog: Option<Watchdog>,
    ready_timeout: Duration,
    watchdog_after: Option<Duration>,
}

impl<S: OutputSink> Playground<S> {
    pub fn new(factory: Arc<dyn SandboxFactory>, sink: S, config: &SandboxConfig) -> Self {
        let (manager, envelopes) = SandboxManager::new(factory);
        Self {
            manager,
            bridge: MessageBridge::new(sink),
            envelopes,
            pending: None,
            watchdog: None,
            ready_timeout: config.ready_timeout(),
            watchdog_after: config.watchdog(),
        }
    }

    /// Starts a run of `source` in a brand-new sandbox and returns at once.
    /// The request itself goes out when the sandbox reports ready.
    pub fn run(&mut self, source: String) -> Result<SandboxId, SandboxError> {
        self.pending = None;
        self.watchdog = None;
        let id = self.manager.create_sandbox()?;
        self.pending = Some(PendingRun {
            id,
            source,
            deadline: Instant::now() + self.ready_timeout,
        });
        Ok(id)
    }

    pub fn clear(&mut self) {
        self.bridge.clear();
    }

    /// Disposes the current sandbox; nothing it sends later is shown.
    pub fn stop(&mut self) {
        self.pending = None;
        self.watchdog = None;
        self.manager.dispose_sandbox();
    }

    pub fn active_id(&self) -> Option<SandboxId> {
        self.manager.active_id()
    }

    pub fn sink(&self) -> &S {
        self.bridge.sink()
    }

    /// Waits for the next input and handles it. Returns false once no
    /// envelope can arrive any more.
    pub async fn step(&mut self) -> bool {
        let ready_deadline = self.pending.as_ref().map(|pending| pending.deadline);
        let watchdog_deadline = self.watchdog.as_ref().map(|watchdog| watchdog.deadline);

        let wake = tokio::select! {
            envelope = self.envelopes.recv() => Wake::Envelope(envelope),
            _ = sleep_until(ready_deadline) => Wake::ReadyTimeout,
            _ = sleep_until(watchdog_deadline) => Wake::Watchdog,
        };

        match wake {
            Wake::Envelope(Some(envelope)) => self.on_envelope(envelope),
            Wake::Envelope(None) => return false,
            Wake::ReadyTimeout => {
                if let Some(pending) = self.pending.take() {
                    warn!(
                        "Sandbox {} not ready after {}ms, sending run request anyway",
                        pending.id,
                        self.ready_timeout.as_millis()
                    );
                    self.dispatch(pending);
                }
            }
            Wake::Watchdog => {
                if let Some(watchdog) = self.watchdog.take() {
                    self.on_watchdog(watchdog);
                }
            }
        }
        true
    }

    /// Handles inputs until nothing happened for `quiet` and no run request
    /// is still waiting for its sandbox.
    pub async fn settle(&mut self, quiet: Duration) {
        loop {
            if self.pending.is_some() {
                if !self.step().await {
                    return;
                }
                continue;
            }
            match tokio::time::timeout(quiet, self.step()).await {
                Ok(true) => continue,
                Ok(false) | Err(_) => return,
            }
        }
    }

    /// Interactive loop: runs the editor's script once, then reacts to UI
    /// commands until `Quit` or until the command channel closes.
    pub async fn serve(
        &mut self,
        editor: &dyn SourceEditor,
        mut commands: mpsc::Receiver<UiEvent>,
    ) -> Result<()> {
        self.run_from(editor).await?;

        loop {
            let command = tokio::select! {
                command = commands.recv() => command,
                open = self.step() => {
                    if !open {
                        return Ok(());
                    }
                    continue;
                }
            };

            match command {
                Some(UiEvent::Run) => self.run_from(editor).await?,
                Some(UiEvent::Clear) => self.clear(),
                Some(UiEvent::Stop) => {
                    info!("Stopping current sandbox");
                    self.stop();
                }
                // Printed by the command reader itself
                Some(UiEvent::Help) => {}
                Some(UiEvent::Quit) | None => {
                    info!("Leaving playground");
                    self.stop();
                    return Ok(());
                }
            }
        }
    }

    /// Reads the editor and starts a run. Only fatal sandbox errors are
    /// returned; an unreadable script is reported and skipped.
    async fn run_from(&mut self, editor: &dyn SourceEditor) -> Result<()> {
        let source = match editor.source_text().await {
            Ok(source) => source,
            Err(e) => {
                error!("{e:#}");
                return Ok(());
            }
        };
        match self.run(source) {
            Ok(id) => {
                info!("Running {} in sandbox {id}", editor.name());
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("Run failed: {e}");
                Ok(())
            }
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        let active = self.manager.active_id();
        match self.bridge.deliver(active, envelope) {
            Delivery::Ready(id) => match self.pending.take() {
                Some(pending) if pending.id == id => self.dispatch(pending),
                other => {
                    self.pending = other;
                    debug!("Sandbox {id} ready, no run request waiting");
                }
            },
            Delivery::Appended | Delivery::Discarded => {}
        }
    }

    fn dispatch(&mut self, pending: PendingRun) {
        let message = ControllerMessage::Run {
            code: pending.source,
        };
        match self.manager.post(&message) {
            Ok(()) => {
                debug!("Run request sent to sandbox {}", pending.id);
                if let Some(after) = self.watchdog_after {
                    self.watchdog = Some(Watchdog {
                        id: pending.id,
                        deadline: Instant::now() + after,
                    });
                }
            }
            Err(e) => warn!("Cannot send run request: {e}"),
        }
    }

    fn on_watchdog(&mut self, watchdog: Watchdog) {
        if self.manager.active_id() != Some(watchdog.id) {
            return;
        }
        let millis = self.watchdog_after.map(|d| d.as_millis()).unwrap_or_default();
        warn!("Sandbox {} still running after {millis}ms, disposing it", watchdog.id);
        self.manager.dispose_sandbox();
        self.bridge.notice(
            LogKind::Warn,
            &format!("Execution stopped after {millis} ms (watchdog)"),
        );
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
