//! Message Bridge: turns envelopes from sandboxes into console lines.

use tracing::{debug, warn};

use crate::console::{LogKind, OutputSink};
use crate::format::ValueFormatter;
use crate::protocol::{decode_sandbox_frame, SandboxMessage};
use crate::sandbox::{Envelope, SandboxId};

/// What happened to one delivered envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// One line was appended to the sink.
    Appended,
    /// The Active sandbox announced it is ready for a run request.
    Ready(SandboxId),
    /// Stale source or unknown tag.
    Discarded,
}

pub struct MessageBridge<S: OutputSink> {
    sink: S,
    formatter: ValueFormatter,
}

impl<S: OutputSink> MessageBridge<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            formatter: ValueFormatter::new(),
        }
    }

    /// Processes one envelope. `active` is the identity of the current
    /// sandbox; anything from another source is dropped unread.
    pub fn deliver(&mut self, active: Option<SandboxId>, envelope: Envelope) -> Delivery {
        if active != Some(envelope.source) {
            debug!("Dropping frame from stale sandbox {}", envelope.source);
            return Delivery::Discarded;
        }

        let message = match decode_sandbox_frame(&envelope.frame) {
            Ok(message) => message,
            Err(e) => {
                // Still one line: output of the Active sandbox never vanishes
                warn!("Malformed frame from sandbox {}: {e}", envelope.source);
                self.sink
                    .append(LogKind::Warn, &format!("[unreadable sandbox output: {e}]"));
                return Delivery::Appended;
            }
        };

        match message {
            SandboxMessage::Console(report) => {
                let text = self.formatter.format_args(&report.args);
                self.sink.append(report.level, &text);
                Delivery::Appended
            }
            SandboxMessage::Error(description) => {
                self.sink.append(LogKind::Error, &description);
                Delivery::Appended
            }
            SandboxMessage::Ready => Delivery::Ready(envelope.source),
            SandboxMessage::Unknown(tag) => {
                debug!("Ignoring frame with tag '{tag}' from sandbox {}", envelope.source);
                Delivery::Discarded
            }
        }
    }

    /// Appends a line that does not come from a sandbox (watchdog notices).
    pub fn notice(&mut self, kind: LogKind, text: &str) {
        self.sink.append(kind, text);
    }

    pub fn clear(&mut self) {
        self.sink.clear();
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
