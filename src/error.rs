use thiserror::Error;

use crate::sandbox::SandboxId;

/// Errors raised by the isolated-execution layer.
///
/// Failures of the code running *inside* a sandbox are never represented
/// here: they travel back as `error` reports and end up as console lines.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The isolated context could not be created (worker binary missing,
    /// thread spawn refused…). Fatal for the `run()` that triggered it.
    #[error("failed to create isolated context: {0}")]
    Spawn(#[source] std::io::Error),

    /// The sandbox's inbox is gone (process exited, thread finished).
    #[error("sandbox {0} is no longer reachable")]
    Closed(SandboxId),

    #[error("no active sandbox")]
    NoSandbox,

    /// The bootstrap program failed to evaluate inside a fresh context.
    #[error("sandbox bootstrap failed: {0}")]
    Bootstrap(String),
}

impl SandboxError {
    /// Returns true for errors that make every later run fail the same way,
    /// so the caller should stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::Spawn(_) | SandboxError::Bootstrap(_))
    }
}
