//! Output sink: the append-only console pane.
//!
//! Lines are rendered with a fixed-width bracketed prefix so the text of
//! every kind starts in the same column:
//!
//! ```text
//! [log]   hello
//! [warn]  careful
//! [error] Error: boom
//! ```

use std::io::{IsTerminal, Write};

use serde::{Deserialize, Serialize};

/// Kind of a console line. Also the `m` field of a console report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Log,
    Info,
    Warn,
    Error,
}

impl LogKind {
    /// Bracketed tag padded to 8 columns.
    pub fn prefix(self) -> &'static str {
        match self {
            LogKind::Log => "[log]   ",
            LogKind::Info => "[info]  ",
            LogKind::Warn => "[warn]  ",
            LogKind::Error => "[error] ",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Log => "log",
            LogKind::Info => "info",
            LogKind::Warn => "warn",
            LogKind::Error => "error",
        }
    }
}

/// One rendered unit of output. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub kind: LogKind,
    pub text: String,
}

impl LogLine {
    /// The line as displayed, without the trailing newline.
    pub fn render(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.text)
    }
}

/// Write-only destination for console lines.
pub trait OutputSink: Send {
    fn append(&mut self, kind: LogKind, text: &str);

    /// Empties the sink wholesale.
    fn clear(&mut self);
}

// ── In-memory buffer ─────────────────────────────────────

/// Keeps every line in memory. No line limit: growth is the caller's concern.
#[derive(Debug, Default)]
pub struct ConsoleBuffer {
    lines: Vec<LogLine>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Full pane text: each line followed by `\n`.
    pub fn contents(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.render());
            out.push('\n');
        }
        out
    }
}

impl OutputSink for ConsoleBuffer {
    fn append(&mut self, kind: LogKind, text: &str) {
        self.lines.push(LogLine {
            kind,
            text: text.to_string(),
        });
    }

    fn clear(&mut self) {
        self.lines.clear();
    }
}

// ── Terminal ─────────────────────────────────────────────

/// Prints each line as soon as it is appended.
///
/// `clear()` wipes the screen when the writer is a terminal and prints a
/// separator otherwise, since piped output cannot be taken back.
pub struct TerminalSink<W: Write + Send> {
    writer: W,
    is_tty: bool,
}

impl TerminalSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        let stdout = std::io::stdout();
        let is_tty = stdout.is_terminal();
        Self {
            writer: stdout,
            is_tty,
        }
    }
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            is_tty: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OutputSink for TerminalSink<W> {
    fn append(&mut self, kind: LogKind, text: &str) {
        let line = LogLine {
            kind,
            text: text.to_string(),
        };
        if let Err(e) = writeln!(self.writer, "{}", line.render()).and_then(|_| self.writer.flush()) {
            tracing::warn!("Console write failed: {e}");
        }
    }

    fn clear(&mut self) {
        let result = if self.is_tty {
            // ANSI: erase display, cursor home
            write!(self.writer, "\x1b[2J\x1b[H")
        } else {
            writeln!(self.writer, "── console cleared ──")
        };
        if let Err(e) = result.and_then(|_| self.writer.flush()) {
            tracing::warn!("Console clear failed: {e}");
        }
    }
}
