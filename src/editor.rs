use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Supplies the source text of a run.
#[async_trait]
pub trait SourceEditor: Send + Sync {
    async fn source_text(&self) -> Result<String>;

    /// Shown in logs
    fn name(&self) -> String;
}

/// The script lives in a file edited with the user's own editor. It is
/// re-read on every run, so saving and hitting `/run` picks up changes.
pub struct FileEditor {
    path: PathBuf,
}

impl FileEditor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceEditor for FileEditor {
    async fn source_text(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("cannot read script {}", self.path.display()))
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Fixed source text, for `-e`-style one-liners and tests.
pub struct InlineEditor {
    source: String,
}

impl InlineEditor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl SourceEditor for InlineEditor {
    async fn source_text(&self) -> Result<String> {
        Ok(self.source.clone())
    }

    fn name(&self) -> String {
        "<inline>".to_string()
    }
}
