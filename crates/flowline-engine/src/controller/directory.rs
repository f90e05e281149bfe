//! Inbox directory controller
//!
//! Lists an inbox directory, oldest file first, and hands each file to a
//! [`FileHandler`] that writes the transformed output under a target
//! directory. Output names are derived from the batch number, so handling
//! the same file again overwrites its previous output.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use super::FlowController;
use crate::model::{Batch, FlowFile, ProcessResult, SourceFileLog};

/// Transforms one source file into output under `target_dir`
#[async_trait]
pub trait FileHandler: Send + Sync {
    async fn handle(
        &self,
        source: &Path,
        target_dir: &Path,
        batch: &Batch,
    ) -> anyhow::Result<Option<ProcessResult>>;
}

/// Copies the file verbatim
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFileHandler;

#[async_trait]
impl FileHandler for CopyFileHandler {
    async fn handle(
        &self,
        source: &Path,
        target_dir: &Path,
        batch: &Batch,
    ) -> anyhow::Result<Option<ProcessResult>> {
        let file_name = source
            .file_name()
            .with_context(|| format!("{} has no file name", source.display()))?;
        let target = target_dir.join(format!("{:08}-{}", batch.number, file_name.to_string_lossy()));

        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;
        write_atomic(&target, &bytes).await?;

        Ok(Some(ProcessResult {
            target_address: target.display().to_string(),
            records_written: 1,
            message: Some(format!("copied {} bytes", bytes.len())),
        }))
    }
}

/// Parses newline-delimited JSON and writes the records as one JSON array
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesHandler;

#[async_trait]
impl FileHandler for JsonLinesHandler {
    async fn handle(
        &self,
        source: &Path,
        target_dir: &Path,
        batch: &Batch,
    ) -> anyhow::Result<Option<ProcessResult>> {
        let raw = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;

        let records = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str::<serde_json::Value>(line)
                    .with_context(|| format!("{}:{}: invalid JSON", source.display(), n + 1))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "records".to_string());
        let target = target_dir.join(format!("{:08}-{}.json", batch.number, stem));
        write_atomic(&target, &serde_json::to_vec_pretty(&records)?).await?;

        Ok(Some(ProcessResult {
            target_address: target.display().to_string(),
            records_written: records.len(),
            message: None,
        }))
    }
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, target)
        .await
        .with_context(|| format!("Failed to move output into {}", target.display()))?;
    Ok(())
}

/// [`FlowController`] over an inbox directory
pub struct DirectoryFlowController {
    flow_code: String,
    inbox: PathBuf,
    target_dir: PathBuf,
    extension: Option<String>,
    source_entity_type: String,
    target_entity_type: String,
    handler: Arc<dyn FileHandler>,
}

impl DirectoryFlowController {
    pub fn new(
        flow_code: impl Into<String>,
        inbox: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        handler: Arc<dyn FileHandler>,
    ) -> Self {
        Self {
            flow_code: flow_code.into(),
            inbox: inbox.into(),
            target_dir: target_dir.into(),
            extension: None,
            source_entity_type: "file".to_string(),
            target_entity_type: "file".to_string(),
            handler,
        }
    }

    /// Only pick up files with this extension (case-insensitive, leading dot optional)
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        self.extension = Some(extension.trim_start_matches('.').to_ascii_lowercase());
        self
    }

    pub fn with_entity_types(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_entity_type = source.into();
        self.target_entity_type = target.into();
        self
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    fn matches_extension(&self, path: &Path) -> bool {
        match &self.extension {
            None => true,
            Some(wanted) => path
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(wanted)),
        }
    }

    /// Candidate files, oldest first; ties broken by path
    async fn candidates(&self) -> anyhow::Result<Vec<(Option<SystemTime>, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.inbox).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(inbox = %self.inbox.display(), "Inbox does not exist");
                return Ok(Vec::new());
            },
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.inbox.display()));
            },
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if !metadata.is_file() || !self.matches_extension(&path) {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            files.push((metadata.modified().ok(), path));
        }

        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl FlowController for DirectoryFlowController {
    fn flow_code(&self) -> &str {
        &self.flow_code
    }

    fn source_entity_type(&self) -> &str {
        &self.source_entity_type
    }

    fn target_entity_type(&self) -> &str {
        &self.target_entity_type
    }

    async fn next_flow_file(&self, log: &SourceFileLog) -> anyhow::Result<Option<FlowFile>> {
        let candidates = self.candidates().await?;
        let total = candidates.len();
        let next = candidates
            .into_iter()
            .map(|(modified, path)| match modified {
                Some(modified) => FlowFile::new(path).with_modified(DateTime::<Utc>::from(modified)),
                None => FlowFile::new(path),
            })
            .find(|file| !log.is_known(file));

        debug!(inbox = %self.inbox.display(), candidates = total, found = next.is_some(), "Inbox scanned");
        Ok(next)
    }

    async fn process(&self, path: &Path, batch: &Batch) -> anyhow::Result<Option<ProcessResult>> {
        self.handler.handle(path, &self.target_dir, batch).await
    }
}
