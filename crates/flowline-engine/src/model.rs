//! Core data model shared by the flow engine components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Opaque, stable identifier of a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FlowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A named, independently checkpointed pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(id: impl Into<FlowId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// One execution unit within a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub flow_id: FlowId,
    pub number: u64,
}

/// Opaque cursor handed to consumers so they can resume a flow.
///
/// Backed by a UUID v7, so checkpoints minted later on the same clock
/// compare greater. Use [`Checkpoint::mint_after`] where ordering must hold
/// even if the wall clock stepped back, e.g. across a restart.
/// [`Checkpoint::ZERO`] (the nil UUID) means "nothing consumed yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(Uuid);

impl Checkpoint {
    pub const ZERO: Checkpoint = Checkpoint(Uuid::nil());

    /// Mint a fresh checkpoint from the wall clock
    pub fn mint() -> Self {
        Self(Uuid::now_v7())
    }

    /// Mint a checkpoint that compares greater than `previous`
    ///
    /// Normally this is a fresh clock-based checkpoint. If the clock is
    /// behind `previous`, the result is `previous` plus one instead.
    pub fn mint_after(previous: Checkpoint) -> Self {
        let fresh = Self::mint();
        if fresh > previous {
            fresh
        } else {
            Self(Uuid::from_u128(previous.0.as_u128().saturating_add(1)))
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<Uuid> for Checkpoint {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::ZERO
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable cursor and run history of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub flow_id: FlowId,
    pub checkpoint: Checkpoint,
    #[serde(default)]
    pub runs: Vec<ProcessFlowState>,
}

impl ProcessState {
    pub fn new(flow_id: FlowId) -> Self {
        Self {
            flow_id,
            checkpoint: Checkpoint::ZERO,
            runs: Vec::new(),
        }
    }

    /// Checkpoint reached by the most recent run that pulled from `source`
    pub fn last_checkpoint(&self, source: &str) -> Checkpoint {
        self.runs
            .iter()
            .rev()
            .find(|run| run.source == source)
            .map(|run| run.checkpoint)
            .unwrap_or(Checkpoint::ZERO)
    }

    /// Step number the next package of this flow will carry
    pub fn next_step(&self) -> u64 {
        self.runs.len() as u64 + 1
    }

    /// Append a finished run; the flow checkpoint never moves backwards
    pub fn record_run(&mut self, run: ProcessFlowState) {
        if run.checkpoint > self.checkpoint {
            self.checkpoint = run.checkpoint;
        }
        self.runs.push(run);
    }
}

/// Statistics for one pipeline run over one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessFlowState {
    pub flow_id: FlowId,
    /// Source adapter the run pulled from
    pub source: String,
    pub checkpoint: Checkpoint,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub host: String,
    pub user: String,
    pub entities_processed: usize,
    pub entities_invalid: usize,
    pub error_count: usize,
    /// Storage key of the package this run wrote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PathBuf>,
}

impl ProcessFlowState {
    pub fn begin(flow_id: FlowId, source: impl Into<String>) -> Self {
        Self {
            flow_id,
            source: source.into(),
            checkpoint: Checkpoint::ZERO,
            started_at: Utc::now(),
            ended_at: None,
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            entities_processed: 0,
            entities_invalid: 0,
            error_count: 0,
            package: None,
        }
    }

    pub fn finish(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = checkpoint;
        self.ended_at = Some(Utc::now());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Reason a record failed an entity rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

/// A record that failed validation, with every rule it broke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidRecord<T> {
    pub record: T,
    pub errors: Vec<ValidationError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessErrorKind {
    /// Unexpected failure while handling a record
    Exception,
    /// Record-level check reported by the per-record function
    Validation,
    /// Record was handled but the end-of-run commit failed
    FailedToCommit,
}

/// Process-level error attached to a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    pub message: String,
    /// Position of the offending record in its input, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<usize>,
}

impl ProcessError {
    pub fn exception(record: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            kind: ProcessErrorKind::Exception,
            message: message.into(),
            record,
        }
    }

    pub fn validation(record: usize, message: impl Into<String>) -> Self {
        Self {
            kind: ProcessErrorKind::Validation,
            message: message.into(),
            record: Some(record),
        }
    }

    pub fn failed_to_commit(record: usize, reason: &str) -> Self {
        Self {
            kind: ProcessErrorKind::FailedToCommit,
            message: format!("failed to commit: {}", reason),
            record: Some(record),
        }
    }
}

/// Immutable output unit of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package<T> {
    pub flow_id: FlowId,
    pub step: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub valid: Vec<T>,
    pub invalid: Vec<InvalidRecord<T>>,
    pub errors: Vec<ProcessError>,
}

impl<T> Package<T> {
    pub fn new(flow_id: FlowId, step: u64, name: impl Into<String>) -> Self {
        Self {
            flow_id,
            step,
            name: name.into(),
            created_at: Utc::now(),
            valid: Vec::new(),
            invalid: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Package carrying only valid records, as produced by a source pull
    pub fn of_records(flow_id: FlowId, name: impl Into<String>, records: Vec<T>) -> Self {
        let mut package = Self::new(flow_id, 0, name);
        package.valid = records;
        package
    }

    /// Number of input records this package accounts for
    pub fn record_count(&self) -> usize {
        self.valid.len()
            + self.invalid.len()
            + self.errors.iter().filter(|e| e.record.is_some()).count()
    }
}

/// One page pulled from a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse<T> {
    pub checkpoint_from: Checkpoint,
    pub checkpoint_to: Checkpoint,
    /// Internal source offset reached after this page
    pub local_index: u64,
    pub package: Package<T>,
}

impl<T> QueryResponse<T> {
    pub fn records(&self) -> &[T] {
        &self.package.valid
    }

    pub fn into_records(self) -> Vec<T> {
        self.package.valid
    }

    pub fn is_empty(&self) -> bool {
        self.package.valid.is_empty()
    }
}

/// Ledger row mapping an external checkpoint to an internal source offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponseState {
    pub flow_id: FlowId,
    pub consumer_id: String,
    pub local_index: u64,
    pub checkpoint: Checkpoint,
    pub recorded_at: DateTime<Utc>,
}

/// Result of transforming one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub target_address: String,
    pub records_written: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A version of a source file: its path plus, when known, its modification time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowFile {
    pub path: PathBuf,
    pub modified: Option<DateTime<Utc>>,
}

impl FlowFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            modified: None,
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Same path and same version; a side without a timestamp matches on path alone
    fn matches(&self, path: &Path, modified: Option<DateTime<Utc>>) -> bool {
        self.path == path
            && match (self.modified, modified) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl From<PathBuf> for FlowFile {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

/// Record that a source file has been ingested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileLogEntry {
    pub source_path: PathBuf,
    /// Modification time of the ingested version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified: Option<DateTime<Utc>>,
    pub source_entity_type: String,
    pub target_entity_type: String,
    pub target_address: String,
    pub batch_number: u64,
    pub processed_at: DateTime<Utc>,
}

/// Consecutive failures of one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Version that failed; a new version of the file starts a fresh count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: String,
    pub last_attempt: DateTime<Utc>,
    #[serde(default)]
    pub quarantined: bool,
}

/// Persisted log of a file ingestion flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFileLog {
    pub flow_code: String,
    #[serde(default)]
    pub last_batch: u64,
    #[serde(default)]
    pub entries: Vec<SourceFileLogEntry>,
    #[serde(default)]
    pub failures: BTreeMap<String, FailureRecord>,
}

impl SourceFileLog {
    pub fn new(flow_code: impl Into<String>) -> Self {
        Self {
            flow_code: flow_code.into(),
            last_batch: 0,
            entries: Vec::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Whether this version of the file was ingested
    pub fn contains(&self, file: &FlowFile) -> bool {
        self.entries
            .iter()
            .any(|e| file.matches(&e.source_path, e.source_modified))
    }

    pub fn is_quarantined(&self, file: &FlowFile) -> bool {
        self.failures
            .get(&failure_key(&file.path))
            .is_some_and(|f| f.quarantined && file.matches(&file.path, f.source_modified))
    }

    /// Whether a controller must skip `file`: already ingested or quarantined
    pub fn is_known(&self, file: &FlowFile) -> bool {
        self.contains(file) || self.is_quarantined(file)
    }

    /// Mint the next batch of this flow
    pub fn next_batch(&mut self, flow_id: &FlowId) -> Batch {
        self.last_batch += 1;
        Batch {
            flow_id: flow_id.clone(),
            number: self.last_batch,
        }
    }

    pub fn append(&mut self, entry: SourceFileLogEntry) {
        self.failures.remove(&failure_key(&entry.source_path));
        self.entries.push(entry);
    }

    /// Count a failure of `file`; returns true when it newly crosses `threshold`
    pub fn record_failure(&mut self, file: &FlowFile, error: &str, threshold: Option<u32>) -> bool {
        let record = self
            .failures
            .entry(failure_key(&file.path))
            .or_insert_with(|| FailureRecord {
                source_modified: file.modified,
                consecutive_failures: 0,
                last_error: String::new(),
                last_attempt: Utc::now(),
                quarantined: false,
            });

        if record.source_modified != file.modified {
            record.source_modified = file.modified;
            record.consecutive_failures = 0;
            record.quarantined = false;
        }

        record.consecutive_failures += 1;
        record.last_error = error.to_string();
        record.last_attempt = Utc::now();

        let newly_quarantined = !record.quarantined
            && threshold.is_some_and(|max| record.consecutive_failures >= max);
        if newly_quarantined {
            record.quarantined = true;
        }
        newly_quarantined
    }

    pub fn failure(&self, path: &Path) -> Option<&FailureRecord> {
        self.failures.get(&failure_key(path))
    }
}

fn failure_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
