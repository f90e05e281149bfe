//! File ingestion controller
//!
//! [`FlowControllerService`] polls a pluggable [`FlowController`] for the
//! next unconsumed source file, processes at most one file per tick and
//! records each ingested path and modification time in the flow's
//! [`SourceFileLog`], which is what keeps a file version from being consumed
//! twice. A file rewritten at an ingested path is a new version.
//!
//! A file whose processing fails gets no log entry and is offered again on
//! the next tick. With `max_consecutive_failures` set, a file that keeps
//! failing is quarantined instead.

pub mod directory;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_common::{FlowError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::model::{Batch, FlowFile, FlowId, ProcessResult, SourceFileLog, SourceFileLogEntry};
use crate::schedule::{spawn_interval, ScheduleHandle, TickGuard};
use crate::storage::StateRepository;

pub use directory::{CopyFileHandler, DirectoryFlowController, FileHandler, JsonLinesHandler};
pub use registry::ControllerRegistry;

/// Capacity of the tick event channel; slow subscribers lose the oldest events
const EVENT_CAPACITY: usize = 64;

/// Domain-specific side of a file ingestion flow
#[async_trait]
pub trait FlowController: Send + Sync {
    fn flow_code(&self) -> &str;

    fn source_entity_type(&self) -> &str;

    fn target_entity_type(&self) -> &str;

    /// Next file to ingest; files for which `log.is_known` holds must be skipped.
    /// Controllers that can see modification times should report them.
    async fn next_flow_file(&self, log: &SourceFileLog) -> anyhow::Result<Option<FlowFile>>;

    /// Transform one file. `None` declines the file without consuming it.
    ///
    /// May be called again for the same file after a failure, so it must be
    /// safe to repeat.
    async fn process(&self, path: &Path, batch: &Batch) -> anyhow::Result<Option<ProcessResult>>;
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another tick was still running
    Skipped,
    /// No unconsumed file was found
    Idle,
    Processed {
        path: PathBuf,
        batch: Batch,
        result: ProcessResult,
    },
    /// The controller returned no result; the file stays unconsumed
    Declined { path: PathBuf },
    Failed {
        path: Option<PathBuf>,
        error: String,
        /// The file was quarantined by this failure
        quarantined: bool,
    },
}

/// Broadcast after every tick that was not skipped
#[derive(Debug, Clone, PartialEq)]
pub struct TickEvent {
    pub flow_code: String,
    /// Value of the processed counter after this tick
    pub tick: u64,
    pub outcome: TickOutcome,
    pub at: DateTime<Utc>,
}

pub struct FlowControllerService {
    controller: Arc<dyn FlowController>,
    repo: StateRepository,
    flow_id: FlowId,
    poll_interval: Duration,
    max_consecutive_failures: Option<u32>,
    guard: TickGuard,
    processed: AtomicU64,
    events: broadcast::Sender<TickEvent>,
}

impl FlowControllerService {
    pub fn new(controller: Arc<dyn FlowController>, repo: StateRepository, config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            flow_id: FlowId::new(controller.flow_code()),
            controller,
            repo,
            poll_interval: config.poll_interval(),
            max_consecutive_failures: config.max_consecutive_failures,
            guard: TickGuard::new(),
            processed: AtomicU64::new(0),
            events,
        }
    }

    pub fn flow_code(&self) -> &str {
        self.controller.flow_code()
    }

    /// Number of ticks that ran, whatever their outcome
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TickEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_busy()
    }

    /// Current persisted file log
    pub async fn file_log(&self) -> Result<SourceFileLog> {
        self.repo.load_file_log(self.flow_code()).await
    }

    /// Run one poll cycle. Never fails; errors are logged and reported in the outcome.
    #[instrument(skip(self), fields(flow = %self.flow_id))]
    pub async fn tick(&self) -> TickOutcome {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!("Previous tick still in flight, skipping");
            return TickOutcome::Skipped;
        };

        let outcome = match self.poll().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Poll cycle failed");
                TickOutcome::Failed {
                    path: None,
                    error: e.to_string(),
                    quarantined: false,
                }
            },
        };

        let tick = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is not an error
        let _ = self.events.send(TickEvent {
            flow_code: self.flow_code().to_string(),
            tick,
            outcome: outcome.clone(),
            at: Utc::now(),
        });

        outcome
    }

    /// Poll on a timer until the returned handle is stopped
    pub fn start(self: Arc<Self>) -> Result<ScheduleHandle> {
        if self.poll_interval.is_zero() {
            return Err(FlowError::config(format!(
                "flow '{}': poll interval must be greater than 0",
                self.flow_code()
            )));
        }

        let name = format!("controller:{}", self.flow_code());
        let period = self.poll_interval;
        let service = self;

        Ok(spawn_interval(name, period, move || {
            let service = Arc::clone(&service);
            async move {
                service.tick().await;
            }
        }))
    }

    async fn poll(&self) -> Result<TickOutcome> {
        let mut log = self.repo.load_file_log(self.flow_code()).await?;

        let Some(file) = self
            .controller
            .next_flow_file(&log)
            .await
            .map_err(FlowError::Other)?
        else {
            debug!("No new files");
            return Ok(TickOutcome::Idle);
        };

        if log.is_known(&file) {
            warn!(path = %file.path.display(), "Controller offered a known file, ignoring it");
            return Ok(TickOutcome::Idle);
        }
        let path = file.path.clone();

        let batch = log.next_batch(&self.flow_id);
        debug!(path = %path.display(), batch = batch.number, "Processing file");

        match self.controller.process(&path, &batch).await {
            Ok(Some(result)) => {
                log.append(SourceFileLogEntry {
                    source_path: path.clone(),
                    source_modified: file.modified,
                    source_entity_type: self.controller.source_entity_type().to_string(),
                    target_entity_type: self.controller.target_entity_type().to_string(),
                    target_address: result.target_address.clone(),
                    batch_number: batch.number,
                    processed_at: Utc::now(),
                });
                self.repo.save_file_log(&log).await?;

                info!(
                    path = %path.display(),
                    batch = batch.number,
                    target = %result.target_address,
                    records = result.records_written,
                    "File ingested"
                );
                Ok(TickOutcome::Processed { path, batch, result })
            },
            Ok(None) => {
                debug!(path = %path.display(), "Controller declined file");
                Ok(TickOutcome::Declined { path })
            },
            Err(e) => {
                let message = format!("{:#}", e);
                error!(path = %path.display(), error = %message, "File processing failed");

                let quarantined =
                    log.record_failure(&file, &message, self.max_consecutive_failures);
                if quarantined {
                    warn!(
                        path = %path.display(),
                        failures = log.failure(&path).map(|f| f.consecutive_failures).unwrap_or_default(),
                        "File quarantined after repeated failures"
                    );
                }
                self.repo.save_file_log(&log).await?;

                Ok(TickOutcome::Failed {
                    path: Some(path),
                    error: message,
                    quarantined,
                })
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Offers a fixed list of paths; paths listed in `failing` error out
    struct ListController {
        files: Vec<PathBuf>,
        failing: HashSet<PathBuf>,
        declined: HashSet<PathBuf>,
        calls: Mutex<Vec<(PathBuf, u64)>>,
    }

    impl ListController {
        fn new(files: &[&str]) -> Self {
            Self {
                files: files.iter().map(PathBuf::from).collect(),
                failing: HashSet::new(),
                declined: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FlowController for ListController {
        fn flow_code(&self) -> &str {
            "inbox"
        }

        fn source_entity_type(&self) -> &str {
            "csv"
        }

        fn target_entity_type(&self) -> &str {
            "asset"
        }

        async fn next_flow_file(&self, log: &SourceFileLog) -> anyhow::Result<Option<FlowFile>> {
            Ok(self
                .files
                .iter()
                .map(|p| FlowFile::new(p.clone()))
                .find(|f| !log.is_known(f)))
        }

        async fn process(&self, path: &Path, batch: &Batch) -> anyhow::Result<Option<ProcessResult>> {
            self.calls.lock().unwrap().push((path.to_path_buf(), batch.number));
            if self.failing.contains(path) {
                anyhow::bail!("cannot parse {}", path.display());
            }
            if self.declined.contains(path) {
                return Ok(None);
            }
            Ok(Some(ProcessResult {
                target_address: format!("out/{}", path.display()),
                records_written: 1,
                message: None,
            }))
        }
    }

    fn service(controller: ListController, threshold: Option<u32>) -> (Arc<ListController>, FlowControllerService) {
        let controller = Arc::new(controller);
        let config = EngineConfig {
            max_consecutive_failures: threshold,
            ..Default::default()
        };
        let repo = StateRepository::new(Arc::new(MemoryStorage::new()));
        let service = FlowControllerService::new(controller.clone(), repo, &config);
        (controller, service)
    }

    #[tokio::test]
    async fn test_processes_one_file_per_tick_then_idles() {
        let (controller, service) = service(ListController::new(&["a.csv", "b.csv"]), None);

        assert!(matches!(service.tick().await, TickOutcome::Processed { ref path, .. } if path == Path::new("a.csv")));
        assert!(matches!(service.tick().await, TickOutcome::Processed { ref batch, .. } if batch.number == 2));
        assert_eq!(service.tick().await, TickOutcome::Idle);

        let log = service.file_log().await.unwrap();
        assert_eq!(log.entries.len(), 2);
        assert_eq!(log.entries[0].target_entity_type, "asset");
        assert_eq!(controller.calls.lock().unwrap().len(), 2);
        assert_eq!(service.processed(), 3);
    }

    #[tokio::test]
    async fn test_failed_file_is_retried_without_log_entry() {
        let mut controller = ListController::new(&["bad.csv"]);
        controller.failing.insert(PathBuf::from("bad.csv"));
        let (controller, service) = service(controller, None);

        for _ in 0..3 {
            assert!(matches!(service.tick().await, TickOutcome::Failed { quarantined: false, .. }));
        }

        let log = service.file_log().await.unwrap();
        assert!(log.entries.is_empty());
        assert_eq!(log.failure(Path::new("bad.csv")).map(|f| f.consecutive_failures), Some(3));
        assert_eq!(controller.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_poison_file_is_quarantined_at_threshold() {
        let mut controller = ListController::new(&["bad.csv", "good.csv"]);
        controller.failing.insert(PathBuf::from("bad.csv"));
        let (_, service) = service(controller, Some(2));

        assert!(matches!(service.tick().await, TickOutcome::Failed { quarantined: false, .. }));
        assert!(matches!(service.tick().await, TickOutcome::Failed { quarantined: true, .. }));
        assert!(matches!(service.tick().await, TickOutcome::Processed { ref path, .. } if path == Path::new("good.csv")));
        assert_eq!(service.tick().await, TickOutcome::Idle);

        let log = service.file_log().await.unwrap();
        assert!(log.is_quarantined(&FlowFile::new("bad.csv")));
    }

    #[tokio::test]
    async fn test_declined_file_is_not_logged() {
        let mut controller = ListController::new(&["later.csv"]);
        controller.declined.insert(PathBuf::from("later.csv"));
        let (_, service) = service(controller, None);

        assert!(matches!(service.tick().await, TickOutcome::Declined { .. }));
        assert!(service.file_log().await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_busy_service_skips_without_event() {
        let (_, service) = service(ListController::new(&["a.csv"]), None);
        let mut events = service.subscribe();

        let permit = service.guard.try_acquire();
        assert_eq!(service.tick().await, TickOutcome::Skipped);
        assert_eq!(service.processed(), 0);
        assert!(events.try_recv().is_err());
        drop(permit);

        service.tick().await;
        let event = events.try_recv().unwrap();
        assert_eq!(event.tick, 1);
        assert_eq!(event.flow_code, "inbox");
        assert!(matches!(event.outcome, TickOutcome::Processed { .. }));
    }

    #[tokio::test]
    async fn test_start_rejects_zero_interval() {
        let controller = Arc::new(ListController::new(&[]));
        let config = EngineConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        let repo = StateRepository::new(Arc::new(MemoryStorage::new()));
        let service = Arc::new(FlowControllerService::new(controller, repo, &config));
        assert!(matches!(service.start(), Err(FlowError::Config(_))));
    }
}
