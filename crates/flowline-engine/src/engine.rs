//! Generic per-record processing loop
//!
//! Applies an [`ItemProcessor`] to every record of an input, isolates
//! per-record failures and commits once at the end. A failed commit demotes
//! every record that had been processed to a `FailedToCommit` error; nothing
//! is partially committed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::model::{ProcessError, ProcessErrorKind};

/// What a record-level failure does to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record the error and move on to the next record
    #[default]
    ContinueOnError,
    /// Stop at the first failing record; nothing is committed
    AbortOnFirstError,
}

impl ErrorPolicy {
    pub fn from_fail_on_error(fail_on_error: bool) -> Self {
        if fail_on_error {
            ErrorPolicy::AbortOnFirstError
        } else {
            ErrorPolicy::ContinueOnError
        }
    }
}

/// Per-record behaviour plugged into [`ProcessorEngine`]
#[async_trait]
pub trait ItemProcessor<T: Send + Sync>: Send {
    /// Handle one record; returned errors mark it as not processed
    async fn process(&mut self, index: usize, item: &T) -> anyhow::Result<Vec<ProcessError>>;

    /// Called once after every record has been seen
    async fn commit(&mut self) -> anyhow::Result<()>;

    /// Fired for each record that processed cleanly
    fn on_processed(&mut self, _index: usize, _item: &T) {}

    /// Fired when `process` itself failed for a record
    fn on_error(&mut self, _index: usize, _item: &T, _error: &anyhow::Error) {}
}

/// Outcome of one pass of the loop
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Records processed and committed
    pub processed: usize,
    pub errors: Vec<ProcessError>,
    pub elapsed: Duration,
    /// Set when the loop stopped early under [`ErrorPolicy::AbortOnFirstError`]
    pub aborted: bool,
    /// Error returned by `commit`, if it failed
    pub commit_error: Option<anyhow::Error>,
    /// Raw error chains, kept in debug builds for diagnostics
    #[cfg(debug_assertions)]
    pub exceptions: Vec<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !self.aborted && self.commit_error.is_none()
    }

    pub fn failed_to_commit(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.kind == ProcessErrorKind::FailedToCommit)
            .count()
    }
}

/// The loop itself; stateless apart from its error policy
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorEngine {
    policy: ErrorPolicy,
}

impl ProcessorEngine {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub async fn process<T, I, P>(&self, items: I, handler: &mut P) -> RunSummary
    where
        T: Send + Sync,
        I: IntoIterator<Item = T>,
        P: ItemProcessor<T> + ?Sized,
    {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        let mut processed: Vec<usize> = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            match handler.process(index, &item).await {
                Ok(errors) if errors.is_empty() => {
                    handler.on_processed(index, &item);
                    processed.push(index);
                },
                Ok(errors) => {
                    debug!(index, errors = errors.len(), "Record reported errors");
                    summary.errors.extend(errors);
                },
                Err(err) => {
                    error!(index, error = %format!("{:#}", err), "Record processing failed");
                    handler.on_error(index, &item, &err);
                    summary
                        .errors
                        .push(ProcessError::exception(Some(index), format!("{:#}", err)));
                    #[cfg(debug_assertions)]
                    summary.exceptions.push(format!("{:?}", err));

                    if self.policy == ErrorPolicy::AbortOnFirstError {
                        warn!(index, "Aborting run on first error");
                        summary.aborted = true;
                        break;
                    }
                },
            }
        }

        if summary.aborted {
            Self::demote(&mut summary, &mut processed, "run aborted before commit");
        } else if let Err(err) = handler.commit().await {
            error!(error = %format!("{:#}", err), records = processed.len(), "Commit failed");
            Self::demote(&mut summary, &mut processed, &format!("{:#}", err));
            #[cfg(debug_assertions)]
            summary.exceptions.push(format!("{:?}", err));
            summary.commit_error = Some(err);
        }

        summary.processed = processed.len();
        summary.elapsed = started.elapsed();
        summary
    }

    fn demote(summary: &mut RunSummary, processed: &mut Vec<usize>, reason: &str) {
        summary.errors.extend(
            processed
                .drain(..)
                .map(|index| ProcessError::failed_to_commit(index, reason)),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Doubles numbers; negative numbers fail, zero is reported as invalid
    #[derive(Default)]
    struct Doubler {
        output: Vec<i64>,
        committed: bool,
        fail_commit: bool,
        hook_processed: usize,
        hook_errors: usize,
    }

    #[async_trait]
    impl ItemProcessor<i64> for Doubler {
        async fn process(&mut self, index: usize, item: &i64) -> anyhow::Result<Vec<ProcessError>> {
            if *item < 0 {
                anyhow::bail!("negative input {}", item);
            }
            if *item == 0 {
                return Ok(vec![ProcessError::validation(index, "zero is not allowed")]);
            }
            self.output.push(item * 2);
            Ok(vec![])
        }

        async fn commit(&mut self) -> anyhow::Result<()> {
            if self.fail_commit {
                anyhow::bail!("disk full");
            }
            self.committed = true;
            Ok(())
        }

        fn on_processed(&mut self, _index: usize, _item: &i64) {
            self.hook_processed += 1;
        }

        fn on_error(&mut self, _index: usize, _item: &i64, _error: &anyhow::Error) {
            self.hook_errors += 1;
        }
    }

    #[tokio::test]
    async fn test_isolates_record_failures() {
        let mut handler = Doubler::default();
        let summary = ProcessorEngine::default()
            .process(vec![1, -1, 0, 3], &mut handler)
            .await;

        assert!(summary.is_success());
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.errors[0].kind, ProcessErrorKind::Exception);
        assert_eq!(summary.errors[0].record, Some(1));
        assert_eq!(summary.errors[1].kind, ProcessErrorKind::Validation);
        assert_eq!(handler.output, vec![2, 6]);
        assert_eq!(handler.hook_processed, 2);
        assert_eq!(handler.hook_errors, 1);
        assert!(handler.committed);
    }

    #[tokio::test]
    async fn test_commit_failure_demotes_processed_records() {
        let mut handler = Doubler {
            fail_commit: true,
            ..Default::default()
        };
        let summary = ProcessorEngine::default()
            .process(vec![1, 2, 3], &mut handler)
            .await;

        assert!(!summary.is_success());
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed_to_commit(), 3);
        assert!(summary.errors.iter().all(|e| e.message.contains("failed to commit")));
        assert!(summary.commit_error.is_some());
    }

    #[tokio::test]
    async fn test_abort_policy_stops_and_skips_commit() {
        let mut handler = Doubler::default();
        let summary = ProcessorEngine::new(ErrorPolicy::AbortOnFirstError)
            .process(vec![1, -5, 2], &mut handler)
            .await;

        assert!(summary.aborted);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.errors.len(), 2);
        assert!(!handler.committed);
        assert_eq!(handler.output, vec![2]);
    }

    #[tokio::test]
    async fn test_empty_input_still_commits() {
        let mut handler = Doubler::default();
        let summary = ProcessorEngine::default()
            .process(Vec::<i64>::new(), &mut handler)
            .await;

        assert!(summary.is_success());
        assert_eq!(summary.processed, 0);
        assert!(handler.committed);
    }

    #[test]
    fn test_policy_from_flag() {
        assert_eq!(ErrorPolicy::from_fail_on_error(true), ErrorPolicy::AbortOnFirstError);
        assert_eq!(ErrorPolicy::from_fail_on_error(false), ErrorPolicy::ContinueOnError);
    }
}
