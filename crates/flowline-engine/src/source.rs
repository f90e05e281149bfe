//! Checkpoint-addressed pulls over an arbitrary upstream
//!
//! A [`RecordSource`] knows how to read `page_size` records starting at a
//! positional offset. [`QuerySource`] puts the checkpoint ledger in front of
//! it so consumers only ever deal in opaque checkpoints.

use async_trait::async_trait;
use flowline_common::{FlowError, Result};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::ledger::CheckpointLedger;
use crate::model::{Checkpoint, FlowId, Package, QueryResponse};
use crate::retry::RetryConfig;
use crate::storage::StateRepository;

/// Upstream retrieval by positional offset
#[async_trait]
pub trait RecordSource<In>: Send + Sync {
    async fn fetch(&self, offset: u64, page_size: usize) -> anyhow::Result<Vec<In>>;
}

/// [`RecordSource`] backed by a synchronous closure
pub struct FnSource<F> {
    fetch: F,
}

/// Wrap `fetch(offset, page_size)` as a [`RecordSource`]
pub fn from_fn<In, F>(fetch: F) -> FnSource<F>
where
    F: Fn(u64, usize) -> anyhow::Result<Vec<In>> + Send + Sync,
{
    FnSource { fetch }
}

#[async_trait]
impl<In, F> RecordSource<In> for FnSource<F>
where
    In: Send + 'static,
    F: Fn(u64, usize) -> anyhow::Result<Vec<In>> + Send + Sync,
{
    async fn fetch(&self, offset: u64, page_size: usize) -> anyhow::Result<Vec<In>> {
        (self.fetch)(offset, page_size)
    }
}

/// In-memory source over a fixed vector, handy for replay and tests
pub struct VecSource<In> {
    records: Vec<In>,
}

impl<In> VecSource<In> {
    pub fn new(records: Vec<In>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl<In: Clone + Send + Sync> RecordSource<In> for VecSource<In> {
    async fn fetch(&self, offset: u64, page_size: usize) -> anyhow::Result<Vec<In>> {
        let start = usize::try_from(offset)?.min(self.records.len());
        let end = start.saturating_add(page_size).min(self.records.len());
        Ok(self.records[start..end].to_vec())
    }
}

/// Source adapter: ledger + upstream retrieval
pub struct QuerySource<In> {
    flow_id: FlowId,
    entity_type: String,
    source: Arc<dyn RecordSource<In>>,
    repo: StateRepository,
    retry: Option<RetryConfig>,
}

impl<In> Clone for QuerySource<In> {
    fn clone(&self) -> Self {
        Self {
            flow_id: self.flow_id.clone(),
            entity_type: self.entity_type.clone(),
            source: Arc::clone(&self.source),
            repo: self.repo.clone(),
            retry: self.retry,
        }
    }
}

impl<In: Send + 'static> QuerySource<In> {
    pub fn new(
        flow_id: FlowId,
        entity_type: impl Into<String>,
        source: Arc<dyn RecordSource<In>>,
        repo: StateRepository,
    ) -> Self {
        Self {
            flow_id,
            entity_type: entity_type.into(),
            source,
            repo,
            retry: None,
        }
    }

    /// Retry transient upstream failures with the given policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Entity type this adapter reads; also names its ledger document
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Pull the page following `checkpoint_from` for `consumer_id`.
    ///
    /// The returned `checkpoint_to` is recorded in the ledger before this
    /// returns, so it is resumable whatever the caller does next. An empty
    /// upstream page still yields a response with a fresh checkpoint that
    /// maps to the unchanged offset.
    #[instrument(skip(self), fields(flow = %self.flow_id, entity_type = %self.entity_type))]
    pub async fn get(
        &self,
        consumer_id: &str,
        checkpoint_from: Checkpoint,
        page_size: usize,
    ) -> Result<QueryResponse<In>> {
        if page_size == 0 {
            return Err(FlowError::config("page size must be greater than 0"));
        }

        let mut ledger =
            CheckpointLedger::load(&self.repo, self.flow_id.clone(), &self.entity_type, consumer_id)
                .await?;
        let offset = ledger.resolve_offset(consumer_id, checkpoint_from);

        let records = self.fetch(offset, page_size).await.map_err(FlowError::Other)?;

        // Ordered after everything this consumer has seen, even if the clock went back
        let newest = ledger
            .latest(consumer_id)
            .map_or(checkpoint_from, |row| row.checkpoint.max(checkpoint_from));
        let checkpoint_to = Checkpoint::mint_after(newest);
        let local_index = offset + records.len() as u64;
        ledger.record(consumer_id, local_index, checkpoint_to);
        ledger.save(&self.repo).await?;

        debug!(
            offset,
            local_index,
            records = records.len(),
            checkpoint_from = %checkpoint_from,
            checkpoint_to = %checkpoint_to,
            "Page pulled"
        );

        Ok(QueryResponse {
            checkpoint_from,
            checkpoint_to,
            local_index,
            package: Package::of_records(self.flow_id.clone(), self.entity_type.clone(), records),
        })
    }

    async fn fetch(&self, offset: u64, page_size: usize) -> anyhow::Result<Vec<In>> {
        match self.retry {
            Some(config) => {
                let mut retry = config.build::<anyhow::Error>();
                retry
                    .invoke(|| self.source.fetch(offset, page_size))
                    .await
            },
            None => self.source.fetch(offset, page_size).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn adapter(records: Vec<&'static str>) -> (QuerySource<&'static str>, StateRepository) {
        let repo = StateRepository::new(Arc::new(MemoryStorage::new()));
        let source = QuerySource::<&'static str>::new(
            FlowId::from("assets"),
            "letters",
            Arc::new(VecSource::new(records)),
            repo.clone(),
        );
        (source, repo)
    }

    #[tokio::test]
    async fn test_pages_follow_checkpoints() {
        let (source, _) = adapter(vec!["a", "b", "c", "d", "e"]);

        let first = source.get("proc", Checkpoint::ZERO, 2).await.unwrap();
        assert_eq!(first.records(), &["a", "b"]);
        assert_eq!(first.checkpoint_from, Checkpoint::ZERO);
        assert_eq!(first.local_index, 2);

        let second = source.get("proc", first.checkpoint_to, 2).await.unwrap();
        assert_eq!(second.records(), &["c", "d"]);
        assert!(second.checkpoint_to > first.checkpoint_to);

        let third = source.get("proc", second.checkpoint_to, 2).await.unwrap();
        assert_eq!(third.records(), &["e"]);
    }

    #[tokio::test]
    async fn test_same_checkpoint_resolves_same_offset() {
        let (source, repo) = adapter(vec!["a", "b", "c", "d"]);
        let first = source.get("proc", Checkpoint::ZERO, 2).await.unwrap();

        let ledger = CheckpointLedger::load(&repo, FlowId::from("assets"), "letters", "proc")
            .await
            .unwrap();
        let offset_once = ledger.resolve_offset("proc", first.checkpoint_to);
        let offset_twice = ledger.resolve_offset("proc", first.checkpoint_to);
        assert_eq!(offset_once, 2);
        assert_eq!(offset_once, offset_twice);

        let replay_a = source.get("proc", first.checkpoint_to, 2).await.unwrap();
        let replay_b = source.get("proc", first.checkpoint_to, 2).await.unwrap();
        assert_eq!(replay_a.records(), replay_b.records());
        assert_eq!(replay_a.local_index, replay_b.local_index);
    }

    #[tokio::test]
    async fn test_empty_page_is_not_an_error() {
        let (source, _) = adapter(vec!["a"]);
        let first = source.get("proc", Checkpoint::ZERO, 5).await.unwrap();
        let empty = source.get("proc", first.checkpoint_to, 5).await.unwrap();

        assert!(empty.is_empty());
        assert_eq!(empty.local_index, 1);
        assert_ne!(empty.checkpoint_to, first.checkpoint_to);
    }

    #[tokio::test]
    async fn test_checkpoints_stay_ordered_when_clock_is_behind_ledger() {
        let (source, repo) = adapter(vec!["a", "b", "c"]);
        let ahead = Checkpoint::from(uuid::Uuid::from_u128(0xffff_0000_0000_7000_8000_0000_0000_0000));

        let mut ledger = CheckpointLedger::load(&repo, FlowId::from("assets"), "letters", "proc")
            .await
            .unwrap();
        ledger.record("proc", 1, ahead);
        ledger.save(&repo).await.unwrap();

        let page = source.get("proc", ahead, 1).await.unwrap();
        assert_eq!(page.records(), &["b"]);
        assert!(page.checkpoint_to > ahead);

        let next = source.get("proc", page.checkpoint_to, 1).await.unwrap();
        assert_eq!(next.records(), &["c"]);
        assert!(next.checkpoint_to > page.checkpoint_to);
    }

    #[tokio::test]
    async fn test_zero_page_size_is_rejected() {
        let (source, _) = adapter(vec!["a"]);
        let err = source.get("proc", Checkpoint::ZERO, 0).await.unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_fetch_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let flaky = from_fn(move |offset, size| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("connection reset");
            }
            Ok((offset..offset + size as u64).collect::<Vec<u64>>())
        });

        let repo = StateRepository::new(Arc::new(MemoryStorage::new()));
        let source = QuerySource::<u64>::new(FlowId::from("assets"), "numbers", Arc::new(flaky), repo)
            .with_retry(RetryConfig { max_attempts: 2, wait_ms: 5 });

        let page = source.get("proc", Checkpoint::ZERO, 3).await.unwrap();
        assert_eq!(page.records(), &[0, 1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_records_nothing() {
        let failing = from_fn(|_, _| -> anyhow::Result<Vec<u8>> { anyhow::bail!("down") });
        let repo = StateRepository::new(Arc::new(MemoryStorage::new()));
        let source =
            QuerySource::<u8>::new(FlowId::from("assets"), "bytes", Arc::new(failing), repo.clone());

        assert!(source.get("proc", Checkpoint::ZERO, 3).await.is_err());
        assert!(repo.load_ledger("bytes", "proc").await.unwrap().is_empty());
    }
}
