//! Checkpoint ledger
//!
//! Maps the opaque checkpoints handed to consumers onto the positional
//! offsets a concrete source understands. One ledger document exists per
//! (entity type, consumer); it is append-only, so every checkpoint ever
//! issued can still be traced back to the offset it stood for.

use chrono::Utc;
use flowline_common::Result;
use tracing::{debug, warn};

use crate::model::{Checkpoint, FlowId, QueryResponseState};
use crate::storage::StateRepository;

/// In-memory view of one ledger document
#[derive(Debug, Clone)]
pub struct CheckpointLedger {
    flow_id: FlowId,
    entity_type: String,
    consumer_id: String,
    rows: Vec<QueryResponseState>,
}

impl CheckpointLedger {
    pub fn new(flow_id: FlowId, entity_type: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        Self {
            flow_id,
            entity_type: entity_type.into(),
            consumer_id: consumer_id.into(),
            rows: Vec::new(),
        }
    }

    /// Load the whole ledger document
    pub async fn load(
        repo: &StateRepository,
        flow_id: FlowId,
        entity_type: &str,
        consumer_id: &str,
    ) -> Result<Self> {
        let rows = repo.load_ledger(entity_type, consumer_id).await?;
        debug!(entity_type, consumer_id, rows = rows.len(), "Ledger loaded");
        Ok(Self {
            flow_id,
            entity_type: entity_type.to_string(),
            consumer_id: consumer_id.to_string(),
            rows,
        })
    }

    /// Rewrite the whole ledger document
    pub async fn save(&self, repo: &StateRepository) -> Result<()> {
        repo.save_ledger(&self.entity_type, &self.consumer_id, &self.rows)
            .await
    }

    /// Offset recorded for `checkpoint` by `consumer_id`; zero on first run.
    ///
    /// Pure read: resolving the same checkpoint twice yields the same offset.
    pub fn resolve_offset(&self, consumer_id: &str, checkpoint: Checkpoint) -> u64 {
        if checkpoint.is_zero() {
            return 0;
        }

        match self
            .rows
            .iter()
            .rev()
            .find(|row| self.owns(row, consumer_id) && row.checkpoint == checkpoint)
        {
            Some(row) => row.local_index,
            None => {
                warn!(
                    flow = %self.flow_id,
                    consumer_id,
                    checkpoint = %checkpoint,
                    "Checkpoint not found in ledger, starting from offset 0"
                );
                0
            },
        }
    }

    /// Append a new row; earlier rows are never touched
    pub fn record(&mut self, consumer_id: &str, local_index: u64, checkpoint: Checkpoint) {
        self.rows.push(QueryResponseState {
            flow_id: self.flow_id.clone(),
            consumer_id: consumer_id.to_string(),
            local_index,
            checkpoint,
            recorded_at: Utc::now(),
        });
    }

    /// Most recent row written for `consumer_id`
    pub fn latest(&self, consumer_id: &str) -> Option<&QueryResponseState> {
        self.rows
            .iter()
            .rev()
            .find(|row| self.owns(row, consumer_id))
    }

    pub fn rows(&self) -> &[QueryResponseState] {
        &self.rows
    }

    fn owns(&self, row: &QueryResponseState, consumer_id: &str) -> bool {
        row.flow_id == self.flow_id && row.consumer_id == consumer_id
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn ledger() -> CheckpointLedger {
        CheckpointLedger::new(FlowId::from("assets"), "devices", "proc-1")
    }

    #[test]
    fn test_first_run_resolves_to_zero() {
        let ledger = ledger();
        assert_eq!(ledger.resolve_offset("proc-1", Checkpoint::ZERO), 0);
    }

    #[test]
    fn test_resolves_recorded_offset() {
        let mut ledger = ledger();
        let cp1 = Checkpoint::mint();
        let cp2 = Checkpoint::mint();
        ledger.record("proc-1", 2, cp1);
        ledger.record("proc-1", 4, cp2);

        assert_eq!(ledger.resolve_offset("proc-1", cp1), 2);
        assert_eq!(ledger.resolve_offset("proc-1", cp2), 4);
        assert_eq!(ledger.latest("proc-1").map(|r| r.local_index), Some(4));
    }

    #[test]
    fn test_resolution_is_scoped_to_consumer() {
        let mut ledger = ledger();
        let cp = Checkpoint::mint();
        ledger.record("proc-1", 10, cp);

        assert_eq!(ledger.resolve_offset("proc-2", cp), 0);
        assert!(ledger.latest("proc-2").is_none());
    }

    #[test]
    fn test_record_is_append_only() {
        let mut ledger = ledger();
        let cp = Checkpoint::mint();
        ledger.record("proc-1", 3, cp);
        let first = ledger.rows()[0].clone();

        ledger.record("proc-1", 3, Checkpoint::mint());
        ledger.record("proc-1", 5, Checkpoint::mint());

        assert_eq!(ledger.rows().len(), 3);
        assert_eq!(ledger.rows()[0], first);
    }

    #[tokio::test]
    async fn test_load_save_round_trip() {
        let repo = StateRepository::new(Arc::new(MemoryStorage::new()));
        let cp = Checkpoint::mint();

        let mut ledger = CheckpointLedger::load(&repo, FlowId::from("assets"), "devices", "proc-1")
            .await
            .unwrap();
        ledger.record("proc-1", 7, cp);
        ledger.save(&repo).await.unwrap();

        let reloaded = CheckpointLedger::load(&repo, FlowId::from("assets"), "devices", "proc-1")
            .await
            .unwrap();
        assert_eq!(reloaded.resolve_offset("proc-1", cp), 7);
    }
}
