use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::index::{IndexCatalog, IndexId, PostgresIndex};

pub mod store;
pub mod types;

pub use store::{ActionStore, LedgerStoreError, QueueStore};
pub use types::{
    ActionState, CloseReindexAction, NewReindexAction, QueueState, QueuedActionRow,
    ReindexActionRow,
};

/// How an attempt ended, as recorded on its ledger row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    Finished,
    Failed { code: String, message: String },
}

/// Binds a `started` ledger row to the attempt that opened it.
#[derive(Debug)]
pub struct ActionHandle {
    id: i64,
    index: IndexId,
    started: ReindexActionRow,
    failure: Option<(String, String)>,
}

impl ActionHandle {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The row as it was written by `open`.
    pub fn started(&self) -> &ReindexActionRow {
        &self.started
    }

    pub fn index(&self) -> &IndexId {
        &self.index
    }

    /// Once marked, the handle closes as failed whatever outcome is passed to `close`.
    pub fn mark_failed(&mut self, code: impl Into<String>, message: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some((code.into(), message.into()));
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Durable history of rebuild attempts. Every call is a write or read against the store;
/// nothing is buffered.
#[derive(Clone)]
pub struct ActionLedger {
    store: Arc<dyn ActionStore>,
    catalog: IndexCatalog,
    recent_window: Duration,
}

impl ActionLedger {
    pub fn new(store: Arc<dyn ActionStore>, catalog: IndexCatalog, recent_window: Duration) -> Self {
        Self {
            store,
            catalog,
            recent_window,
        }
    }

    pub fn recent_window(&self) -> Duration {
        self.recent_window
    }

    pub async fn open(&self, index: &PostgresIndex) -> Result<ActionHandle, LedgerStoreError> {
        let row = self
            .store
            .insert_started(NewReindexAction {
                index_identifier: index.id.qualified(),
                action_start: Utc::now(),
                ondisk_size_bytes_start: index.ondisk_size_bytes,
                bloat_estimate_bytes_start: index.bloat_estimate_bytes,
            })
            .await?;
        info!(
            action_id = row.id,
            index = %index.id,
            ondisk_size_bytes = index.ondisk_size_bytes,
            bloat_estimate_bytes = index.bloat_estimate_bytes,
            "opened reindex action"
        );
        Ok(ActionHandle {
            id: row.id,
            index: index.id.clone(),
            started: row,
            failure: None,
        })
    }

    pub async fn close(
        &self,
        handle: ActionHandle,
        outcome: ActionOutcome,
    ) -> Result<ReindexActionRow, LedgerStoreError> {
        let outcome = match handle.failure {
            Some((code, message)) => ActionOutcome::Failed { code, message },
            None => outcome,
        };

        let ondisk_size_bytes_end = match self.catalog.fetch(&handle.index).await {
            Ok(index) => Some(index.ondisk_size_bytes),
            Err(error) => {
                warn!(
                    action_id = handle.id,
                    index = %handle.index,
                    reason = %error,
                    "could not read index size when closing action"
                );
                None
            }
        };

        let (state, error_code, error_message) = match outcome {
            ActionOutcome::Finished => (ActionState::Finished, None, None),
            ActionOutcome::Failed { code, message } => {
                (ActionState::Failed, Some(code), Some(message))
            }
        };

        let (row, changed) = self
            .store
            .close(CloseReindexAction {
                id: handle.id,
                state,
                action_end: Utc::now(),
                ondisk_size_bytes_end,
                error_code,
                error_message,
            })
            .await?;
        if changed {
            info!(
                action_id = row.id,
                index = %handle.index,
                state = row.state.as_str(),
                ondisk_size_bytes_end = ?row.ondisk_size_bytes_end,
                "closed reindex action"
            );
        } else {
            warn!(
                action_id = row.id,
                index = %handle.index,
                state = row.state.as_str(),
                "reindex action was already closed"
            );
        }
        Ok(row)
    }

    /// True when `index` has a finished action ending inside the recency window.
    pub async fn recent(&self, index: &IndexId) -> Result<bool, LedgerStoreError> {
        let recent = self.recent_among(std::slice::from_ref(index)).await?;
        Ok(recent.contains(index))
    }

    pub async fn recent_among(
        &self,
        indexes: &[IndexId],
    ) -> Result<HashSet<IndexId>, LedgerStoreError> {
        let identifiers: Vec<String> = indexes.iter().map(IndexId::qualified).collect();
        let since = Utc::now() - self.recent_window;
        let finished = self.store.finished_since(&identifiers, since).await?;
        Ok(indexes
            .iter()
            .filter(|id| finished.contains(&id.qualified()))
            .cloned()
            .collect())
    }

    /// Actions started within the last `days` days, newest first.
    pub async fn started_within(&self, days: u32) -> Result<Vec<ReindexActionRow>, LedgerStoreError> {
        let since = Utc::now() - Duration::days(i64::from(days));
        self.store.started_since(since).await
    }

    /// The open action, if any. More than one means an earlier process died mid-rebuild.
    pub async fn in_flight(&self) -> Result<Option<ReindexActionRow>, LedgerStoreError> {
        let mut open = self.store.open_actions().await?;
        if open.len() > 1 {
            warn!(open = open.len(), "more than one reindex action is still started");
        }
        Ok(if open.is_empty() {
            None
        } else {
            Some(open.remove(0))
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<ReindexActionRow>, LedgerStoreError> {
        self.store.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::{MemoryIndex, MemoryIndexBackend};

    async fn ledger_with(
        entries: &[(&str, MemoryIndex)],
    ) -> (Arc<MemoryIndexBackend>, Arc<dyn ActionStore>, ActionLedger) {
        let backend = Arc::new(MemoryIndexBackend::default());
        for (name, body) in entries {
            backend
                .insert(IndexId::new("public", *name), body.clone())
                .await;
        }
        let store = store::memory();
        let ledger = ActionLedger::new(
            store.clone(),
            IndexCatalog::new(backend.clone()),
            Duration::days(10),
        );
        (backend, store, ledger)
    }

    async fn seed_finished(
        store: &Arc<dyn ActionStore>,
        identifier: &str,
        ended_ago: Duration,
        state: ActionState,
    ) -> anyhow::Result<()> {
        let end = Utc::now() - ended_ago;
        let row = store
            .insert_started(NewReindexAction {
                index_identifier: identifier.to_string(),
                action_start: end - Duration::hours(1),
                ondisk_size_bytes_start: 100,
                bloat_estimate_bytes_start: 50,
            })
            .await?;
        store
            .close(CloseReindexAction {
                id: row.id,
                state,
                action_end: end,
                ondisk_size_bytes_end: Some(50),
                error_code: None,
                error_message: None,
            })
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn open_then_close_records_sizes() -> anyhow::Result<()> {
        let (backend, _store, ledger) =
            ledger_with(&[("orders_idx", MemoryIndex::btree("orders", "(id)", 800, 300))]).await;
        let id = IndexId::new("public", "orders_idx");
        let index = IndexCatalog::new(backend.clone()).fetch(&id).await?;

        let handle = ledger.open(&index).await?;
        let open = ledger.in_flight().await?;
        assert_eq!(open.as_ref().map(|row| row.id), Some(handle.id()));
        assert_eq!(open.map(|row| row.state), Some(ActionState::Started));

        backend
            .insert(id.clone(), MemoryIndex::btree("orders", "(id)", 500, 0))
            .await;
        let row = ledger.close(handle, ActionOutcome::Finished).await?;

        assert_eq!(row.state, ActionState::Finished);
        assert_eq!(row.ondisk_size_bytes_start, 800);
        assert_eq!(row.bloat_estimate_bytes_start, 300);
        assert_eq!(row.ondisk_size_bytes_end, Some(500));
        assert!(row.action_end.is_some());
        assert!(ledger.in_flight().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn failed_handle_never_closes_as_finished() -> anyhow::Result<()> {
        let (backend, _store, ledger) =
            ledger_with(&[("orders_idx", MemoryIndex::btree("orders", "(id)", 800, 300))]).await;
        let index = IndexCatalog::new(backend)
            .fetch(&IndexId::new("public", "orders_idx"))
            .await?;

        let mut handle = ledger.open(&index).await?;
        handle.mark_failed("build_invalid", "shadow index was built invalid");
        handle.mark_failed("rebuild_failed", "second failure is ignored");
        let row = ledger.close(handle, ActionOutcome::Finished).await?;

        assert_eq!(row.state, ActionState::Failed);
        assert_eq!(row.error_code.as_deref(), Some("build_invalid"));
        Ok(())
    }

    #[tokio::test]
    async fn closed_rows_are_not_rewritten() -> anyhow::Result<()> {
        let (_backend, store, _ledger) = ledger_with(&[]).await;
        let row = store
            .insert_started(NewReindexAction {
                index_identifier: "public.orders_idx".to_string(),
                action_start: Utc::now(),
                ondisk_size_bytes_start: 10,
                bloat_estimate_bytes_start: 5,
            })
            .await?;
        let close = |state| CloseReindexAction {
            id: row.id,
            state,
            action_end: Utc::now(),
            ondisk_size_bytes_end: None,
            error_code: None,
            error_message: None,
        };

        let (failed, changed) = store.close(close(ActionState::Failed)).await?;
        assert!(changed);
        assert_eq!(failed.state, ActionState::Failed);

        let (again, changed) = store.close(close(ActionState::Finished)).await?;
        assert!(!changed);
        assert_eq!(again.state, ActionState::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn recent_only_counts_finished_actions_inside_window() -> anyhow::Result<()> {
        let (_backend, store, ledger) = ledger_with(&[]).await;
        seed_finished(&store, "public.a_idx", Duration::days(2), ActionState::Finished).await?;
        seed_finished(&store, "public.b_idx", Duration::days(20), ActionState::Finished).await?;
        seed_finished(&store, "public.c_idx", Duration::hours(1), ActionState::Failed).await?;

        let a = IndexId::new("public", "a_idx");
        let b = IndexId::new("public", "b_idx");
        let c = IndexId::new("public", "c_idx");
        assert!(ledger.recent(&a).await?);
        assert!(!ledger.recent(&b).await?);
        assert!(!ledger.recent(&c).await?);

        let recent = ledger.recent_among(&[a.clone(), b, c]).await?;
        assert_eq!(recent, HashSet::from([a]));

        assert_eq!(ledger.started_within(10).await?.len(), 2);
        Ok(())
    }
}
