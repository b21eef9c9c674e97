use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::engine::{RebuildError, RebuildStrategy, ReindexEngine};
use crate::index::{CatalogError, IndexCatalog, IndexId, PostgresIndex};
use crate::lease::{ExclusiveLease, LeaseError};
use crate::ledger::{ActionLedger, ActionOutcome, LedgerStoreError};
use crate::notifier::ProgressNotifier;
use crate::selection::SelectionError;


#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Ledger(#[from] LedgerStoreError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Rebuild(#[from] RebuildError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    /// Rebuilt; the ledger row is `finished`.
    Finished,
    /// Attempted and failed; the ledger row is `failed`.
    Failed,
    /// Refused before anything was recorded or mutated.
    Rejected,
    /// Not attempted because another worker holds the lease.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub index: IndexId,
    pub status: IndexStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RebuildStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IndexReport {
    fn new(index: IndexId, status: IndexStatus) -> Self {
        Self {
            index,
            status,
            strategy: None,
            action_id: None,
            error_code: None,
            message: None,
        }
    }

    fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.message = Some(message.into());
        self
    }
}

/// Sequences candidates through the engine, one at a time and only while holding the
/// cluster-wide lease.
#[derive(Clone)]
pub struct Coordinator {
    lease: ExclusiveLease,
    catalog: IndexCatalog,
    ledger: ActionLedger,
    engine: Arc<ReindexEngine>,
    notifier: ProgressNotifier,
    default_strategy: RebuildStrategy,
}

impl Coordinator {
    pub fn new(
        lease: ExclusiveLease,
        catalog: IndexCatalog,
        ledger: ActionLedger,
        engine: Arc<ReindexEngine>,
        notifier: ProgressNotifier,
        default_strategy: RebuildStrategy,
    ) -> Self {
        Self {
            lease,
            catalog,
            ledger,
            engine,
            notifier,
            default_strategy,
        }
    }

    pub fn lease(&self) -> &ExclusiveLease {
        &self.lease
    }

    pub fn engine(&self) -> &ReindexEngine {
        &self.engine
    }

    /// Runs every candidate in order. One candidate's failure never stops the rest.
    pub async fn run<I>(&self, candidates: I) -> Vec<IndexReport>
    where
        I: IntoIterator<Item = PostgresIndex>,
    {
        let mut reports = Vec::new();
        for candidate in candidates {
            reports.push(self.rebuild_one(&candidate.id, None).await);
        }
        reports
    }

    /// Acquires the lease, rebuilds `id`, and releases the lease whatever happened.
    pub async fn rebuild_one(&self, id: &IndexId, forced: Option<RebuildStrategy>) -> IndexReport {
        let guard = match self.lease.acquire().await {
            Ok(guard) => guard,
            Err(error @ LeaseError::Unavailable { .. }) => {
                info!(index = %id, "skipping rebuild, lease unavailable");
                return IndexReport::new(id.clone(), IndexStatus::Skipped)
                    .with_error("lease_unavailable", error.to_string());
            }
            Err(error) => {
                warn!(index = %id, reason = %error, "skipping rebuild, lease store failed");
                return IndexReport::new(id.clone(), IndexStatus::Skipped)
                    .with_error("lease_error", error.to_string());
            }
        };

        let report = self.attempt(id, forced).await;

        if let Err(error) = guard.release().await {
            warn!(index = %id, reason = %error, "failed to release lease");
        }
        report
    }

    async fn attempt(&self, id: &IndexId, forced: Option<RebuildStrategy>) -> IndexReport {
        // The candidate snapshot may be stale by the time the lease is held.
        let index = match self.catalog.fetch(id).await {
            Ok(index) => index,
            Err(error) => {
                warn!(index = %id, reason = %error, "rejecting rebuild, index unavailable");
                let rejected = RebuildError::from(error);
                return IndexReport::new(id.clone(), IndexStatus::Rejected)
                    .with_error(rejected.code(), rejected.to_string());
            }
        };

        let strategy = match self.engine.plan(&index, forced, self.default_strategy) {
            Ok(strategy) => strategy,
            Err(error) => {
                warn!(index = %id, code = error.code(), reason = %error, "rejecting rebuild");
                return IndexReport::new(id.clone(), IndexStatus::Rejected)
                    .with_error(error.code(), error.to_string());
            }
        };

        let mut handle = match self.ledger.open(&index).await {
            Ok(handle) => handle,
            Err(error) => {
                error!(index = %id, reason = %error, "could not open reindex action, not rebuilding");
                let mut report = IndexReport::new(id.clone(), IndexStatus::Failed)
                    .with_error("ledger_error", error.to_string());
                report.strategy = Some(strategy);
                return report;
            }
        };
        let action_id = handle.id();
        self.notifier.notify_start(&index, handle.started()).await;

        let rebuilt = self.engine.rebuild(&index, strategy).await;
        if let Err(error) = &rebuilt {
            warn!(index = %id, action_id, code = error.code(), reason = %error, "index rebuild failed");
            handle.mark_failed(error.code(), error.to_string());
        }

        // A failure marked on the handle wins over the outcome passed here.
        match self.ledger.close(handle, ActionOutcome::Finished).await {
            Ok(row) => {
                self.notifier.notify_end(&index, &row).await;
            }
            Err(error) => {
                error!(index = %id, action_id, reason = %error, "could not close reindex action");
            }
        }

        let mut report = IndexReport::new(id.clone(), status_for(&rebuilt));
        if let Err(error) = rebuilt {
            report = report.with_error(error.code(), error.to_string());
        }
        report.strategy = Some(strategy);
        report.action_id = Some(action_id);
        report
    }
}

fn status_for(rebuilt: &Result<(), RebuildError>) -> IndexStatus {
    if rebuilt.is_ok() {
        IndexStatus::Finished
    } else {
        IndexStatus::Failed
    }
}
