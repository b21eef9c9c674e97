use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorError, IndexReport, IndexStatus};
use crate::db::ReindexDb;
use crate::engine::ReindexEngine;
use crate::index::{self, IndexBackend, IndexCatalog, IndexId};
use crate::lease::{self, ExclusiveLease, LeaseError, LeaseStore};
use crate::ledger::{
    self, ActionLedger, ActionStore, QueueState, QueueStore, QueuedActionRow, ReindexActionRow,
};
use crate::notifier::ProgressNotifier;
use crate::selection::CandidateSelector;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Maintenance is switched off; nothing was read or written.
    pub disabled: bool,
    /// Another worker held the lease, so this run did nothing.
    pub lease_unavailable: bool,
    pub leftovers_dropped: usize,
    pub queued_processed: usize,
    pub reports: Vec<IndexReport>,
}

#[derive(Clone, Debug)]
struct RunSettings {
    enabled: bool,
    schemas: Vec<String>,
    max_indexes_per_run: usize,
    queue_batch_size: usize,
}

/// Entry point used by schedulers and the command line.
pub struct Reindexer {
    settings: RunSettings,
    catalog: IndexCatalog,
    ledger: ActionLedger,
    queue: Arc<dyn QueueStore>,
    selector: CandidateSelector,
    coordinator: Coordinator,
}

impl Reindexer {
    pub fn from_parts(
        config: &Config,
        backend: Arc<dyn IndexBackend>,
        actions: Arc<dyn ActionStore>,
        queue: Arc<dyn QueueStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        let catalog = IndexCatalog::new(backend);
        let ledger = ActionLedger::new(actions, catalog.clone(), config.recent_window());
        let engine = Arc::new(ReindexEngine::new(catalog.clone(), config.engine.clone()));
        let coordinator = Coordinator::new(
            ExclusiveLease::coordinator(leases, config.lease.clone()),
            catalog.clone(),
            ledger.clone(),
            engine,
            ProgressNotifier::new(config.grafana.clone()),
            config.default_strategy,
        );
        Self {
            settings: RunSettings {
                enabled: config.enabled,
                schemas: config.schemas.clone(),
                max_indexes_per_run: config.max_indexes_per_run,
                queue_batch_size: config.queue_batch_size,
            },
            selector: CandidateSelector::new(catalog.clone(), ledger.clone(), config.thresholds.clone()),
            catalog,
            ledger,
            queue,
            coordinator,
        }
    }

    pub fn postgres(config: &Config, db: Arc<ReindexDb>) -> Self {
        Self::from_parts(
            config,
            index::backend::postgres(db.clone()),
            ledger::store::postgres(db.clone()),
            ledger::store::postgres_queue(db.clone()),
            lease::postgres(db),
        )
    }

    /// Queues `identifier` (`schema.index`) for the next run. The index must exist.
    pub async fn enqueue(&self, identifier: &str) -> Result<QueuedActionRow, CoordinatorError> {
        let index = self.catalog.fetch_qualified(identifier).await?;
        let row = self.queue.enqueue(&index.id.qualified(), Utc::now()).await?;
        info!(queued_id = row.id, index = %index.id, "queued index for rebuild");
        Ok(row)
    }

    pub async fn run_once(&self) -> Result<RunSummary, CoordinatorError> {
        let mut summary = RunSummary::default();
        if !self.settings.enabled {
            info!("index maintenance is disabled, skipping run");
            summary.disabled = true;
            return Ok(summary);
        }

        summary.leftovers_dropped = match self.cleanup_leftovers().await {
            Ok(dropped) => dropped,
            Err(CoordinatorError::Lease(LeaseError::Unavailable { .. })) => {
                info!("another worker holds the reindex lease, skipping run");
                summary.lease_unavailable = true;
                return Ok(summary);
            }
            Err(error) => {
                warn!(reason = %error, "leftover cleanup failed, continuing run");
                0
            }
        };

        let queued = self.queue.queued(self.settings.queue_batch_size).await?;
        summary.queued_processed = queued.len();
        for entry in queued {
            summary.reports.push(self.run_queued(entry).await);
        }
        if summary.queued_processed > 0 {
            return Ok(summary);
        }

        let pool: BTreeSet<IndexId> = self
            .catalog
            .candidate_pool(&self.settings.schemas)
            .await?
            .into_iter()
            .collect();
        let mut ranked = self.selector.select(&pool).await?;
        ranked.truncate(self.settings.max_indexes_per_run);
        summary.reports = self.coordinator.run(ranked).await;
        info!(
            rebuilt = summary
                .reports
                .iter()
                .filter(|report| report.status == IndexStatus::Finished)
                .count(),
            attempted = summary.reports.len(),
            "reindex run finished"
        );
        Ok(summary)
    }

    // Queued indexes were asked for explicitly, so the recency filter does not apply.
    async fn run_queued(&self, entry: QueuedActionRow) -> IndexReport {
        let id = match IndexId::parse(&entry.index_identifier) {
            Ok(id) => id,
            Err(error) => {
                warn!(queued_id = entry.id, reason = %error, "dropping malformed queue entry");
                self.complete_queued(entry.id, QueueState::Failed).await;
                return IndexReport {
                    index: IndexId::new(String::new(), entry.index_identifier),
                    status: IndexStatus::Rejected,
                    strategy: None,
                    action_id: None,
                    error_code: Some("malformed_identifier".to_string()),
                    message: Some(error.to_string()),
                };
            }
        };

        let report = self.coordinator.rebuild_one(&id, None).await;
        let next = match report.status {
            IndexStatus::Finished => Some(QueueState::Done),
            IndexStatus::Failed | IndexStatus::Rejected => Some(QueueState::Failed),
            // Left queued for a later run.
            IndexStatus::Skipped => None,
        };
        if let Some(state) = next {
            self.complete_queued(entry.id, state).await;
        }
        report
    }

    // A store failure here leaves the entry queued; the rest of the batch still runs.
    async fn complete_queued(&self, queued_id: i64, state: QueueState) {
        match self.queue.complete(queued_id, state, Utc::now()).await {
            Ok(_) => {
                info!(queued_id, state = state.as_str(), "completed queued rebuild");
            }
            Err(error) => {
                error!(queued_id, state = state.as_str(), reason = %error, "could not complete queue entry");
            }
        }
    }

    /// Drops temporary indexes left by interrupted rebuilds, holding the lease so no live
    /// rebuild's artifacts are touched.
    pub async fn cleanup_leftovers(&self) -> Result<usize, CoordinatorError> {
        let guard = self.coordinator.lease().acquire().await?;
        let dropped = self
            .coordinator
            .engine()
            .cleanup_leftovers(&self.settings.schemas)
            .await;
        if let Err(error) = guard.release().await {
            warn!(reason = %error, "failed to release lease after cleanup");
        }
        let dropped = dropped?;
        if dropped > 0 {
            info!(dropped, "dropped leftover temporary indexes");
        }
        Ok(dropped)
    }

    /// Actions started in the last `days` days, newest first.
    pub async fn recent_actions(&self, days: u32) -> Result<Vec<ReindexActionRow>, CoordinatorError> {
        Ok(self.ledger.started_within(days).await?)
    }

    pub async fn in_flight(&self) -> Result<Option<ReindexActionRow>, CoordinatorError> {
        Ok(self.ledger.in_flight().await?)
    }

    pub async fn queued(&self) -> Result<Vec<QueuedActionRow>, CoordinatorError> {
        Ok(self.queue.queued(usize::MAX).await?)
    }
}
