use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::index::{CatalogError, IndexBackend, IndexCatalog, IndexId, PostgresIndex};

pub mod lock_retries;
pub mod naming;
mod native;
mod shadow_swap;

pub use lock_retries::{LockRetries, LockRetryError, LockTiming};

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("{strategy} cannot rebuild {index}: {reason}")]
    UnsupportedIndexKind {
        strategy: RebuildStrategy,
        index: IndexId,
        reason: String,
    },
    #[error("leftover rebuild state: {0}")]
    DirtyState(String),
    #[error("shadow index {0} was built invalid")]
    BuildInvalid(IndexId),
    #[error("index swap gave up waiting for locks: {0}")]
    SwapLockTimeout(String),
    #[error("rebuild failed: {0}")]
    RebuildFailed(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl RebuildError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedIndexKind { .. } => "unsupported_index_kind",
            Self::DirtyState(_) => "dirty_state",
            Self::BuildInvalid(_) => "build_invalid",
            Self::SwapLockTimeout(_) => "swap_lock_timeout",
            Self::RebuildFailed(_) => "rebuild_failed",
            Self::Catalog(CatalogError::NotFound(_)) => "not_found",
            Self::Catalog(CatalogError::MalformedIdentifier(_)) => "malformed_identifier",
            Self::Catalog(CatalogError::Backend(_)) => "catalog_error",
        }
    }

    /// Rejections happen before anything is mutated or recorded.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedIndexKind { .. } | Self::DirtyState(_)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStrategy {
    /// Build a replacement under a temporary name, then swap names.
    ShadowSwap,
    /// `REINDEX INDEX CONCURRENTLY`.
    #[serde(rename = "native")]
    NativeConcurrent,
}

impl std::fmt::Display for RebuildStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RebuildStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShadowSwap => "shadow_swap",
            Self::NativeConcurrent => "native",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shadow_swap" | "shadow-swap" | "shadow" => Some(Self::ShadowSwap),
            "native" | "native_concurrent" | "reindex_concurrently" => Some(Self::NativeConcurrent),
            _ => None,
        }
    }

    /// Picks the strategy able to handle `index`, falling back to `default` when both are.
    pub fn for_index(index: &PostgresIndex, default: Self) -> Result<Self, RebuildError> {
        let strategy = match (index.is_unique, index.is_expression) {
            (true, true) => {
                return Err(RebuildError::UnsupportedIndexKind {
                    strategy: default,
                    index: index.id.clone(),
                    reason: "unique expression indexes have no safe online rebuild".to_string(),
                });
            }
            (true, false) => Self::NativeConcurrent,
            (false, true) => Self::ShadowSwap,
            (false, false) => default,
        };
        strategy.check(index)?;
        Ok(strategy)
    }

    /// Preconditions for running this strategy against `index`.
    pub fn check(self, index: &PostgresIndex) -> Result<(), RebuildError> {
        if naming::is_engine_artifact(&index.id.name) {
            return Err(RebuildError::DirtyState(format!(
                "{} matches a temporary rebuild name; an earlier run was interrupted",
                index.id
            )));
        }
        let unsupported = |reason: &str| RebuildError::UnsupportedIndexKind {
            strategy: self,
            index: index.id.clone(),
            reason: reason.to_string(),
        };
        if index.is_partitioned {
            return Err(unsupported("partitioned indexes are not supported"));
        }
        // Renaming a constraint's index renames the constraint with it, and the old body
        // cannot be dropped while the constraint still points at it.
        if index.is_exclusion {
            return Err(unsupported("indexes backing exclusion constraints are not supported"));
        }
        match self {
            Self::ShadowSwap if index.is_unique => {
                Err(unsupported("unique indexes cannot be swapped safely"))
            }
            Self::NativeConcurrent if index.is_expression => {
                Err(unsupported("expression indexes are not supported"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Statement timeout for the long-running build or rebuild.
    pub statement_timeout: Duration,
    /// Budget for the three-way rename.
    pub swap_retries: LockRetries,
    /// Budget for dropping each temporary index.
    pub cleanup_retries: LockRetries,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(24 * 60 * 60),
            swap_retries: LockRetries::uniform(10, Duration::from_secs(1), Duration::from_secs(1)),
            cleanup_retries: LockRetries::uniform(
                30,
                Duration::from_secs(60),
                Duration::from_secs(9 * 60),
            ),
        }
    }
}

pub struct ReindexEngine {
    backend: Arc<dyn IndexBackend>,
    catalog: IndexCatalog,
    settings: EngineSettings,
}

impl ReindexEngine {
    pub fn new(catalog: IndexCatalog, settings: EngineSettings) -> Self {
        Self {
            backend: catalog.backend(),
            catalog,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Chooses and validates a strategy without touching the database.
    pub fn plan(
        &self,
        index: &PostgresIndex,
        forced: Option<RebuildStrategy>,
        default: RebuildStrategy,
    ) -> Result<RebuildStrategy, RebuildError> {
        match forced {
            Some(strategy) => {
                strategy.check(index)?;
                Ok(strategy)
            }
            None => RebuildStrategy::for_index(index, default),
        }
    }

    /// Rebuilds `index` with `strategy`. Temporary indexes are gone when this returns,
    /// whatever the outcome.
    pub async fn rebuild(
        &self,
        index: &PostgresIndex,
        strategy: RebuildStrategy,
    ) -> Result<(), RebuildError> {
        strategy.check(index)?;
        info!(index = %index.id, %strategy, "starting index rebuild");

        match strategy {
            RebuildStrategy::ShadowSwap => shadow_swap::rebuild(self, index).await?,
            RebuildStrategy::NativeConcurrent => native::rebuild(self, index).await?,
        }

        let rebuilt = self.catalog.fetch(&index.id).await?;
        if !rebuilt.is_valid {
            return Err(RebuildError::RebuildFailed(format!(
                "{} is invalid after rebuild",
                index.id
            )));
        }
        info!(
            index = %index.id,
            %strategy,
            size_before = index.ondisk_size_bytes,
            size_after = rebuilt.ondisk_size_bytes,
            "index rebuild finished"
        );
        Ok(())
    }

    /// Drops every temporary index this engine or postgres could have left behind in
    /// `schemas`. Returns how many were dropped.
    pub async fn cleanup_leftovers(&self, schemas: &[String]) -> Result<usize, RebuildError> {
        let mut dropped = 0;
        for schema in schemas {
            for summary in self.catalog.list(schema).await? {
                if naming::is_engine_artifact(&summary.id.name) && self.drop_index(&summary.id).await
                {
                    dropped += 1;
                }
            }
        }
        Ok(dropped)
    }

    /// Best-effort drop under the cleanup lock budget; failures are logged, not returned.
    async fn drop_index(&self, id: &IndexId) -> bool {
        let backend = self.backend.as_ref();
        let outcome = self
            .settings
            .cleanup_retries
            .run("drop temporary index", move |lock_timeout| {
                backend.drop_index_if_exists(id, lock_timeout)
            })
            .await;
        match outcome {
            Ok(()) => {
                info!(index = %id, "dropped temporary index");
                true
            }
            Err(error) => {
                warn!(index = %id, reason = %error, "failed to drop temporary index");
                false
            }
        }
    }
}

/// Runs `body`, then `cleanup`, returning what `body` returned.
async fn with_cleanup<T, B, C>(body: B, cleanup: C) -> Result<T, RebuildError>
where
    B: Future<Output = Result<T, RebuildError>>,
    C: Future<Output = ()>,
{
    let outcome = body.await;
    cleanup.await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::{BackendFaults, MemoryIndex, MemoryIndexBackend};

    fn index(name: &str, memory: &MemoryIndex) -> PostgresIndex {
        PostgresIndex {
            id: IndexId::new("public", name),
            table: memory.table.clone(),
            definition: String::new(),
            access_method: memory.access_method.clone(),
            is_unique: memory.is_unique,
            is_valid: memory.is_valid,
            is_expression: memory.is_expression,
            is_exclusion: memory.is_exclusion,
            is_partitioned: memory.is_partitioned,
            ondisk_size_bytes: memory.ondisk_size_bytes,
            bloat_estimate_bytes: memory.bloat_estimate_bytes,
        }
    }

    fn fast_settings(swap_attempts: u32) -> EngineSettings {
        EngineSettings {
            statement_timeout: Duration::from_secs(60),
            swap_retries: LockRetries::uniform(
                swap_attempts,
                Duration::from_millis(10),
                Duration::from_millis(1),
            ),
            cleanup_retries: LockRetries::uniform(
                3,
                Duration::from_millis(10),
                Duration::from_millis(1),
            ),
        }
    }

    async fn engine_with(
        entries: &[(&str, MemoryIndex)],
        swap_attempts: u32,
    ) -> (Arc<MemoryIndexBackend>, ReindexEngine) {
        let backend = Arc::new(MemoryIndexBackend::default());
        for (name, body) in entries {
            backend
                .insert(IndexId::new("public", *name), body.clone())
                .await;
        }
        let engine = ReindexEngine::new(
            IndexCatalog::new(backend.clone()),
            fast_settings(swap_attempts),
        );
        (backend, engine)
    }

    #[test]
    fn strategy_follows_index_properties() -> anyhow::Result<()> {
        let plain = index("a", &MemoryIndex::btree("t", "(a)", 10, 1));
        let unique = index("b", &MemoryIndex::btree("t", "(b)", 10, 1).unique());
        let expression = index("c", &MemoryIndex::btree("t", "(lower(c))", 10, 1).expression());
        let exclusion = index("d", &MemoryIndex::btree("t", "(d)", 10, 1).exclusion());
        let both = index(
            "e",
            &MemoryIndex::btree("t", "(lower(e))", 10, 1).unique().expression(),
        );

        let native = RebuildStrategy::NativeConcurrent;
        let shadow = RebuildStrategy::ShadowSwap;
        assert_eq!(RebuildStrategy::for_index(&plain, native)?, native);
        assert_eq!(RebuildStrategy::for_index(&plain, shadow)?, shadow);
        assert_eq!(RebuildStrategy::for_index(&unique, shadow)?, native);
        assert_eq!(RebuildStrategy::for_index(&expression, native)?, shadow);
        for candidate in [&exclusion, &both] {
            for default in [native, shadow] {
                assert!(matches!(
                    RebuildStrategy::for_index(candidate, default),
                    Err(RebuildError::UnsupportedIndexKind { .. })
                ));
            }
        }
        Ok(())
    }

    #[test]
    fn strategy_names_agree_everywhere() -> anyhow::Result<()> {
        for strategy in [RebuildStrategy::ShadowSwap, RebuildStrategy::NativeConcurrent] {
            let encoded = serde_json::to_value(strategy)?;
            assert_eq!(encoded, serde_json::json!(strategy.as_str()));
            assert_eq!(encoded, serde_json::json!(strategy.to_string()));
            assert_eq!(RebuildStrategy::parse(strategy.as_str()), Some(strategy));
            assert_eq!(serde_json::from_value::<RebuildStrategy>(encoded)?, strategy);
        }
        Ok(())
    }

    #[test]
    fn preconditions_reject_unsupported_kinds_and_artifacts() {
        let unique = index("b", &MemoryIndex::btree("t", "(b)", 10, 1).unique());
        let expression = index("c", &MemoryIndex::btree("t", "(lower(c))", 10, 1).expression());
        let exclusion = index("d", &MemoryIndex::btree("t", "(d)", 10, 1).exclusion());
        let leftover = index("tmp_reindex_a", &MemoryIndex::btree("t", "(a)", 10, 1));
        let ccnew = index("a_ccnew", &MemoryIndex::btree("t", "(a)", 10, 1));

        let shadow = RebuildStrategy::ShadowSwap;
        let native = RebuildStrategy::NativeConcurrent;
        assert!(matches!(
            shadow.check(&unique),
            Err(RebuildError::UnsupportedIndexKind { .. })
        ));
        assert!(matches!(
            native.check(&expression),
            Err(RebuildError::UnsupportedIndexKind { .. })
        ));
        for strategy in [shadow, native] {
            assert!(matches!(
                strategy.check(&exclusion),
                Err(RebuildError::UnsupportedIndexKind { .. })
            ));
        }
        assert!(matches!(shadow.check(&leftover), Err(RebuildError::DirtyState(_))));
        assert!(matches!(native.check(&ccnew), Err(RebuildError::DirtyState(_))));
        assert!(native.check(&unique).is_ok());
    }

    #[tokio::test]
    async fn shadow_swap_replaces_body_and_keeps_names() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[
                ("users_name_idx", MemoryIndex::btree("users", "(name)", 1_000, 600)),
                ("users_email_idx", MemoryIndex::btree("users", "(email)", 500, 100)),
            ],
            3,
        )
        .await;
        let id = IndexId::new("public", "users_name_idx");
        let before_names = backend.names("public").await;
        let target = engine.catalog.fetch(&id).await?;

        engine.rebuild(&target, RebuildStrategy::ShadowSwap).await?;

        assert_eq!(backend.names("public").await, before_names);
        let after = engine.catalog.fetch(&id).await?;
        assert!(after.is_valid);
        assert_eq!(after.ondisk_size_bytes, 400);
        assert_eq!(after.bloat_estimate_bytes, 0);
        assert_eq!(after.definition, target.definition);
        let untouched = backend
            .get(&IndexId::new("public", "users_email_idx"))
            .await;
        assert_eq!(untouched.map(|body| body.ondisk_size_bytes), Some(500));
        Ok(())
    }

    #[tokio::test]
    async fn shadow_swap_is_repeatable() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[("orders_idx", MemoryIndex::btree("orders", "(id)", 800, 200))],
            3,
        )
        .await;
        let id = IndexId::new("public", "orders_idx");

        for _ in 0..2 {
            let target = engine.catalog.fetch(&id).await?;
            engine.rebuild(&target, RebuildStrategy::ShadowSwap).await?;
        }

        assert_eq!(backend.names("public").await, vec!["orders_idx".to_string()]);
        let after = engine.catalog.fetch(&id).await?;
        assert!(after.is_valid);
        assert_eq!(after.ondisk_size_bytes, 600);
        Ok(())
    }

    #[tokio::test]
    async fn shadow_swap_clears_leftover_shadow_first() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[
                ("orders_idx", MemoryIndex::btree("orders", "(id)", 800, 200)),
                (
                    "tmp_reindex_orders_idx",
                    MemoryIndex::btree("orders", "(id)", 800, 0).invalid(),
                ),
            ],
            3,
        )
        .await;
        let target = engine
            .catalog
            .fetch(&IndexId::new("public", "orders_idx"))
            .await?;

        engine.rebuild(&target, RebuildStrategy::ShadowSwap).await?;

        assert_eq!(backend.names("public").await, vec!["orders_idx".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_shadow_build_is_never_swapped_in() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[("orders_idx", MemoryIndex::btree("orders", "(id)", 800, 200))],
            3,
        )
        .await;
        backend
            .set_faults(BackendFaults {
                build_invalid: true,
                ..BackendFaults::default()
            })
            .await;
        let id = IndexId::new("public", "orders_idx");
        let target = engine.catalog.fetch(&id).await?;

        let outcome = engine.rebuild(&target, RebuildStrategy::ShadowSwap).await;

        assert!(matches!(outcome, Err(RebuildError::BuildInvalid(_))));
        assert_eq!(engine.catalog.fetch(&id).await?, target);
        assert_eq!(backend.names("public").await, vec!["orders_idx".to_string()]);
        assert_eq!(backend.stats().await.rename_attempts, 0);
        Ok(())
    }

    #[tokio::test]
    async fn swap_gives_up_after_lock_budget() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[("orders_idx", MemoryIndex::btree("orders", "(id)", 800, 200))],
            3,
        )
        .await;
        backend
            .set_faults(BackendFaults {
                rename_lock_failures: u32::MAX,
                ..BackendFaults::default()
            })
            .await;
        let id = IndexId::new("public", "orders_idx");
        let target = engine.catalog.fetch(&id).await?;

        let outcome = engine.rebuild(&target, RebuildStrategy::ShadowSwap).await;

        assert!(matches!(outcome, Err(RebuildError::SwapLockTimeout(_))));
        assert_eq!(backend.stats().await.rename_attempts, 3);
        assert_eq!(engine.catalog.fetch(&id).await?, target);
        assert_eq!(backend.names("public").await, vec!["orders_idx".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn exclusion_indexes_are_never_swapped() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[(
                "bookings_room_during_excl",
                MemoryIndex::btree("bookings", "(room, during)", 800, 200).exclusion(),
            )],
            3,
        )
        .await;
        let id = IndexId::new("public", "bookings_room_during_excl");
        let target = engine.catalog.fetch(&id).await?;

        let outcome = engine.rebuild(&target, RebuildStrategy::ShadowSwap).await;

        assert!(matches!(
            outcome,
            Err(RebuildError::UnsupportedIndexKind { .. })
        ));
        assert_eq!(
            backend.names("public").await,
            vec!["bookings_room_during_excl".to_string()]
        );
        let stats = backend.stats().await;
        assert_eq!((stats.builds, stats.rename_attempts), (0, 0));
        assert_eq!(engine.catalog.fetch(&id).await?, target);
        Ok(())
    }

    #[tokio::test]
    async fn constraint_backed_leftovers_cannot_be_dropped() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[(
                "tmp_reindex_bookings_excl",
                MemoryIndex::btree("bookings", "(room, during)", 800, 200).exclusion(),
            )],
            3,
        )
        .await;

        let dropped = engine.cleanup_leftovers(&["public".to_string()]).await?;

        assert_eq!(dropped, 0);
        assert_eq!(
            backend.names("public").await,
            vec!["tmp_reindex_bookings_excl".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn native_rebuild_refreshes_body_in_place() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[("users_pkey", MemoryIndex::btree("users", "(id)", 900, 300).unique())],
            3,
        )
        .await;
        let id = IndexId::new("public", "users_pkey");
        let target = engine.catalog.fetch(&id).await?;

        engine
            .rebuild(&target, RebuildStrategy::NativeConcurrent)
            .await?;

        let after = engine.catalog.fetch(&id).await?;
        assert!(after.is_valid);
        assert_eq!(after.ondisk_size_bytes, 600);
        assert_eq!(backend.stats().await.reindexes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn native_failure_still_drops_leftovers() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[
                ("users_pkey", MemoryIndex::btree("users", "(id)", 900, 300).unique()),
                (
                    "users_pkey_ccold",
                    MemoryIndex::btree("users", "(id)", 900, 300).invalid(),
                ),
                ("users_idx_ccnew", MemoryIndex::btree("users", "(x)", 10, 0)),
            ],
            3,
        )
        .await;
        backend
            .set_faults(BackendFaults {
                reindex_error: Some("deadlock detected".to_string()),
                reindex_leaves_artifact: true,
                drop_lock_failures: 1,
                ..BackendFaults::default()
            })
            .await;
        let id = IndexId::new("public", "users_pkey");
        let target = engine.catalog.fetch(&id).await?;

        let outcome = engine
            .rebuild(&target, RebuildStrategy::NativeConcurrent)
            .await;

        assert!(matches!(outcome, Err(RebuildError::RebuildFailed(_))));
        // Only artifacts derived from the target are touched.
        assert_eq!(
            backend.names("public").await,
            vec!["users_idx_ccnew".to_string(), "users_pkey".to_string()]
        );
        assert_eq!(engine.catalog.fetch(&id).await?, target);
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_failures_do_not_change_the_outcome() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[("orders_idx", MemoryIndex::btree("orders", "(id)", 800, 200))],
            3,
        )
        .await;
        backend
            .set_faults(BackendFaults {
                drop_error: Some("permission denied".to_string()),
                ..BackendFaults::default()
            })
            .await;
        let id = IndexId::new("public", "orders_idx");
        let target = engine.catalog.fetch(&id).await?;

        engine.rebuild(&target, RebuildStrategy::ShadowSwap).await?;
        assert!(engine.catalog.fetch(&id).await?.is_valid);
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_leftovers_drops_every_artifact() -> anyhow::Result<()> {
        let (backend, engine) = engine_with(
            &[
                ("orders_idx", MemoryIndex::btree("orders", "(id)", 800, 200)),
                ("tmp_reindex_orders_idx", MemoryIndex::btree("orders", "(id)", 8, 0)),
                ("old_reindex_orders_idx", MemoryIndex::btree("orders", "(id)", 8, 0)),
                ("orders_idx_ccnew1", MemoryIndex::btree("orders", "(id)", 8, 0).invalid()),
            ],
            3,
        )
        .await;

        let dropped = engine.cleanup_leftovers(&["public".to_string()]).await?;

        assert_eq!(dropped, 3);
        assert_eq!(backend.names("public").await, vec!["orders_idx".to_string()]);
        Ok(())
    }
}
