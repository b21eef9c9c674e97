use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::naming;
use crate::index::backend::{BackendError, BuildRequest, IndexBackend, IndexSummary};
use crate::index::{IndexId, PostgresIndex, quote_ident_if_needed};

/// Body of an index held by [`MemoryIndexBackend`]. The definition is rendered from the
/// current name on every read, the way `pg_get_indexdef` does.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryIndex {
    pub table: String,
    pub key: String,
    pub access_method: String,
    pub is_unique: bool,
    pub is_valid: bool,
    pub is_expression: bool,
    pub is_exclusion: bool,
    pub is_partitioned: bool,
    pub ondisk_size_bytes: u64,
    pub bloat_estimate_bytes: u64,
}

impl MemoryIndex {
    pub fn btree(table: &str, key: &str, ondisk_size_bytes: u64, bloat_estimate_bytes: u64) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            access_method: "btree".to_string(),
            is_unique: false,
            is_valid: true,
            is_expression: false,
            is_exclusion: false,
            is_partitioned: false,
            ondisk_size_bytes,
            bloat_estimate_bytes,
        }
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn expression(mut self) -> Self {
        self.is_expression = true;
        self
    }

    /// Backs an exclusion constraint, so postgres refuses to drop it.
    pub fn exclusion(mut self) -> Self {
        self.access_method = "gist".to_string();
        self.is_exclusion = true;
        self
    }

    pub fn invalid(mut self) -> Self {
        self.is_valid = false;
        self
    }

    fn definition(&self, id: &IndexId) -> String {
        format!(
            "CREATE {}INDEX {} ON {}.{} USING {} {}",
            if self.is_unique { "UNIQUE " } else { "" },
            quote_ident_if_needed(&id.name),
            quote_ident_if_needed(&id.schema),
            quote_ident_if_needed(&self.table),
            self.access_method,
            self.key
        )
    }

    fn snapshot(&self, id: &IndexId) -> PostgresIndex {
        PostgresIndex {
            id: id.clone(),
            table: self.table.clone(),
            definition: self.definition(id),
            access_method: self.access_method.clone(),
            is_unique: self.is_unique,
            is_valid: self.is_valid,
            is_expression: self.is_expression,
            is_exclusion: self.is_exclusion,
            is_partitioned: self.is_partitioned,
            ondisk_size_bytes: self.ondisk_size_bytes,
            bloat_estimate_bytes: self.bloat_estimate_bytes,
        }
    }

    fn rebuilt(&self) -> Self {
        let mut fresh = self.clone();
        fresh.ondisk_size_bytes = self
            .ondisk_size_bytes
            .saturating_sub(self.bloat_estimate_bytes);
        fresh.bloat_estimate_bytes = 0;
        fresh.is_valid = true;
        fresh
    }
}

/// Failure injection for [`MemoryIndexBackend`].
#[derive(Clone, Debug, Default)]
pub struct BackendFaults {
    /// Concurrent builds complete but leave the new index invalid.
    pub build_invalid: bool,
    /// Number of rename transactions that fail with a lock timeout before one succeeds.
    pub rename_lock_failures: u32,
    /// Native rebuilds fail with this message.
    pub reindex_error: Option<String>,
    /// A failing native rebuild leaves an invalid `_ccnew` index behind, as postgres does
    /// when interrupted.
    pub reindex_leaves_artifact: bool,
    /// Number of drops that fail with a lock timeout before one succeeds.
    pub drop_lock_failures: u32,
    /// Every drop fails with a non-lock error.
    pub drop_error: Option<String>,
    /// Simulated duration of each build or native rebuild.
    pub ddl_delay: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub builds: u32,
    pub reindexes: u32,
    pub rename_attempts: u32,
    pub drop_attempts: u32,
    pub dropped: Vec<IndexId>,
    pub ddl_in_flight: u32,
    pub max_ddl_in_flight: u32,
}

#[derive(Default)]
struct MemoryBackendInner {
    indexes: BTreeMap<IndexId, MemoryIndex>,
    faults: BackendFaults,
    stats: BackendStats,
}

/// In-process stand-in for the postgres catalog, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryIndexBackend {
    inner: Mutex<MemoryBackendInner>,
}

impl MemoryIndexBackend {
    pub async fn insert(&self, id: IndexId, index: MemoryIndex) {
        self.inner.lock().await.indexes.insert(id, index);
    }

    pub async fn remove(&self, id: &IndexId) -> Option<MemoryIndex> {
        self.inner.lock().await.indexes.remove(id)
    }

    pub async fn get(&self, id: &IndexId) -> Option<MemoryIndex> {
        self.inner.lock().await.indexes.get(id).cloned()
    }

    pub async fn names(&self, schema: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .indexes
            .keys()
            .filter(|id| id.schema == schema)
            .map(|id| id.name.clone())
            .collect()
    }

    pub async fn set_faults(&self, faults: BackendFaults) {
        self.inner.lock().await.faults = faults;
    }

    pub async fn stats(&self) -> BackendStats {
        self.inner.lock().await.stats.clone()
    }

    async fn begin_ddl(&self) -> Duration {
        let mut inner = self.inner.lock().await;
        inner.stats.ddl_in_flight += 1;
        inner.stats.max_ddl_in_flight = inner.stats.max_ddl_in_flight.max(inner.stats.ddl_in_flight);
        inner.faults.ddl_delay
    }

    async fn end_ddl(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.ddl_in_flight = inner.stats.ddl_in_flight.saturating_sub(1);
    }
}

#[async_trait]
impl IndexBackend for MemoryIndexBackend {
    async fn fetch_index(&self, id: &IndexId) -> Result<Option<PostgresIndex>, BackendError> {
        let inner = self.inner.lock().await;
        Ok(inner.indexes.get(id).map(|index| index.snapshot(id)))
    }

    async fn list_indexes(&self, schema: &str) -> Result<Vec<IndexSummary>, BackendError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .indexes
            .iter()
            .filter(|(id, _)| id.schema == schema)
            .map(|(id, index)| IndexSummary {
                id: id.clone(),
                table: index.table.clone(),
                access_method: index.access_method.clone(),
                is_valid: index.is_valid,
                is_partitioned: index.is_partitioned,
            })
            .collect())
    }

    async fn create_index_concurrently(
        &self,
        request: &BuildRequest,
        _statement_timeout: Duration,
    ) -> Result<(), BackendError> {
        let delay = self.begin_ddl().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = {
            let mut inner = self.inner.lock().await;
            inner.stats.builds += 1;
            if inner.indexes.contains_key(&request.shadow) {
                Err(BackendError::Db(format!(
                    "relation \"{}\" already exists",
                    request.shadow.name
                )))
            } else if let Some(target) = inner.indexes.get(&request.target) {
                let mut built = target.rebuilt();
                built.is_valid = !inner.faults.build_invalid;
                inner.indexes.insert(request.shadow.clone(), built);
                Ok(())
            } else {
                Err(BackendError::Db(format!(
                    "relation \"{}\" does not exist",
                    request.target.name
                )))
            }
        };
        self.end_ddl().await;
        outcome
    }

    async fn rename_indexes(
        &self,
        schema: &str,
        renames: &[(String, String)],
        _lock_timeout: Duration,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        inner.stats.rename_attempts += 1;
        if inner.faults.rename_lock_failures > 0 {
            inner.faults.rename_lock_failures -= 1;
            return Err(BackendError::LockTimeout(
                "canceling statement due to lock timeout".to_string(),
            ));
        }

        let mut staged = inner.indexes.clone();
        for (from, to) in renames {
            let from_id = IndexId::new(schema, from.clone());
            let to_id = IndexId::new(schema, to.clone());
            if staged.contains_key(&to_id) {
                return Err(BackendError::Db(format!("relation \"{to}\" already exists")));
            }
            let Some(body) = staged.remove(&from_id) else {
                return Err(BackendError::Db(format!("relation \"{from}\" does not exist")));
            };
            staged.insert(to_id, body);
        }
        inner.indexes = staged;
        Ok(())
    }

    async fn reindex_concurrently(
        &self,
        id: &IndexId,
        _statement_timeout: Duration,
    ) -> Result<(), BackendError> {
        let delay = self.begin_ddl().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = {
            let mut inner = self.inner.lock().await;
            inner.stats.reindexes += 1;
            match inner.indexes.get(id).cloned() {
                None => Err(BackendError::Db(format!(
                    "relation \"{}\" does not exist",
                    id.name
                ))),
                Some(current) => match inner.faults.reindex_error.clone() {
                    Some(message) => {
                        if inner.faults.reindex_leaves_artifact {
                            let artifact =
                                id.sibling(naming::native_artifact_name(&id.name, "_ccnew"));
                            inner.indexes.insert(artifact, current.rebuilt().invalid());
                        }
                        Err(BackendError::Db(message))
                    }
                    None => {
                        inner.indexes.insert(id.clone(), current.rebuilt());
                        Ok(())
                    }
                },
            }
        };
        self.end_ddl().await;
        outcome
    }

    async fn drop_index_if_exists(
        &self,
        id: &IndexId,
        _lock_timeout: Duration,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        inner.stats.drop_attempts += 1;
        if let Some(message) = inner.faults.drop_error.clone() {
            return Err(BackendError::Db(message));
        }
        if inner.faults.drop_lock_failures > 0 {
            inner.faults.drop_lock_failures -= 1;
            return Err(BackendError::LockTimeout(
                "canceling statement due to lock timeout".to_string(),
            ));
        }
        if let Some(body) = inner.indexes.get(id)
            && body.is_exclusion
        {
            return Err(BackendError::Db(format!(
                "cannot drop index {} because constraint {} on table {} requires it",
                id.name, id.name, body.table
            )));
        }
        if inner.indexes.remove(id).is_some() {
            inner.stats.dropped.push(id.clone());
        }
        Ok(())
    }
}
