use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod memory;

pub use backend::{BackendError, BuildRequest, IndexBackend, IndexSummary};

/// Stable identity of an index: its schema and its name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId {
    pub schema: String,
    pub name: String,
}

impl IndexId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parses a schema-qualified identifier such as `public.users_pkey`.
    pub fn parse(identifier: &str) -> Result<Self, CatalogError> {
        let trimmed = identifier.trim();
        let Some((schema, name)) = trimmed.split_once('.') else {
            return Err(CatalogError::MalformedIdentifier(trimmed.to_string()));
        };
        if schema.is_empty() || name.is_empty() {
            return Err(CatalogError::MalformedIdentifier(trimmed.to_string()));
        }
        Ok(Self::new(schema, name))
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Quoted form safe to splice into DDL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.schema.clone(), name)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

pub fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Quotes only when postgres would, matching the output of `pg_get_indexdef`.
pub fn quote_ident_if_needed(value: &str) -> String {
    let plain = value
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_')
        && value
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
    if plain {
        value.to_string()
    } else {
        quote_ident(value)
    }
}

/// Catalog snapshot of a single index. Only trusted for the instant it was read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostgresIndex {
    pub id: IndexId,
    pub table: String,
    pub definition: String,
    pub access_method: String,
    pub is_unique: bool,
    pub is_valid: bool,
    pub is_expression: bool,
    pub is_exclusion: bool,
    pub is_partitioned: bool,
    pub ondisk_size_bytes: u64,
    pub bloat_estimate_bytes: u64,
}

impl PostgresIndex {
    pub fn relative_bloat(&self) -> f64 {
        if self.ondisk_size_bytes == 0 {
            return 0.0;
        }
        self.bloat_estimate_bytes as f64 / self.ondisk_size_bytes as f64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("index not found: {0}")]
    NotFound(IndexId),
    #[error("index identifier must be schema-qualified: {0:?}")]
    MalformedIdentifier(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Read-only view over the storage engine's index catalog. Never caches.
#[derive(Clone)]
pub struct IndexCatalog {
    backend: Arc<dyn IndexBackend>,
}

impl IndexCatalog {
    pub fn new(backend: Arc<dyn IndexBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn IndexBackend> {
        self.backend.clone()
    }

    pub async fn fetch(&self, id: &IndexId) -> Result<PostgresIndex, CatalogError> {
        self.backend
            .fetch_index(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.clone()))
    }

    pub async fn fetch_qualified(&self, identifier: &str) -> Result<PostgresIndex, CatalogError> {
        let id = IndexId::parse(identifier)?;
        self.fetch(&id).await
    }

    /// Indexes in `schemas` that automatic maintenance may consider: valid,
    /// non-partitioned btree indexes that are not artifacts of an earlier rebuild.
    pub async fn candidate_pool(&self, schemas: &[String]) -> Result<Vec<IndexId>, CatalogError> {
        let mut pool = Vec::new();
        for schema in schemas {
            let summaries = self.backend.list_indexes(schema).await?;
            pool.extend(
                summaries
                    .into_iter()
                    .filter(|summary| {
                        summary.is_valid
                            && !summary.is_partitioned
                            && summary.access_method == "btree"
                            && !crate::engine::naming::is_engine_artifact(&summary.id.name)
                    })
                    .map(|summary| summary.id),
            );
        }
        pool.sort();
        Ok(pool)
    }

    pub async fn list(&self, schema: &str) -> Result<Vec<IndexSummary>, CatalogError> {
        Ok(self.backend.list_indexes(schema).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::{MemoryIndex, MemoryIndexBackend};

    #[test]
    fn parse_requires_schema_qualification() {
        assert!(matches!(
            IndexId::parse("users_pkey"),
            Err(CatalogError::MalformedIdentifier(_))
        ));
        assert!(matches!(
            IndexId::parse(".users_pkey"),
            Err(CatalogError::MalformedIdentifier(_))
        ));
        let parsed = IndexId::parse(" public.users_pkey ");
        assert!(matches!(parsed, Ok(ref id) if id == &IndexId::new("public", "users_pkey")));
    }

    #[test]
    fn quoting_follows_postgres_rules() {
        assert_eq!(quote_ident_if_needed("users_pkey"), "users_pkey");
        assert_eq!(quote_ident_if_needed("Users"), "\"Users\"");
        assert_eq!(quote_ident_if_needed("1st"), "\"1st\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn fetch_rereads_catalog_every_time() -> anyhow::Result<()> {
        let backend = Arc::new(MemoryIndexBackend::default());
        let id = IndexId::new("public", "users_name_idx");
        backend
            .insert(id.clone(), MemoryIndex::btree("users", "(name)", 1_000, 400))
            .await;
        let catalog = IndexCatalog::new(backend.clone());

        let first = catalog.fetch(&id).await?;
        assert_eq!(first.bloat_estimate_bytes, 400);

        backend
            .insert(id.clone(), MemoryIndex::btree("users", "(name)", 1_000, 50))
            .await;
        let second = catalog.fetch(&id).await?;
        assert_eq!(second.bloat_estimate_bytes, 50);

        backend.remove(&id).await;
        assert!(matches!(
            catalog.fetch(&id).await,
            Err(CatalogError::NotFound(_))
        ));
        assert!(matches!(
            catalog.fetch_qualified("users_name_idx").await,
            Err(CatalogError::MalformedIdentifier(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn candidate_pool_skips_artifacts_and_invalid_indexes() -> anyhow::Result<()> {
        let backend = Arc::new(MemoryIndexBackend::default());
        backend
            .insert(
                IndexId::new("public", "a_idx"),
                MemoryIndex::btree("t", "(a)", 10, 1),
            )
            .await;
        backend
            .insert(
                IndexId::new("public", "b_idx"),
                MemoryIndex::btree("t", "(b)", 10, 1).invalid(),
            )
            .await;
        backend
            .insert(
                IndexId::new("public", "a_idx_ccnew"),
                MemoryIndex::btree("t", "(a)", 10, 1),
            )
            .await;
        backend
            .insert(
                IndexId::new("public", "tmp_reindex_a_idx"),
                MemoryIndex::btree("t", "(a)", 10, 1),
            )
            .await;
        backend
            .insert(
                IndexId::new("other", "c_idx"),
                MemoryIndex::btree("t", "(c)", 10, 1),
            )
            .await;

        let catalog = IndexCatalog::new(backend);
        let pool = catalog.candidate_pool(&["public".to_string()]).await?;
        assert_eq!(pool, vec![IndexId::new("public", "a_idx")]);
        Ok(())
    }
}
