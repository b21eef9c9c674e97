use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::Client;
use tokio_postgres::error::SqlState;

use crate::db::ReindexDb;
use crate::index::{IndexId, PostgresIndex, quote_ident};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("lock not available: {0}")]
    LockTimeout(String),
    #[error("db error: {0}")]
    Db(String),
}

impl From<tokio_postgres::Error> for BackendError {
    fn from(error: tokio_postgres::Error) -> Self {
        if error.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) {
            Self::LockTimeout(error.to_string())
        } else {
            Self::Db(error.to_string())
        }
    }
}

/// Lightweight catalog row used for scans; carries no size or bloat figures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSummary {
    pub id: IndexId,
    pub table: String,
    pub access_method: String,
    pub is_valid: bool,
    pub is_partitioned: bool,
}

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub target: IndexId,
    pub shadow: IndexId,
    /// Full `CREATE INDEX CONCURRENTLY` statement for the shadow index.
    pub statement: String,
}

/// The storage-engine capabilities index maintenance relies on.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn fetch_index(&self, id: &IndexId) -> Result<Option<PostgresIndex>, BackendError>;

    async fn list_indexes(&self, schema: &str) -> Result<Vec<IndexSummary>, BackendError>;

    async fn create_index_concurrently(
        &self,
        request: &BuildRequest,
        statement_timeout: Duration,
    ) -> Result<(), BackendError>;

    /// Applies every rename in order inside one transaction; all or nothing.
    async fn rename_indexes(
        &self,
        schema: &str,
        renames: &[(String, String)],
        lock_timeout: Duration,
    ) -> Result<(), BackendError>;

    async fn reindex_concurrently(
        &self,
        id: &IndexId,
        statement_timeout: Duration,
    ) -> Result<(), BackendError>;

    async fn drop_index_if_exists(
        &self,
        id: &IndexId,
        lock_timeout: Duration,
    ) -> Result<(), BackendError>;
}

pub fn postgres(db: Arc<ReindexDb>) -> Arc<dyn IndexBackend> {
    Arc::new(PostgresIndexBackend { db })
}

struct PostgresIndexBackend {
    db: Arc<ReindexDb>,
}

const FETCH_INDEX_SQL: &str = r#"
    SELECT n.nspname AS schema_name,
           i.relname AS index_name,
           t.relname AS table_name,
           pg_get_indexdef(i.oid) AS definition,
           am.amname AS access_method,
           x.indisunique AS is_unique,
           x.indisvalid AS is_valid,
           x.indexprs IS NOT NULL AS is_expression,
           EXISTS (
             SELECT 1
               FROM pg_constraint c
              WHERE c.conindid = i.oid
                AND c.contype = 'x'
           ) AS is_exclusion,
           i.relkind = 'I' AS is_partitioned,
           pg_relation_size(i.oid) AS ondisk_size_bytes
      FROM pg_index x
      JOIN pg_class i ON i.oid = x.indexrelid
      JOIN pg_class t ON t.oid = x.indrelid
      JOIN pg_namespace n ON n.oid = i.relnamespace
      JOIN pg_am am ON am.oid = i.relam
     WHERE n.nspname = $1
       AND i.relname = $2
"#;

// Statistics-based btree bloat estimate for a single index.
const BTREE_BLOAT_SQL: &str = r#"
    WITH index_atts AS (
      SELECT n.nspname,
             ct.relname AS table_name,
             ci.reltuples,
             ci.relpages,
             i.indrelid,
             regexp_split_to_table(i.indkey::text, ' ')::smallint AS attnum
        FROM pg_index i
        JOIN pg_class ci ON ci.oid = i.indexrelid
        JOIN pg_class ct ON ct.oid = i.indrelid
        JOIN pg_namespace n ON n.oid = ci.relnamespace
       WHERE n.nspname = $1
         AND ci.relname = $2
    ), item_sizes AS (
      SELECT atts.reltuples,
             atts.relpages,
             current_setting('block_size')::numeric AS bs,
             8 AS maxalign,
             24 AS pagehdr,
             CASE WHEN max(coalesce(s.null_frac, 0)) = 0 THEN 2 ELSE 6 END AS tuple_hdr,
             sum((1 - coalesce(s.null_frac, 0)) * coalesce(s.avg_width, 1024)) AS nulldatawidth
        FROM index_atts atts
        JOIN pg_attribute a ON a.attrelid = atts.indrelid AND a.attnum = atts.attnum
        JOIN pg_stats s
          ON s.schemaname = atts.nspname
         AND s.tablename = atts.table_name
         AND s.attname = a.attname
       GROUP BY 1, 2, 3, 4, 5
    ), aligned AS (
      SELECT bs,
             reltuples,
             relpages,
             pagehdr,
             (2 + maxalign
                - CASE WHEN tuple_hdr % maxalign = 0 THEN maxalign ELSE tuple_hdr % maxalign END
                + nulldatawidth + maxalign
                - CASE WHEN nulldatawidth::integer % maxalign = 0 THEN maxalign
                       ELSE nulldatawidth::integer % maxalign END
             )::numeric AS tuple_width
        FROM item_sizes
    ), expected AS (
      SELECT bs,
             relpages,
             coalesce(ceil((reltuples * (4 + tuple_width)) / (bs - pagehdr::float)) + 1, 0) AS est_pages
        FROM aligned
    )
    SELECT greatest(0, (relpages - est_pages) * bs)::bigint AS bloat_estimate_bytes
      FROM expected
"#;

#[async_trait]
impl IndexBackend for PostgresIndexBackend {
    async fn fetch_index(&self, id: &IndexId) -> Result<Option<PostgresIndex>, BackendError> {
        let client = self.db.client();
        let client = client.lock().await;
        let Some(row) = client
            .query_opt(FETCH_INDEX_SQL, &[&id.schema, &id.name])
            .await?
        else {
            return Ok(None);
        };

        let access_method: String = row.get("access_method");
        let is_expression: bool = row.get("is_expression");
        let bloat_estimate_bytes = if access_method == "btree" && !is_expression {
            client
                .query_opt(BTREE_BLOAT_SQL, &[&id.schema, &id.name])
                .await?
                .and_then(|row| row.get::<_, Option<i64>>("bloat_estimate_bytes"))
                .map_or(0, u64_from_i64)
        } else {
            0
        };

        Ok(Some(PostgresIndex {
            id: IndexId::new(
                row.get::<_, String>("schema_name"),
                row.get::<_, String>("index_name"),
            ),
            table: row.get("table_name"),
            definition: row.get("definition"),
            access_method,
            is_unique: row.get("is_unique"),
            is_valid: row.get("is_valid"),
            is_expression,
            is_exclusion: row.get("is_exclusion"),
            is_partitioned: row.get("is_partitioned"),
            ondisk_size_bytes: u64_from_i64(row.get("ondisk_size_bytes")),
            bloat_estimate_bytes,
        }))
    }

    async fn list_indexes(&self, schema: &str) -> Result<Vec<IndexSummary>, BackendError> {
        let client = self.db.client();
        let rows = client
            .lock()
            .await
            .query(
                r#"
                SELECT n.nspname AS schema_name,
                       i.relname AS index_name,
                       t.relname AS table_name,
                       am.amname AS access_method,
                       x.indisvalid AS is_valid,
                       i.relkind = 'I' AS is_partitioned
                  FROM pg_index x
                  JOIN pg_class i ON i.oid = x.indexrelid
                  JOIN pg_class t ON t.oid = x.indrelid
                  JOIN pg_namespace n ON n.oid = i.relnamespace
                  JOIN pg_am am ON am.oid = i.relam
                 WHERE n.nspname = $1
                 ORDER BY i.relname
                "#,
                &[&schema],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| IndexSummary {
                id: IndexId::new(
                    row.get::<_, String>("schema_name"),
                    row.get::<_, String>("index_name"),
                ),
                table: row.get("table_name"),
                access_method: row.get("access_method"),
                is_valid: row.get("is_valid"),
                is_partitioned: row.get("is_partitioned"),
            })
            .collect())
    }

    async fn create_index_concurrently(
        &self,
        request: &BuildRequest,
        statement_timeout: Duration,
    ) -> Result<(), BackendError> {
        let client = self.db.client();
        let client = client.lock().await;
        with_session_setting(
            &client,
            "statement_timeout",
            statement_timeout,
            &request.statement,
        )
        .await
    }

    async fn rename_indexes(
        &self,
        schema: &str,
        renames: &[(String, String)],
        lock_timeout: Duration,
    ) -> Result<(), BackendError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await?;
        tx.batch_execute(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            lock_timeout.as_millis()
        ))
        .await?;
        for (from, to) in renames {
            tx.batch_execute(&format!(
                "ALTER INDEX {}.{} RENAME TO {}",
                quote_ident(schema),
                quote_ident(from),
                quote_ident(to)
            ))
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reindex_concurrently(
        &self,
        id: &IndexId,
        statement_timeout: Duration,
    ) -> Result<(), BackendError> {
        let client = self.db.client();
        let client = client.lock().await;
        with_session_setting(
            &client,
            "statement_timeout",
            statement_timeout,
            &format!("REINDEX INDEX CONCURRENTLY {}", id.quoted()),
        )
        .await
    }

    async fn drop_index_if_exists(
        &self,
        id: &IndexId,
        lock_timeout: Duration,
    ) -> Result<(), BackendError> {
        let client = self.db.client();
        let client = client.lock().await;
        with_session_setting(
            &client,
            "lock_timeout",
            lock_timeout,
            &format!("DROP INDEX CONCURRENTLY IF EXISTS {}", id.quoted()),
        )
        .await
    }
}

// Concurrent DDL cannot run inside a transaction block, so the setting is applied to the
// session and reset afterwards whatever the statement returned.
async fn with_session_setting(
    client: &Client,
    setting: &str,
    value: Duration,
    statement: &str,
) -> Result<(), BackendError> {
    client
        .batch_execute(&format!("SET {setting} = '{}ms'", value.as_millis()))
        .await?;
    let outcome = client.batch_execute(statement).await;
    let reset = client.batch_execute(&format!("RESET {setting}")).await;
    if let Err(error) = &reset {
        tracing::warn!(setting, reason = %error, "failed to reset session setting");
    }
    outcome?;
    Ok(())
}

fn u64_from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
