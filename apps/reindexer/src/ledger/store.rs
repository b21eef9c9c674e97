use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::ReindexDb;
use crate::ledger::types::{
    ActionState, CloseReindexAction, NewReindexAction, QueueState, QueuedActionRow,
    ReindexActionRow,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait ActionStore: Send + Sync {
    async fn insert_started(
        &self,
        action: NewReindexAction,
    ) -> Result<ReindexActionRow, LedgerStoreError>;

    /// Closes a `started` row. Returns the stored row and whether this call changed it;
    /// a row that is already closed is returned untouched.
    async fn close(
        &self,
        close: CloseReindexAction,
    ) -> Result<(ReindexActionRow, bool), LedgerStoreError>;

    async fn get(&self, id: i64) -> Result<Option<ReindexActionRow>, LedgerStoreError>;

    /// Which of `identifiers` have a `finished` row whose `action_end` is after `since`.
    async fn finished_since(
        &self,
        identifiers: &[String],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, LedgerStoreError>;

    /// Rows started after `since`, newest first.
    async fn started_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReindexActionRow>, LedgerStoreError>;

    /// Rows still in `started`, newest first.
    async fn open_actions(&self) -> Result<Vec<ReindexActionRow>, LedgerStoreError>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(
        &self,
        index_identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedActionRow, LedgerStoreError>;

    /// Oldest `queued` entries first.
    async fn queued(&self, limit: usize) -> Result<Vec<QueuedActionRow>, LedgerStoreError>;

    /// Moves a `queued` entry to `state`. Returns the stored row and whether it changed.
    async fn complete(
        &self,
        id: i64,
        state: QueueState,
        now: DateTime<Utc>,
    ) -> Result<(QueuedActionRow, bool), LedgerStoreError>;
}

pub fn memory() -> Arc<dyn ActionStore> {
    Arc::new(MemoryActionStore::default())
}

pub fn memory_queue() -> Arc<dyn QueueStore> {
    Arc::new(MemoryQueueStore::default())
}

pub fn postgres(db: Arc<ReindexDb>) -> Arc<dyn ActionStore> {
    Arc::new(PostgresActionStore { db })
}

pub fn postgres_queue(db: Arc<ReindexDb>) -> Arc<dyn QueueStore> {
    Arc::new(PostgresQueueStore { db })
}

#[derive(Default)]
struct MemoryActionStore {
    inner: Mutex<MemoryActionInner>,
}

#[derive(Default)]
struct MemoryActionInner {
    next_id: i64,
    actions: BTreeMap<i64, ReindexActionRow>,
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn insert_started(
        &self,
        action: NewReindexAction,
    ) -> Result<ReindexActionRow, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let row = ReindexActionRow {
            id: inner.next_id,
            index_identifier: action.index_identifier,
            state: ActionState::Started,
            action_start: action.action_start,
            action_end: None,
            ondisk_size_bytes_start: action.ondisk_size_bytes_start,
            ondisk_size_bytes_end: None,
            bloat_estimate_bytes_start: action.bloat_estimate_bytes_start,
            error_code: None,
            error_message: None,
        };
        inner.actions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn close(
        &self,
        close: CloseReindexAction,
    ) -> Result<(ReindexActionRow, bool), LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.actions.get_mut(&close.id) else {
            return Err(LedgerStoreError::NotFound(format!("reindex action {}", close.id)));
        };
        if !row.state.can_transition_to(close.state) {
            return Ok((row.clone(), false));
        }
        row.state = close.state;
        row.action_end = Some(close.action_end);
        row.ondisk_size_bytes_end = close.ondisk_size_bytes_end;
        row.error_code = close.error_code;
        row.error_message = close.error_message;
        Ok((row.clone(), true))
    }

    async fn get(&self, id: i64) -> Result<Option<ReindexActionRow>, LedgerStoreError> {
        Ok(self.inner.lock().await.actions.get(&id).cloned())
    }

    async fn finished_since(
        &self,
        identifiers: &[String],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .actions
            .values()
            .filter(|row| {
                row.state == ActionState::Finished
                    && row.action_end.is_some_and(|end| end > since)
                    && identifiers.contains(&row.index_identifier)
            })
            .map(|row| row.index_identifier.clone())
            .collect())
    }

    async fn started_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReindexActionRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .actions
            .values()
            .filter(|row| row.action_start > since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.action_start.cmp(&a.action_start).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn open_actions(&self) -> Result<Vec<ReindexActionRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .actions
            .values()
            .filter(|row| row.state == ActionState::Started)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.action_start.cmp(&a.action_start).then(b.id.cmp(&a.id)));
        Ok(rows)
    }
}

#[derive(Default)]
struct MemoryQueueStore {
    inner: Mutex<MemoryQueueInner>,
}

#[derive(Default)]
struct MemoryQueueInner {
    next_id: i64,
    entries: BTreeMap<i64, QueuedActionRow>,
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(
        &self,
        index_identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedActionRow, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let row = QueuedActionRow {
            id: inner.next_id,
            index_identifier: index_identifier.to_string(),
            state: QueueState::Queued,
            created_at: now,
            updated_at: now,
        };
        inner.entries.insert(row.id, row.clone());
        Ok(row)
    }

    async fn queued(&self, limit: usize) -> Result<Vec<QueuedActionRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .entries
            .values()
            .filter(|row| row.state == QueueState::Queued)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn complete(
        &self,
        id: i64,
        state: QueueState,
        now: DateTime<Utc>,
    ) -> Result<(QueuedActionRow, bool), LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.entries.get_mut(&id) else {
            return Err(LedgerStoreError::NotFound(format!("queued action {id}")));
        };
        if row.state != QueueState::Queued {
            return Ok((row.clone(), false));
        }
        row.state = state;
        row.updated_at = now;
        Ok((row.clone(), true))
    }
}

struct PostgresActionStore {
    db: Arc<ReindexDb>,
}

const ACTION_COLUMNS: &str = r#"
    id,
    index_identifier,
    state,
    action_start,
    action_end,
    ondisk_size_bytes_start,
    ondisk_size_bytes_end,
    bloat_estimate_bytes_start,
    error_code,
    error_message
"#;

#[async_trait]
impl ActionStore for PostgresActionStore {
    async fn insert_started(
        &self,
        action: NewReindexAction,
    ) -> Result<ReindexActionRow, LedgerStoreError> {
        let client = self.db.client();
        let row = client
            .lock()
            .await
            .query_one(
                &format!(
                    r#"
                    INSERT INTO reindexer.reindex_actions (
                      index_identifier,
                      state,
                      action_start,
                      ondisk_size_bytes_start,
                      bloat_estimate_bytes_start
                    )
                    VALUES ($1, 'started', $2, $3, $4)
                    RETURNING {ACTION_COLUMNS}
                    "#
                ),
                &[
                    &action.index_identifier,
                    &action.action_start,
                    &i64_from_u64(action.ondisk_size_bytes_start),
                    &i64_from_u64(action.bloat_estimate_bytes_start),
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        map_action_row(&row).map_err(LedgerStoreError::Db)
    }

    async fn close(
        &self,
        close: CloseReindexAction,
    ) -> Result<(ReindexActionRow, bool), LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        // The state guard in the WHERE clause keeps a closed row from being rewritten.
        let updated = client
            .query_opt(
                &format!(
                    r#"
                    UPDATE reindexer.reindex_actions
                       SET state = $2,
                           action_end = $3,
                           ondisk_size_bytes_end = $4,
                           error_code = $5,
                           error_message = $6
                     WHERE id = $1
                       AND state = 'started'
                    RETURNING {ACTION_COLUMNS}
                    "#
                ),
                &[
                    &close.id,
                    &close.state.as_str(),
                    &close.action_end,
                    &close.ondisk_size_bytes_end.map(i64_from_u64),
                    &close.error_code,
                    &close.error_message,
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        if let Some(row) = updated {
            return Ok((map_action_row(&row).map_err(LedgerStoreError::Db)?, true));
        }

        let existing = client
            .query_opt(
                &format!("SELECT {ACTION_COLUMNS} FROM reindexer.reindex_actions WHERE id = $1"),
                &[&close.id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("reindex action {}", close.id)))?;
        Ok((map_action_row(&existing).map_err(LedgerStoreError::Db)?, false))
    }

    async fn get(&self, id: i64) -> Result<Option<ReindexActionRow>, LedgerStoreError> {
        let client = self.db.client();
        let row = client
            .lock()
            .await
            .query_opt(
                &format!("SELECT {ACTION_COLUMNS} FROM reindexer.reindex_actions WHERE id = $1"),
                &[&id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_action_row(&row).map_err(LedgerStoreError::Db)?))
    }

    async fn finished_since(
        &self,
        identifiers: &[String],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, LedgerStoreError> {
        if identifiers.is_empty() {
            return Ok(HashSet::new());
        }
        let client = self.db.client();
        let rows = client
            .lock()
            .await
            .query(
                r#"
                SELECT DISTINCT index_identifier
                  FROM reindexer.reindex_actions
                 WHERE state = 'finished'
                   AND action_end > $1
                   AND index_identifier = ANY($2)
                "#,
                &[&since, &identifiers],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| row.get::<_, String>("index_identifier"))
            .collect())
    }

    async fn started_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReindexActionRow>, LedgerStoreError> {
        let client = self.db.client();
        let rows = client
            .lock()
            .await
            .query(
                &format!(
                    r#"
                    SELECT {ACTION_COLUMNS}
                      FROM reindexer.reindex_actions
                     WHERE action_start > $1
                     ORDER BY action_start DESC, id DESC
                    "#
                ),
                &[&since],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_action_row(row).map_err(LedgerStoreError::Db))
            .collect()
    }

    async fn open_actions(&self) -> Result<Vec<ReindexActionRow>, LedgerStoreError> {
        let client = self.db.client();
        let rows = client
            .lock()
            .await
            .query(
                &format!(
                    r#"
                    SELECT {ACTION_COLUMNS}
                      FROM reindexer.reindex_actions
                     WHERE state = 'started'
                     ORDER BY action_start DESC, id DESC
                    "#
                ),
                &[],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_action_row(row).map_err(LedgerStoreError::Db))
            .collect()
    }
}

struct PostgresQueueStore {
    db: Arc<ReindexDb>,
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn enqueue(
        &self,
        index_identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedActionRow, LedgerStoreError> {
        let client = self.db.client();
        let row = client
            .lock()
            .await
            .query_one(
                r#"
                INSERT INTO reindexer.queued_actions (index_identifier, state, created_at, updated_at)
                VALUES ($1, 'queued', $2, $2)
                RETURNING id, index_identifier, state, created_at, updated_at
                "#,
                &[&index_identifier, &now],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        map_queue_row(&row).map_err(LedgerStoreError::Db)
    }

    async fn queued(&self, limit: usize) -> Result<Vec<QueuedActionRow>, LedgerStoreError> {
        let client = self.db.client();
        let rows = client
            .lock()
            .await
            .query(
                r#"
                SELECT id, index_identifier, state, created_at, updated_at
                  FROM reindexer.queued_actions
                 WHERE state = 'queued'
                 ORDER BY created_at ASC, id ASC
                 LIMIT $1
                "#,
                &[&i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_queue_row(row).map_err(LedgerStoreError::Db))
            .collect()
    }

    async fn complete(
        &self,
        id: i64,
        state: QueueState,
        now: DateTime<Utc>,
    ) -> Result<(QueuedActionRow, bool), LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .query_opt(
                r#"
                UPDATE reindexer.queued_actions
                   SET state = $2,
                       updated_at = $3
                 WHERE id = $1
                   AND state = 'queued'
                RETURNING id, index_identifier, state, created_at, updated_at
                "#,
                &[&id, &state.as_str(), &now],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        if let Some(row) = updated {
            return Ok((map_queue_row(&row).map_err(LedgerStoreError::Db)?, true));
        }
        let existing = client
            .query_opt(
                r#"
                SELECT id, index_identifier, state, created_at, updated_at
                  FROM reindexer.queued_actions
                 WHERE id = $1
                "#,
                &[&id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("queued action {id}")))?;
        Ok((map_queue_row(&existing).map_err(LedgerStoreError::Db)?, false))
    }
}

fn map_action_row(row: &tokio_postgres::Row) -> Result<ReindexActionRow, String> {
    let state: String = row.get("state");
    Ok(ReindexActionRow {
        id: row.get("id"),
        index_identifier: row.get("index_identifier"),
        state: ActionState::parse(&state).ok_or_else(|| format!("unknown action state {state}"))?,
        action_start: row.get("action_start"),
        action_end: row.get("action_end"),
        ondisk_size_bytes_start: u64_from_i64(row.get("ondisk_size_bytes_start"))?,
        ondisk_size_bytes_end: row
            .try_get::<_, Option<i64>>("ondisk_size_bytes_end")
            .map_err(|error| error.to_string())?
            .map(u64_from_i64)
            .transpose()?,
        bloat_estimate_bytes_start: u64_from_i64(row.get("bloat_estimate_bytes_start"))?,
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
    })
}

fn map_queue_row(row: &tokio_postgres::Row) -> Result<QueuedActionRow, String> {
    let state: String = row.get("state");
    Ok(QueuedActionRow {
        id: row.get("id"),
        index_identifier: row.get("index_identifier"),
        state: QueueState::parse(&state).ok_or_else(|| format!("unknown queue state {state}"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn u64_from_i64(value: i64) -> Result<u64, String> {
    u64::try_from(value).map_err(|_| format!("negative bigint value {value}"))
}

fn i64_from_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
