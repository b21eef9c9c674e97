#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::{config::Config, db::ReindexDb, service::Reindexer};

pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod index;
pub mod lease;
pub mod ledger;
pub mod notifier;
pub mod selection;
pub mod service;

/// Connects to the configured database and wires a Postgres-backed [`Reindexer`].
pub async fn build_reindexer(config: &Config) -> Result<(Arc<ReindexDb>, Reindexer)> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("REINDEX_DATABASE_URL is not set"))?;
    let db = Arc::new(
        ReindexDb::connect(url)
            .await
            .context("connect reindexer database")?,
    );
    info!(
        schemas = ?config.schemas,
        default_strategy = %config.default_strategy,
        grafana = config.grafana.is_some(),
        "reindexer configured"
    );
    let reindexer = Reindexer::postgres(config, db.clone());
    Ok((db, reindexer))
}
