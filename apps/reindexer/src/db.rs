use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const SCHEMA_SQL: &str = include_str!("../migrations/0001_reindexer.sql");

#[derive(Clone)]
pub struct ReindexDb {
    client: Arc<Mutex<Client>>,
}

impl ReindexDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "reindexer postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    /// Creates the bookkeeping tables if they are missing. Safe to run repeatedly.
    pub async fn apply_schema(&self) -> Result<()> {
        self.client
            .lock()
            .await
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply reindexer schema")?;
        Ok(())
    }
}
