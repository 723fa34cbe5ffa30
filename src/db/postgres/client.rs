use std::time::Duration;

use anyhow::Context;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use log::{info, warn};
use tokio_postgres::NoTls;

use crate::config::PostgresSettings;

const CONNECT_ATTEMPTS: u32 = 3;

const SCHEMA: &str = include_str!("../../../schema/postgres.sql");

/// Split a migration script into statements, keeping `$$ ... $$` bodies whole.
fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_dollar_quote = false;
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'$') {
            in_dollar_quote = !in_dollar_quote;
            i += 2;
            continue;
        }
        if bytes[i] == b';' && !in_dollar_quote {
            let stmt = sql[start..i].trim();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            start = i + 1;
        }
        i += 1;
    }

    let tail = sql[start..].trim();
    if !tail.is_empty() {
        statements.push(tail);
    }

    statements
}

/// Pooled PostgreSQL connection backing the `postgres` watermark store.
#[derive(Clone)]
pub struct PostgresClient {
    pub pool: Pool,
}

impl PostgresClient {
    pub async fn new(settings: PostgresSettings) -> anyhow::Result<Self> {
        info!("[STORE] Connecting to PostgreSQL at {}:{}", settings.host, settings.port);

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .password(&settings.password)
            .dbname(&settings.database);

        let mgr = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(mgr)
            .max_size(settings.pool_size)
            .build()
            .context("Failed to create PostgreSQL connection pool")?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match pool.get().await {
                Ok(_conn) => {
                    info!("[STORE] Connected to PostgreSQL");
                    return Ok(Self { pool });
                },
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    let delay = Duration::from_millis(100 * 2_u64.pow(attempt));
                    warn!(
                        "[STORE] Failed to connect to PostgreSQL (attempt {}/{}): {}, retrying in {:?}",
                        attempt, CONNECT_ATTEMPTS, e, delay
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to connect to PostgreSQL after {} attempts: {}",
                        CONNECT_ATTEMPTS,
                        e
                    ));
                },
            }
        }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        info!("[STORE] Running PostgreSQL migrations");
        let client = self.pool.get().await?;

        for stmt in split_sql_statements(SCHEMA) {
            client
                .execute(stmt, &[])
                .await
                .with_context(|| format!("Failed to execute migration statement: {}", stmt))?;
        }

        info!("[STORE] PostgreSQL schema applied");
        Ok(())
    }
}
