//! Distributed restart lock keyed by execution id.
//!
//! The lock lives in the shared database so that every controller instance
//! sees the same holder. A holder that crashes is evicted by the TTL; an
//! expired entry is treated as absent by every operation.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::storage::{self, Pool};

/// Lock key guarding the start dispatch of one execution.
pub fn restart_key(execution_id: i64) -> String {
    format!("exec:restart:{}", execution_id)
}

/// Mutual exclusion across controller instances.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Acquire `key` for `token` unless someone else holds it.
    /// Returns `true` iff the caller holds the lock afterwards.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Current holder's token, if the lock is held.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Release `key` if (and only if) it is held by `token`.
    async fn release(&self, key: &str, token: &str) -> Result<()>;
}

/// [`LockCoordinator`] backed by the `locks` table.
#[derive(Clone)]
pub struct SqliteLockCoordinator {
    pool: Pool,
}

impl SqliteLockCoordinator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockCoordinator for SqliteLockCoordinator {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let key = key.to_string();
        let token = token.to_string();
        let now = storage::epoch_ms(Utc::now());
        let expires = now + ttl.as_millis() as i64;

        let acquired = storage::with_conn(&self.pool, move |conn| {
            // Upsert only takes over rows whose TTL has run out.
            let changed = conn.execute(
                "INSERT INTO locks (key, token, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE
                    SET token = excluded.token, expires_at_ms = excluded.expires_at_ms
                    WHERE locks.expires_at_ms <= ?4",
                params![key, token, expires, now],
            )?;
            Ok(changed == 1)
        })
        .await?;

        debug!(acquired, "restart lock acquire attempt");
        Ok(acquired)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        let now = storage::epoch_ms(Utc::now());
        storage::with_conn(&self.pool, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT token FROM locks WHERE key = ?1 AND expires_at_ms > ?2",
                    params![key, now],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let key = key.to_string();
        let token = token.to_string();
        storage::with_conn(&self.pool, move |conn| {
            conn.execute(
                "DELETE FROM locks WHERE key = ?1 AND token = ?2",
                params![key, token],
            )?;
            Ok(())
        })
        .await
    }
}
