// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide named advisory locks.
//!
//! Locks are backed by the database's session-scoped advisory locks, so a
//! holder that crashes releases its locks when the backend tears the
//! session down. Each acquisition uses its own pooled connection: a second
//! `try_acquire` of the same name from the same process contends like any
//! other session, so the lock is not re-entrant.

use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres};

use crate::error::Result;
use crate::hashing::advisory_key;

/// Factory for named advisory locks over a connection pool.
#[derive(Clone)]
pub struct LockFactory {
    pool: PgPool,
}

impl LockFactory {
    /// Create a new lock factory.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attempt to acquire the named lock without blocking.
    ///
    /// Returns `None` immediately when another holder has the lock; the
    /// caller decides whether to sleep and retry.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<Lock>> {
        let key = advisory_key(name);
        let mut conn = self.pool.acquire().await?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            tracing::debug!(lock = %name, "Lock held elsewhere");
            return Ok(None);
        }

        tracing::debug!(lock = %name, "Acquired lock");
        Ok(Some(Lock {
            conn: Some(conn),
            key,
            name: name.to_string(),
        }))
    }
}

/// A held advisory lock. Release explicitly with [`Lock::release`];
/// dropping a held lock closes its session, which also frees the lock.
pub struct Lock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
    name: String,
}

impl Lock {
    /// The name this lock was acquired under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock and return its connection to the pool.
    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .fetch_one(&mut *conn)
                .await?;
            tracing::debug!(lock = %self.name, "Released lock");
        }
        Ok(())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        // Not released explicitly: close the session instead of returning
        // the connection to the pool, since a pooled connection would keep
        // holding the session-scoped lock.
        if let Some(conn) = self.conn.take() {
            let name = self.name.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = conn.detach().close().await;
                    tracing::debug!(lock = %name, "Dropped lock session");
                });
            }
        }
    }
}
