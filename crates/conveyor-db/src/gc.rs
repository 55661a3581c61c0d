// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Garbage collection passes.
//!
//! Caches reference configs and configs can reference caches (custom type
//! parents), so the sweep is topological: delete unreferenced caches
//! first, then configs with no uses and no reverse parent pointers, and
//! repeat until a pass deletes nothing. Every pass is idempotent and safe
//! to interleave with the other background loops.

use sqlx::PgPool;

use crate::error::Result;

/// Drop use rows whose owning build has reached a terminal status. Caches
/// and configs unpinned here become candidates for the next sweep.
pub async fn release_uses_for_finished_builds(pool: &PgPool) -> Result<u64> {
    let cache_uses = sqlx::query(
        r#"
        DELETE FROM resource_cache_uses u
        USING builds b
        WHERE u.build_id = b.id
          AND b.status IN ('aborted', 'succeeded', 'failed', 'errored')
        "#,
    )
    .execute(pool)
    .await?;

    let config_uses = sqlx::query(
        r#"
        DELETE FROM resource_config_uses u
        USING builds b
        WHERE u.build_id = b.id
          AND b.status IN ('aborted', 'succeeded', 'failed', 'errored')
        "#,
    )
    .execute(pool)
    .await?;

    let released = cache_uses.rows_affected() + config_uses.rows_affected();
    if released > 0 {
        tracing::debug!(count = released, "Released uses of finished builds");
    }

    Ok(released)
}

/// Sweep unreferenced caches and configs to a fixed point. Returns the
/// total number of rows deleted.
pub async fn collect_caches_and_configs(pool: &PgPool) -> Result<u64> {
    let mut total = 0;

    loop {
        let caches = sqlx::query(
            r#"
            DELETE FROM resource_caches rc
            WHERE NOT EXISTS (
                SELECT 1 FROM resource_cache_uses u WHERE u.resource_cache_id = rc.id
            )
            AND NOT EXISTS (
                SELECT 1 FROM resource_configs c WHERE c.resource_cache_id = rc.id
            )
            AND NOT EXISTS (
                SELECT 1 FROM containers ct
                WHERE ct.resource_cache_id = rc.id
                  AND ct.state IN ('creating', 'created')
            )
            "#,
        )
        .execute(pool)
        .await?;

        let configs = sqlx::query(
            r#"
            DELETE FROM resource_configs c
            WHERE NOT EXISTS (
                SELECT 1 FROM resource_config_uses u WHERE u.resource_config_id = c.id
            )
            AND NOT EXISTS (
                SELECT 1 FROM resource_caches rc WHERE rc.resource_config_id = c.id
            )
            AND NOT EXISTS (
                SELECT 1 FROM containers ct
                WHERE ct.resource_config_id = c.id
                  AND ct.state IN ('creating', 'created')
            )
            "#,
        )
        .execute(pool)
        .await?;

        let deleted = caches.rows_affected() + configs.rows_affected();
        total += deleted;

        if deleted == 0 {
            break;
        }
    }

    if total > 0 {
        tracing::info!(count = total, "Collected unreferenced caches and configs");
    }

    Ok(total)
}

/// Mark expired created containers as destroying. Returns their handles so
/// the caller can destroy the runtime objects and then remove the rows.
pub async fn mark_expired_containers(pool: &PgPool) -> Result<Vec<String>> {
    let handles: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE containers SET state = 'destroying'
        WHERE state = 'created'
          AND expires_at IS NOT NULL
          AND expires_at < NOW()
        RETURNING handle
        "#,
    )
    .fetch_all(pool)
    .await?;

    if !handles.is_empty() {
        tracing::info!(count = handles.len(), "Marked expired containers for removal");
    }

    Ok(handles)
}

/// Mark volumes whose owner is gone as destroying. Returns their handles.
pub async fn mark_orphaned_volumes(pool: &PgPool) -> Result<Vec<String>> {
    let handles: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE volumes SET state = 'destroying'
        WHERE state IN ('creating', 'created')
          AND container_id IS NULL
          AND resource_cache_id IS NULL
          AND base_resource_type_id IS NULL
        RETURNING handle
        "#,
    )
    .fetch_all(pool)
    .await?;

    if !handles.is_empty() {
        tracing::info!(count = handles.len(), "Marked orphaned volumes for removal");
    }

    Ok(handles)
}

/// Handles of destroying containers per worker, awaiting runtime
/// destruction and row removal.
pub async fn destroying_containers(pool: &PgPool, worker_name: &str) -> Result<Vec<String>> {
    let handles: Vec<String> = sqlx::query_scalar(
        "SELECT handle FROM containers WHERE worker_name = $1 AND state = 'destroying'",
    )
    .bind(worker_name)
    .fetch_all(pool)
    .await?;

    Ok(handles)
}

/// Handles of destroying volumes per worker, awaiting remote destruction
/// and row removal.
pub async fn destroying_volumes(pool: &PgPool, worker_name: &str) -> Result<Vec<String>> {
    let handles: Vec<String> = sqlx::query_scalar(
        "SELECT handle FROM volumes WHERE worker_name = $1 AND state = 'destroying'",
    )
    .bind(worker_name)
    .fetch_all(pool)
    .await?;

    Ok(handles)
}
