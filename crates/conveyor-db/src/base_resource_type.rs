// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Central registry of base resource types.
//!
//! A base resource type is provided natively by one or more workers (e.g.
//! `git`, `s3`). Workers report theirs on registration; the rows here are
//! the cluster-wide identities that resource configs and import volumes
//! reference.

use sqlx::PgConnection;

use crate::error::{DbError, Result, safe_retry};

/// A base resource type as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseResourceType {
    /// Type name, unique across the cluster.
    pub name: String,
    /// Image the worker materializes the type from.
    pub image: String,
    /// Version of the type's implementation.
    pub version: String,
}

/// A base resource type with its registry row pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedBaseResourceType {
    /// Row id.
    pub id: i64,
    /// Type name.
    pub name: String,
}

impl BaseResourceType {
    /// Insert or refresh the registry row inside the caller's transaction,
    /// returning the pinned row.
    pub async fn find_or_create(&self, conn: &mut PgConnection) -> Result<UsedBaseResourceType> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO base_resource_types (name, image, version)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                image = EXCLUDED.image,
                version = EXCLUDED.version
            RETURNING id
            "#,
        )
        .bind(&self.name)
        .bind(&self.image)
        .bind(&self.version)
        .fetch_one(conn)
        .await
        .map_err(safe_retry)?;

        Ok(UsedBaseResourceType {
            id,
            name: self.name.clone(),
        })
    }
}

/// Look up a base resource type by name inside the caller's transaction.
pub async fn find(conn: &mut PgConnection, name: &str) -> Result<Option<UsedBaseResourceType>> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM base_resource_types WHERE name = $1")
        .bind(name)
        .fetch_optional(conn)
        .await?;

    Ok(id.map(|id| UsedBaseResourceType {
        id,
        name: name.to_string(),
    }))
}

/// Look up a base resource type by name, failing with
/// [`DbError::BaseResourceTypeNotFound`] when absent.
pub async fn find_required(conn: &mut PgConnection, name: &str) -> Result<UsedBaseResourceType> {
    find(conn, name)
        .await?
        .ok_or_else(|| DbError::BaseResourceTypeNotFound(name.to_string()))
}
