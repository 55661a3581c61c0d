// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canonical resource cache rows.
//!
//! A resource cache is the identity of a specific fetched artifact: one
//! version of a resource config. Cache identity is `(config, version)`;
//! the params hash is stored for auditing, because params only influence
//! the fetch side effects and sharing the artifact across builds with
//! different params is intended.

use serde_json::{Value, json};
use sqlx::{PgConnection, PgPool};

use crate::error::{DbError, Result, safe_retry};
use crate::hashing;
use crate::lock::LockFactory;
use crate::resource_config::{
    FIND_OR_CREATE_ATTEMPTS, PipelineResourceType, ResourceConfigDescriptor, ResourceUser,
    UsedResourceConfig,
};

/// Pure description of a resource cache: a config descriptor plus the
/// version to pin and the params the fetch will run with.
#[derive(Debug, Clone)]
pub struct ResourceCacheDescriptor {
    /// The config this cache belongs to.
    pub config: ResourceConfigDescriptor,
    /// Version of the resource, canonicalized for identity.
    pub version: Value,
    /// Fetch params; `None` is equivalent to an empty map.
    pub params: Option<Value>,
}

impl ResourceCacheDescriptor {
    fn version_text(&self) -> String {
        hashing::canonical_json(&self.version)
    }

    fn lock_spec(&self, config_id: i64) -> Value {
        json!({
            "resource_config_id": config_id,
            "version": self.version_text(),
            "params_hash": hashing::params_hash(self.params.as_ref()),
        })
    }

    /// Find or create the cache row and its use row inside the caller's
    /// transaction, creating the config row first. Racing-peer constraint
    /// violations surface as [`DbError::SafeRetryFindOrCreate`].
    pub(crate) async fn find_or_create(
        &self,
        conn: &mut PgConnection,
        lock_factory: &LockFactory,
        user: &ResourceUser,
    ) -> Result<UsedResourceCache> {
        let resource_config = Box::pin(self.config.find_or_create(conn, lock_factory, user)).await?;

        let lock_name = hashing::lock_name(&self.lock_spec(resource_config.id));
        let lock = loop {
            match lock_factory.try_acquire(&lock_name).await? {
                Some(lock) => break lock,
                None => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
            }
        };

        let version = self.version_text();

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM resource_caches WHERE resource_config_id = $1 AND version = $2",
        )
        .bind(resource_config.id)
        .bind(&version)
        .fetch_optional(&mut *conn)
        .await?;

        let id = match existing {
            Some(id) => id,
            None => {
                let inserted: Option<i64> = sqlx::query_scalar(
                    r#"
                    INSERT INTO resource_caches (resource_config_id, version, params_hash)
                    VALUES ($1, $2, $3)
                    ON CONFLICT DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(resource_config.id)
                .bind(&version)
                .bind(hashing::params_hash(self.params.as_ref()))
                .fetch_optional(&mut *conn)
                .await
                .map_err(safe_retry)?;

                match inserted {
                    Some(id) => id,
                    // A peer's insert committed between our find and insert.
                    None => sqlx::query_scalar(
                        "SELECT id FROM resource_caches \
                         WHERE resource_config_id = $1 AND version = $2",
                    )
                    .bind(resource_config.id)
                    .bind(&version)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or(DbError::SafeRetryFindOrCreate)?,
                }
            }
        };

        let use_insert = format!(
            "INSERT INTO resource_cache_uses (resource_cache_id, {}) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
            user.column()
        );
        sqlx::query(&use_insert)
            .bind(id)
            .bind(user.id())
            .execute(&mut *conn)
            .await
            .map_err(safe_retry)?;

        lock.release().await?;

        Ok(UsedResourceCache {
            id,
            resource_config,
            version: self.version.clone(),
        })
    }
}

/// A resource cache with its row pinned by at least one use row.
///
/// As long as a use row exists the cache cannot be destroyed; dropping
/// this handle does not unpin anything.
#[derive(Debug, Clone)]
pub struct UsedResourceCache {
    /// Row id.
    pub id: i64,
    /// The pinned config the cache belongs to.
    pub resource_config: UsedResourceConfig,
    /// Version of the cached artifact.
    pub version: Value,
}

/// Registry of canonical resource cache rows.
pub struct ResourceCacheRegistry {
    pool: PgPool,
    lock_factory: LockFactory,
}

impl ResourceCacheRegistry {
    /// Create a new registry.
    pub fn new(pool: PgPool, lock_factory: LockFactory) -> Self {
        Self { pool, lock_factory }
    }

    /// Find or create a cache pinned by a build.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_for_build(
        &self,
        build_id: i64,
        type_name: &str,
        version: Value,
        source: Value,
        params: Option<Value>,
        resource_types: &[PipelineResourceType],
    ) -> Result<UsedResourceCache> {
        self.find_or_create(
            ResourceUser::Build(build_id),
            type_name,
            version,
            source,
            params,
            resource_types,
        )
        .await
    }

    /// Find or create a cache pinned by a pipeline resource.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_for_resource(
        &self,
        resource_id: i64,
        type_name: &str,
        version: Value,
        source: Value,
        params: Option<Value>,
        resource_types: &[PipelineResourceType],
    ) -> Result<UsedResourceCache> {
        self.find_or_create(
            ResourceUser::Resource(resource_id),
            type_name,
            version,
            source,
            params,
            resource_types,
        )
        .await
    }

    /// Find or create a cache pinned by a pipeline resource type.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_for_resource_type(
        &self,
        resource_type_id: i64,
        type_name: &str,
        version: Value,
        source: Value,
        params: Option<Value>,
        resource_types: &[PipelineResourceType],
    ) -> Result<UsedResourceCache> {
        self.find_or_create(
            ResourceUser::ResourceType(resource_type_id),
            type_name,
            version,
            source,
            params,
            resource_types,
        )
        .await
    }

    /// Destroy a cache with no remaining uses. Fails with
    /// [`DbError::ResourceCacheDisappeared`] when the cache is still
    /// pinned or already gone.
    pub async fn destroy(&self, cache_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM resource_caches
            WHERE id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM resource_cache_uses WHERE resource_cache_id = $1
              )
            "#,
        )
        .bind(cache_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::ResourceCacheDisappeared);
        }

        tracing::debug!(cache_id, "Destroyed resource cache");

        Ok(())
    }

    async fn find_or_create(
        &self,
        user: ResourceUser,
        type_name: &str,
        version: Value,
        source: Value,
        params: Option<Value>,
        resource_types: &[PipelineResourceType],
    ) -> Result<UsedResourceCache> {
        let descriptor = ResourceCacheDescriptor {
            config: ResourceConfigDescriptor::build(type_name, source, resource_types)?,
            version,
            params,
        };

        for attempt in 1..=FIND_OR_CREATE_ATTEMPTS {
            let mut tx = self.pool.begin().await?;

            match descriptor
                .find_or_create(&mut tx, &self.lock_factory, &user)
                .await
            {
                Ok(used) => {
                    tx.commit().await?;
                    return Ok(used);
                }
                Err(DbError::SafeRetryFindOrCreate) => {
                    tx.rollback().await?;
                    tracing::debug!(attempt, type_name, "Lost find-or-create race, retrying");
                }
                Err(err) => {
                    tx.rollback().await?;
                    return Err(err);
                }
            }
        }

        Err(DbError::SafeRetryFindOrCreate)
    }
}
