// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canonical, de-duplicated resource config rows.
//!
//! A resource config is the identity of a configured resource: what you
//! would check against upstream, independent of any fetched version. Its
//! parent is either a base resource type provided by workers, or the
//! resource cache that materializes a custom type's implementation. Parent
//! caches form a DAG; cycles in custom type definitions are rejected at
//! descriptor construction.
//!
//! Rows are pinned by "use" rows tying them to a build, a resource, or a
//! resource type. A config with zero uses is a garbage-collection
//! candidate.

use serde_json::{Value, json};
use sqlx::{PgConnection, PgPool};

use crate::base_resource_type::{self, UsedBaseResourceType};
use crate::error::{DbError, Result, safe_retry};
use crate::hashing;
use crate::lock::LockFactory;
use crate::resource_cache::{ResourceCacheDescriptor, UsedResourceCache};

/// How long to sleep between attempts on a contended creation lock.
const LOCK_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// How many times a find-or-create transaction is restarted after losing a
/// race before the safe-retry sentinel is surfaced to the caller.
pub(crate) const FIND_OR_CREATE_ATTEMPTS: u32 = 5;

/// The owner a config or cache use row is tied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUser {
    /// Pinned by a build.
    Build(i64),
    /// Pinned by a pipeline resource.
    Resource(i64),
    /// Pinned by a pipeline resource type.
    ResourceType(i64),
}

impl ResourceUser {
    /// Column the owner id is stored in.
    pub(crate) fn column(&self) -> &'static str {
        match self {
            ResourceUser::Build(_) => "build_id",
            ResourceUser::Resource(_) => "resource_id",
            ResourceUser::ResourceType(_) => "resource_type_id",
        }
    }

    /// Owner id.
    pub(crate) fn id(&self) -> i64 {
        match self {
            ResourceUser::Build(id) | ResourceUser::Resource(id) | ResourceUser::ResourceType(id) => {
                *id
            }
        }
    }
}

/// A custom resource type defined by a pipeline: its implementation is
/// itself a resource fetched via the parent type.
#[derive(Debug, Clone)]
pub struct PipelineResourceType {
    /// Name the pipeline refers to the type by.
    pub name: String,
    /// The type implementing it (base or another custom type).
    pub type_name: String,
    /// Source config of the implementation resource.
    pub source: Value,
    /// Resolved version of the implementation resource.
    pub version: Value,
}

/// Pure description of a resource config, resolved from a type name and
/// the pipeline's custom types before anything touches the database.
#[derive(Debug, Clone)]
pub struct ResourceConfigDescriptor {
    /// Source config; hashed canonically for identity.
    pub source: Value,
    /// Parentage of the config.
    pub parent: ConfigParentDescriptor,
}

/// Descriptor-level parentage.
#[derive(Debug, Clone)]
pub enum ConfigParentDescriptor {
    /// A base resource type, resolved against the central registry when
    /// the config row is created.
    Base(String),
    /// The cache of a custom type's implementation.
    Cache(Box<ResourceCacheDescriptor>),
}

impl ResourceConfigDescriptor {
    /// Resolve a type name against the pipeline's custom types.
    ///
    /// Custom types recurse into their own implementation config; a name
    /// appearing twice on one parent chain fails with
    /// [`DbError::CyclicResourceType`]. A name with no custom definition is
    /// taken to be a base type.
    pub fn build(
        type_name: &str,
        source: Value,
        resource_types: &[PipelineResourceType],
    ) -> Result<Self> {
        let mut chain = Vec::new();
        Self::build_on_chain(type_name, source, resource_types, &mut chain)
    }

    fn build_on_chain(
        type_name: &str,
        source: Value,
        resource_types: &[PipelineResourceType],
        chain: &mut Vec<String>,
    ) -> Result<Self> {
        let Some(custom) = resource_types.iter().find(|t| t.name == type_name) else {
            return Ok(Self {
                source,
                parent: ConfigParentDescriptor::Base(type_name.to_string()),
            });
        };

        if chain.iter().any(|seen| seen == type_name) {
            return Err(DbError::CyclicResourceType(type_name.to_string()));
        }

        chain.push(type_name.to_string());
        let parent_config = Self::build_on_chain(
            &custom.type_name,
            custom.source.clone(),
            resource_types,
            chain,
        )?;
        chain.pop();

        Ok(Self {
            source,
            parent: ConfigParentDescriptor::Cache(Box::new(ResourceCacheDescriptor {
                config: parent_config,
                version: custom.version.clone(),
                params: None,
            })),
        })
    }

    /// Identity spec used for the creation lock name.
    fn lock_spec(&self, parent_column: &str, parent_id: i64) -> Value {
        json!({
            "source_hash": hashing::source_hash(&self.source),
            "parent_column": parent_column,
            "parent_id": parent_id,
        })
    }

    /// Find or create the config row and its use row inside the caller's
    /// transaction. Constraint violations from racing peers surface as
    /// [`DbError::SafeRetryFindOrCreate`]; the caller must abandon the
    /// transaction and restart from the top.
    pub(crate) async fn find_or_create(
        &self,
        conn: &mut PgConnection,
        lock_factory: &LockFactory,
        user: &ResourceUser,
    ) -> Result<UsedResourceConfig> {
        let parent = match &self.parent {
            ConfigParentDescriptor::Base(name) => {
                ConfigParent::Base(base_resource_type::find_required(conn, name).await?)
            }
            ConfigParentDescriptor::Cache(descriptor) => {
                let cache =
                    Box::pin(descriptor.find_or_create(conn, lock_factory, user)).await?;
                ConfigParent::Cache(Box::new(cache))
            }
        };

        let (parent_column, parent_id) = match &parent {
            ConfigParent::Base(base) => ("base_resource_type_id", base.id),
            ConfigParent::Cache(cache) => ("resource_cache_id", cache.id),
        };

        let lock_name = hashing::lock_name(&self.lock_spec(parent_column, parent_id));
        let lock = loop {
            match lock_factory.try_acquire(&lock_name).await? {
                Some(lock) => break lock,
                None => tokio::time::sleep(LOCK_RETRY_DELAY).await,
            }
        };

        let source_hash = hashing::source_hash(&self.source);

        let find = format!(
            "SELECT id FROM resource_configs WHERE source_hash = $1 AND {parent_column} = $2"
        );
        let existing: Option<i64> = sqlx::query_scalar(&find)
            .bind(&source_hash)
            .bind(parent_id)
            .fetch_optional(&mut *conn)
            .await?;

        let id = match existing {
            Some(id) => id,
            None => {
                let insert = format!(
                    "INSERT INTO resource_configs (source_hash, {parent_column}) \
                     VALUES ($1, $2) ON CONFLICT DO NOTHING RETURNING id"
                );
                let inserted: Option<i64> = sqlx::query_scalar(&insert)
                    .bind(&source_hash)
                    .bind(parent_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(safe_retry)?;

                match inserted {
                    Some(id) => id,
                    // A peer's insert committed between our find and insert.
                    None => sqlx::query_scalar(&find)
                        .bind(&source_hash)
                        .bind(parent_id)
                        .fetch_optional(&mut *conn)
                        .await?
                        .ok_or(DbError::SafeRetryFindOrCreate)?,
                }
            }
        };

        let use_insert = format!(
            "INSERT INTO resource_config_uses (resource_config_id, {}) \
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

        Ok(UsedResourceConfig { id, parent })
    }
}

/// A resource config with its row pinned by at least one use row.
///
/// The handle itself does not unpin anything on drop; the use row must be
/// released explicitly or swept once its owner finishes.
#[derive(Debug, Clone)]
pub struct UsedResourceConfig {
    /// Row id.
    pub id: i64,
    /// Resolved parentage.
    pub parent: ConfigParent,
}

/// Resolved parentage of a config row.
#[derive(Debug, Clone)]
pub enum ConfigParent {
    /// Provided natively by workers.
    Base(UsedBaseResourceType),
    /// Materialized by a custom type's cache.
    Cache(Box<UsedResourceCache>),
}

impl UsedResourceConfig {
    /// The base resource type at the root of this config's parent chain.
    pub fn root_base_type(&self) -> &UsedBaseResourceType {
        match &self.parent {
            ConfigParent::Base(base) => base,
            ConfigParent::Cache(cache) => cache.resource_config.root_base_type(),
        }
    }
}

/// Registry of canonical resource config rows.
pub struct ResourceConfigRegistry {
    pool: PgPool,
    lock_factory: LockFactory,
}

impl ResourceConfigRegistry {
    /// Create a new registry.
    pub fn new(pool: PgPool, lock_factory: LockFactory) -> Self {
        Self { pool, lock_factory }
    }

    /// Find or create a config pinned by a build.
    pub async fn find_or_create_for_build(
        &self,
        build_id: i64,
        type_name: &str,
        source: Value,
        resource_types: &[PipelineResourceType],
    ) -> Result<UsedResourceConfig> {
        self.find_or_create(ResourceUser::Build(build_id), type_name, source, resource_types)
            .await
    }

    /// Find or create a config pinned by a pipeline resource.
    pub async fn find_or_create_for_resource(
        &self,
        resource_id: i64,
        type_name: &str,
        source: Value,
        resource_types: &[PipelineResourceType],
    ) -> Result<UsedResourceConfig> {
        self.find_or_create(
            ResourceUser::Resource(resource_id),
            type_name,
            source,
            resource_types,
        )
        .await
    }

    /// Find or create a config pinned by a pipeline resource type.
    pub async fn find_or_create_for_resource_type(
        &self,
        resource_type_id: i64,
        type_name: &str,
        source: Value,
        resource_types: &[PipelineResourceType],
    ) -> Result<UsedResourceConfig> {
        self.find_or_create(
            ResourceUser::ResourceType(resource_type_id),
            type_name,
            source,
            resource_types,
        )
        .await
    }

    async fn find_or_create(
        &self,
        user: ResourceUser,
        type_name: &str,
        source: Value,
        resource_types: &[PipelineResourceType],
    ) -> Result<UsedResourceConfig> {
        let descriptor = ResourceConfigDescriptor::build(type_name, source, resource_types)?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn custom(name: &str, type_name: &str) -> PipelineResourceType {
        PipelineResourceType {
            name: name.to_string(),
            type_name: type_name.to_string(),
            source: json!({"repo": name}),
            version: json!({"digest": format!("sha256:{name}")}),
        }
    }

    #[test]
    fn test_unknown_type_resolves_to_base() {
        let descriptor = ResourceConfigDescriptor::build("git", json!({"uri": "x"}), &[]).unwrap();
        assert!(matches!(
            descriptor.parent,
            ConfigParentDescriptor::Base(ref name) if name == "git"
        ));
    }

    #[test]
    fn test_custom_type_chain_resolves_to_nested_cache() {
        let types = vec![custom("helm", "docker-image"), custom("docker-image", "registry")];
        let descriptor =
            ResourceConfigDescriptor::build("helm", json!({"chart": "c"}), &types).unwrap();

        let ConfigParentDescriptor::Cache(helm_impl) = descriptor.parent else {
            panic!("expected cache parent");
        };
        let ConfigParentDescriptor::Cache(docker_impl) = helm_impl.config.parent else {
            panic!("expected nested cache parent");
        };
        assert!(matches!(
            docker_impl.config.parent,
            ConfigParentDescriptor::Base(ref name) if name == "registry"
        ));
    }

    #[test]
    fn test_cyclic_custom_types_are_rejected() {
        let types = vec![custom("a", "b"), custom("b", "a")];
        let err = ResourceConfigDescriptor::build("a", json!({}), &types).unwrap_err();
        assert!(matches!(err, DbError::CyclicResourceType(_)));
    }

    #[test]
    fn test_self_referential_type_is_rejected() {
        let types = vec![custom("a", "a")];
        let err = ResourceConfigDescriptor::build("a", json!({}), &types).unwrap_err();
        assert!(matches!(err, DbError::CyclicResourceType(_)));
    }

    #[test]
    fn test_deep_chain_is_accepted() {
        let types = vec![custom("a", "b"), custom("b", "c"), custom("c", "base")];
        let descriptor = ResourceConfigDescriptor::build("a", json!({}), &types);
        assert!(descriptor.is_ok());
    }
}
