// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for resource config and cache de-duplication, pinning, and
//! garbage collection.

mod common;

use common::{TEST_TTL, create_build, create_team, get_test_pool, test_worker_spec, unique};
use conveyor_db::build::{BuildRegistry, BuildStatus};
use conveyor_db::error::DbError;
use conveyor_db::gc;
use conveyor_db::lock::LockFactory;
use conveyor_db::resource_cache::ResourceCacheRegistry;
use conveyor_db::resource_config::{PipelineResourceType, ResourceConfigRegistry};
use conveyor_db::worker::{WorkerRegistry, WorkerResourceType, WorkerSpec};
use serde_json::json;
use sqlx::PgPool;

/// Register a worker providing one base resource type, returning the type
/// name.
async fn register_base_type(pool: &PgPool) -> String {
    let type_name = unique("base-type");
    let mut spec: WorkerSpec = test_worker_spec(&unique("worker"));
    spec.resource_types = vec![WorkerResourceType {
        name: type_name.clone(),
        image: "/images/base".to_string(),
        version: "1.0".to_string(),
    }];

    WorkerRegistry::new(pool.clone())
        .save_worker(&spec, TEST_TTL)
        .await
        .expect("Failed to register worker");

    type_name
}

fn cache_registry(pool: &PgPool) -> ResourceCacheRegistry {
    ResourceCacheRegistry::new(pool.clone(), LockFactory::new(pool.clone()))
}

fn config_registry(pool: &PgPool) -> ResourceConfigRegistry {
    ResourceConfigRegistry::new(pool.clone(), LockFactory::new(pool.clone()))
}

async fn cache_row_count(pool: &PgPool, config_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM resource_caches WHERE resource_config_id = $1")
        .bind(config_id)
        .fetch_one(pool)
        .await
        .expect("Failed to count caches")
}

async fn cache_use_count(pool: &PgPool, cache_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM resource_cache_uses WHERE resource_cache_id = $1")
        .bind(cache_id)
        .fetch_one(pool)
        .await
        .expect("Failed to count uses")
}

#[tokio::test]
async fn test_concurrent_find_or_create_returns_one_cache() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let type_name = register_base_type(&pool).await;
    let team = create_team(&pool).await;
    let build = create_build(&pool, team.id, BuildStatus::Started).await;

    let registry = cache_registry(&pool);
    let other_registry = cache_registry(&pool);

    let source = json!({"uri": "https://example.com/repo.git"});
    let version = json!({"ref": "abc"});

    let (first, second) = tokio::join!(
        registry.find_or_create_for_build(
            build.id,
            &type_name,
            version.clone(),
            source.clone(),
            Some(json!({})),
            &[],
        ),
        other_registry.find_or_create_for_build(
            build.id,
            &type_name,
            version.clone(),
            source.clone(),
            Some(json!({})),
            &[],
        ),
    );

    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.resource_config.id, second.resource_config.id);
    assert_eq!(cache_row_count(&pool, first.resource_config.id).await, 1);
    // Same owner on both sides: the duplicate use insert no-ops.
    assert_eq!(cache_use_count(&pool, first.id).await, 1);
}

#[tokio::test]
async fn test_two_builds_share_one_cache_with_two_uses() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let type_name = register_base_type(&pool).await;
    let team = create_team(&pool).await;
    let first_build = create_build(&pool, team.id, BuildStatus::Started).await;
    let second_build = create_build(&pool, team.id, BuildStatus::Started).await;

    let registry = cache_registry(&pool);
    let source = json!({"uri": "https://example.com/repo.git"});
    let version = json!({"ref": "abc"});

    let first = registry
        .find_or_create_for_build(
            first_build.id,
            &type_name,
            version.clone(),
            source.clone(),
            None,
            &[],
        )
        .await
        .unwrap();
    let second = registry
        .find_or_create_for_build(second_build.id, &type_name, version, source, None, &[])
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(cache_use_count(&pool, first.id).await, 2);
}

#[tokio::test]
async fn test_params_are_not_part_of_cache_identity() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let type_name = register_base_type(&pool).await;
    let team = create_team(&pool).await;
    let build = create_build(&pool, team.id, BuildStatus::Started).await;

    let registry = cache_registry(&pool);
    let source = json!({"uri": "https://example.com/repo.git"});
    let version = json!({"ref": "abc"});

    let without_params = registry
        .find_or_create_for_build(
            build.id,
            &type_name,
            version.clone(),
            source.clone(),
            None,
            &[],
        )
        .await
        .unwrap();
    let with_empty_params = registry
        .find_or_create_for_build(
            build.id,
            &type_name,
            version.clone(),
            source.clone(),
            Some(json!({})),
            &[],
        )
        .await
        .unwrap();
    let with_params = registry
        .find_or_create_for_build(
            build.id,
            &type_name,
            version,
            source,
            Some(json!({"depth": 1})),
            &[],
        )
        .await
        .unwrap();

    assert_eq!(without_params.id, with_empty_params.id);
    assert_eq!(without_params.id, with_params.id);
}

#[tokio::test]
async fn test_distinct_versions_get_distinct_caches() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let type_name = register_base_type(&pool).await;
    let team = create_team(&pool).await;
    let build = create_build(&pool, team.id, BuildStatus::Started).await;

    let registry = cache_registry(&pool);
    let source = json!({"uri": "https://example.com/repo.git"});

    let first = registry
        .find_or_create_for_build(
            build.id,
            &type_name,
            json!({"ref": "abc"}),
            source.clone(),
            None,
            &[],
        )
        .await
        .unwrap();
    let second = registry
        .find_or_create_for_build(build.id, &type_name, json!({"ref": "def"}), source, None, &[])
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.resource_config.id, second.resource_config.id);
}

#[tokio::test]
async fn test_config_dedup_across_owner_kinds() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let type_name = register_base_type(&pool).await;
    let team = create_team(&pool).await;
    let build = create_build(&pool, team.id, BuildStatus::Started).await;

    let registry = config_registry(&pool);
    let source = json!({"uri": "https://example.com/repo.git"});

    let for_build = registry
        .find_or_create_for_build(build.id, &type_name, source.clone(), &[])
        .await
        .unwrap();
    let for_resource = registry
        .find_or_create_for_resource(4001, &type_name, source, &[])
        .await
        .unwrap();

    assert_eq!(for_build.id, for_resource.id);
}

#[tokio::test]
async fn test_custom_type_builds_parent_cache_chain() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let base_type = register_base_type(&pool).await;
    let team = create_team(&pool).await;
    let build = create_build(&pool, team.id, BuildStatus::Started).await;

    let custom_name = unique("custom-type");
    let resource_types = vec![PipelineResourceType {
        name: custom_name.clone(),
        type_name: base_type.clone(),
        source: json!({"repository": "custom/impl"}),
        version: json!({"digest": "sha256:abc"}),
    }];

    let registry = config_registry(&pool);
    let config = registry
        .find_or_create_for_build(build.id, &custom_name, json!({"level": "top"}), &resource_types)
        .await
        .unwrap();

    // The custom type's implementation cache is the parent.
    match &config.parent {
        conveyor_db::resource_config::ConfigParent::Cache(cache) => {
            assert!(matches!(
                cache.resource_config.parent,
                conveyor_db::resource_config::ConfigParent::Base(_)
            ));
        }
        other => panic!("expected cache parent, got {other:?}"),
    }
    assert_eq!(config.root_base_type().name, base_type);
}

#[tokio::test]
async fn test_unknown_base_type_is_rejected() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let team = create_team(&pool).await;
    let build = create_build(&pool, team.id, BuildStatus::Started).await;

    let registry = config_registry(&pool);
    let err = registry
        .find_or_create_for_build(build.id, &unique("never-registered"), json!({}), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::BaseResourceTypeNotFound(_)));
}

#[tokio::test]
async fn test_destroy_requires_zero_uses() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let type_name = register_base_type(&pool).await;
    let team = create_team(&pool).await;
    let build = create_build(&pool, team.id, BuildStatus::Started).await;

    let registry = cache_registry(&pool);
    let cache = registry
        .find_or_create_for_build(
            build.id,
            &type_name,
            json!({"ref": "abc"}),
            json!({"uri": "x"}),
            None,
            &[],
        )
        .await
        .unwrap();

    // Still pinned by the build.
    let err = registry.destroy(cache.id).await.unwrap_err();
    assert!(matches!(err, DbError::ResourceCacheDisappeared));

    // Unpin and destroy.
    BuildRegistry::new(pool.clone())
        .save_status(build.id, BuildStatus::Succeeded)
        .await
        .unwrap();
    gc::release_uses_for_finished_builds(&pool).await.unwrap();

    registry.destroy(cache.id).await.unwrap();

    // Gone now.
    let err = registry.destroy(cache.id).await.unwrap_err();
    assert!(matches!(err, DbError::ResourceCacheDisappeared));
}

#[tokio::test]
async fn test_gc_sweeps_unused_caches_and_configs() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let type_name = register_base_type(&pool).await;
    let team = create_team(&pool).await;
    let build = create_build(&pool, team.id, BuildStatus::Started).await;

    let registry = cache_registry(&pool);
    let cache = registry
        .find_or_create_for_build(
            build.id,
            &type_name,
            json!({"ref": "abc"}),
            json!({"uri": "gc-test"}),
            None,
            &[],
        )
        .await
        .unwrap();
    let config_id = cache.resource_config.id;

    // Pinned: the sweep must not touch it.
    gc::collect_caches_and_configs(&pool).await.unwrap();
    assert_eq!(cache_row_count(&pool, config_id).await, 1);

    // Build finishes; uses released; sweep reaches a fixed point with
    // both the cache and its config gone.
    BuildRegistry::new(pool.clone())
        .save_status(build.id, BuildStatus::Errored)
        .await
        .unwrap();
    gc::release_uses_for_finished_builds(&pool).await.unwrap();
    gc::collect_caches_and_configs(&pool).await.unwrap();

    assert_eq!(cache_row_count(&pool, config_id).await, 0);
    let config_rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM resource_configs WHERE id = $1")
            .bind(config_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(config_rows, 0);
}
