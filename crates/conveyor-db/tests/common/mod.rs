// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for conveyor-db integration tests.
//!
//! Tests run against a real PostgreSQL database and are skipped when
//! `CONVEYOR_TEST_DATABASE_URL` is not set. Rows are isolated per test via
//! UUID-suffixed names, so the tests are safe to run in parallel.

#![allow(dead_code)]

use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use conveyor_db::build::{Build, BuildRegistry, BuildStatus};
use conveyor_db::team::{Team, TeamRegistry};
use conveyor_db::worker::{WorkerResourceType, WorkerSpec, WorkerState};

/// Helper macro to skip tests if the database URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("CONVEYOR_TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: CONVEYOR_TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a migrated database pool for testing.
pub async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("CONVEYOR_TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    conveyor_db::migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// A unique name with the given prefix, safe for parallel tests.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// A registration payload with two resource types, uniquely named.
pub fn test_worker_spec(name: &str) -> WorkerSpec {
    WorkerSpec {
        name: name.to_string(),
        runtime_addr: Some("10.0.0.1:7777".to_string()),
        volumes_addr: "http://10.0.0.1:7788".to_string(),
        http_proxy_url: "http://proxy.internal:3128".to_string(),
        https_proxy_url: "https://proxy.internal:3128".to_string(),
        no_proxy: "localhost".to_string(),
        active_containers: 140,
        resource_types: vec![
            WorkerResourceType {
                name: format!("{name}-git"),
                image: "/images/git".to_string(),
                version: "1.0".to_string(),
            },
            WorkerResourceType {
                name: format!("{name}-s3"),
                image: "/images/s3".to_string(),
                version: "1.0".to_string(),
            },
        ],
        platform: "linux".to_string(),
        tags: vec!["vm".to_string()],
        start_time: chrono::Utc::now().timestamp(),
        state: WorkerState::Running,
    }
}

/// Create a uniquely named team.
pub async fn create_team(pool: &PgPool) -> Team {
    TeamRegistry::new(pool.clone())
        .find_or_create(&unique("team"))
        .await
        .expect("Failed to create team")
}

/// Create a build in the given status.
pub async fn create_build(pool: &PgPool, team_id: i64, status: BuildStatus) -> Build {
    let registry = BuildRegistry::new(pool.clone());
    let build = registry.create(team_id).await.expect("Failed to create build");
    registry
        .save_status(build.id, status)
        .await
        .expect("Failed to save build status");
    build
}

/// Age a worker's heartbeat deadline into the past.
pub async fn expire_worker(pool: &PgPool, name: &str) {
    sqlx::query("UPDATE workers SET expires_at = NOW() - INTERVAL '1 minute' WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await
        .expect("Failed to expire worker");
}

/// Default registration TTL used across tests.
pub const TEST_TTL: Duration = Duration::from_secs(5 * 60);
