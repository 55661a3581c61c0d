// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for conveyor-worker integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use conveyor_db::container::CreatingContainer;
use conveyor_db::team::{Team, TeamRegistry};
use conveyor_db::worker::{Worker, WorkerRegistry, WorkerResourceType, WorkerSpec, WorkerState};

use conveyor_worker::error::{Result, WorkerError};
use conveyor_worker::image::{FetchedImage, ImageFetcher, ImageMetadata, ImageSpec};
use conveyor_worker::provider::{CancelToken, ContainerProvider, ContainerSpec};
use conveyor_worker::runtime::MockRuntime;
use conveyor_worker::volumes::{MockVolumeService, VolumeClient};

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

/// Image fetcher returning a fixed image without touching any service.
pub struct StubImageFetcher {
    /// Metadata the stub image carries.
    pub metadata: ImageMetadata,
    /// Version the stub image resolves to.
    pub version: Option<Value>,
}

impl StubImageFetcher {
    pub fn plain() -> Self {
        Self {
            metadata: ImageMetadata::default(),
            version: None,
        }
    }
}

#[async_trait]
impl ImageFetcher for StubImageFetcher {
    async fn fetch(
        &self,
        _worker: &Worker,
        _container: &CreatingContainer,
        _image: &ImageSpec,
        _team_id: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<FetchedImage> {
        if cancel.load(Ordering::SeqCst) {
            return Err(WorkerError::Aborted);
        }

        Ok(FetchedImage {
            rootfs_path: "raw:///images/stub/rootfs".to_string(),
            metadata: self.metadata.clone(),
            version: self.version.clone(),
        })
    }
}

/// Everything a provider test needs, wired against the mock runtime and
/// volume service.
pub struct Harness {
    pub pool: PgPool,
    pub runtime: Arc<MockRuntime>,
    pub volume_service: Arc<MockVolumeService>,
    pub volume_client: Arc<VolumeClient>,
    pub provider: ContainerProvider,
    pub worker: Worker,
    pub team: Team,
}

impl Harness {
    /// Register a fresh worker and build a provider around it.
    pub async fn new(pool: PgPool, fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self::with_spec(pool, fetcher, test_worker_spec(&unique("worker"))).await
    }

    /// Same, with a caller-controlled registration payload.
    pub async fn with_spec(
        pool: PgPool,
        fetcher: Arc<dyn ImageFetcher>,
        spec: WorkerSpec,
    ) -> Self {
        let worker = WorkerRegistry::new(pool.clone())
            .save_worker(&spec, Duration::from_secs(300))
            .await
            .expect("Failed to register worker");

        let team = TeamRegistry::new(pool.clone())
            .find_or_create(&unique("team"))
            .await
            .expect("Failed to create team");

        let runtime = Arc::new(MockRuntime::new());
        let volume_service = Arc::new(MockVolumeService::new());
        let volume_client = Arc::new(VolumeClient::new(
            pool.clone(),
            volume_service.clone(),
            worker.name.clone(),
        ));

        let provider = ContainerProvider::new(
            pool.clone(),
            runtime.clone(),
            volume_client.clone(),
            fetcher,
            worker.clone(),
        )
        .with_retry_delay(Duration::from_millis(50));

        Self {
            pool,
            runtime,
            volume_service,
            volume_client,
            provider,
            worker,
            team,
        }
    }

    /// A container spec with no mounts and a stub base-type image.
    pub fn plain_spec(&self) -> ContainerSpec {
        ContainerSpec {
            image: ImageSpec::BaseType("stub".to_string()),
            team_id: Some(self.team.id),
            env: vec![],
            user: None,
            ephemeral: false,
            mounts: vec![],
            inputs: vec![],
        }
    }

    /// Create a build in started status for this harness's team.
    pub async fn started_build(&self) -> i64 {
        let registry = conveyor_db::build::BuildRegistry::new(self.pool.clone());
        let build = registry
            .create(self.team.id)
            .await
            .expect("Failed to create build");
        registry
            .save_status(build.id, conveyor_db::build::BuildStatus::Started)
            .await
            .expect("Failed to start build");
        build.id
    }
}

/// A registration payload with one uniquely named resource type.
pub fn test_worker_spec(name: &str) -> WorkerSpec {
    WorkerSpec {
        name: name.to_string(),
        runtime_addr: Some("10.0.0.1:7777".to_string()),
        volumes_addr: "http://10.0.0.1:7788".to_string(),
        http_proxy_url: String::new(),
        https_proxy_url: String::new(),
        no_proxy: String::new(),
        active_containers: 0,
        resource_types: vec![WorkerResourceType {
            name: format!("{name}-git"),
            image: "/images/git".to_string(),
            version: "1.0".to_string(),
        }],
        platform: "linux".to_string(),
        tags: vec![],
        start_time: chrono::Utc::now().timestamp(),
        state: WorkerState::Running,
    }
}

/// A fresh, unset cancellation token.
pub fn cancel_token() -> CancelToken {
    Arc::new(std::sync::atomic::AtomicBool::new(false))
}
