// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volume service client and the worker-side volume client.
//!
//! Remote volumes live on the worker's volume service; their rows live in
//! the data layer. The [`VolumeClient`] pairs the two: it reserves a row,
//! creates the remote volume under the row's handle, and commits the row
//! once the remote object exists.

mod mock;

pub use mock::MockVolumeService;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;

use conveyor_db::container::CreatingContainer;
use conveyor_db::resource_cache::UsedResourceCache;
use conveyor_db::volume::{VolumeOwner, VolumeRepository};

use crate::error::{Result as WorkerResult, WorkerError};

/// Errors from volume service operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VolumeServiceError {
    /// A volume with this handle already exists.
    #[error("volume already exists: {0}")]
    AlreadyExists(String),

    /// The referenced parent volume does not exist.
    #[error("parent volume not found: {0}")]
    ParentNotFound(String),

    /// Transport-level failure talking to the volume service.
    #[error("volume service transport error: {0}")]
    Transport(String),
}

/// Result type for volume service operations.
pub type Result<T> = std::result::Result<T, VolumeServiceError>;

/// How the volume service should materialize a volume. Serialized as the
/// create-RPC argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum VolumeStrategy {
    /// Fresh empty directory.
    Empty,
    /// Per-step output scratch space.
    Output {
        /// Output name the step declares.
        name: String,
    },
    /// Copy-on-write child of an existing volume.
    ContainerRootFs {
        /// Handle of the parent volume.
        parent_handle: String,
    },
    /// Initialized once by a resource get.
    ResourceCache {
        /// Cache the volume holds.
        resource_cache_id: i64,
    },
    /// Imported once per worker from the base type's image.
    BaseResourceType {
        /// Base type being imported.
        base_resource_type_id: i64,
    },
}

/// A volume as known to the volume service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVolume {
    /// Handle the volume was created under.
    pub handle: String,
    /// Host path of the volume on the worker.
    pub path: String,
}

/// Client for a worker's volume service.
#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Create a volume under a data-layer-assigned handle.
    async fn create_volume(&self, handle: &str, strategy: &VolumeStrategy) -> Result<RemoteVolume>;

    /// Look up a volume by handle. An unknown handle is `Ok(None)`.
    async fn lookup_volume(&self, handle: &str) -> Result<Option<RemoteVolume>>;

    /// Destroy a volume. Destroying an unknown handle succeeds.
    async fn destroy_volume(&self, handle: &str) -> Result<()>;
}

/// Worker-side volume orchestration: data-layer rows paired with remote
/// volumes.
pub struct VolumeClient {
    service: std::sync::Arc<dyn VolumeService>,
    repository: VolumeRepository,
    worker_name: String,
}

impl VolumeClient {
    /// Create a client for one worker.
    pub fn new(
        pool: PgPool,
        service: std::sync::Arc<dyn VolumeService>,
        worker_name: String,
    ) -> Self {
        Self {
            service,
            repository: VolumeRepository::new(pool),
            worker_name,
        }
    }

    /// The worker this client places volumes on.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Create a container-owned volume: reserve the row, create the remote
    /// volume, commit the row.
    pub async fn create_volume_for_container(
        &self,
        container: &CreatingContainer,
        strategy: &VolumeStrategy,
        mount_path: &str,
    ) -> WorkerResult<RemoteVolume> {
        let creating = self
            .repository
            .create_volume(
                &self.worker_name,
                VolumeOwner::Container(container.id()),
                mount_path,
            )
            .await?;

        let remote = self.service.create_volume(creating.handle(), strategy).await?;
        creating.created().await?;

        tracing::debug!(
            handle = %remote.handle,
            mount_path = %mount_path,
            "Created container volume"
        );

        Ok(remote)
    }

    /// Find the initialized volume for a resource cache on this worker, or
    /// create one for the resource get to populate.
    pub async fn find_or_create_volume_for_resource_cache(
        &self,
        cache: &UsedResourceCache,
    ) -> WorkerResult<RemoteVolume> {
        if let Some(row) = self
            .repository
            .find_volume_for_resource_cache(&self.worker_name, cache.id)
            .await?
        {
            return match self.service.lookup_volume(&row.handle).await? {
                Some(remote) => Ok(remote),
                // The row is authoritative; a created row without a remote
                // volume is an invariant violation.
                None => Err(WorkerError::CreatedVolumeNotFound(row.handle)),
            };
        }

        let creating = self
            .repository
            .create_volume(&self.worker_name, VolumeOwner::ResourceCache(cache.id), "")
            .await?;

        let remote = self
            .service
            .create_volume(
                creating.handle(),
                &VolumeStrategy::ResourceCache {
                    resource_cache_id: cache.id,
                },
            )
            .await?;
        creating.created().await?;

        Ok(remote)
    }

    /// The worker's import volume for a base resource type, if imported.
    pub async fn find_import_volume(
        &self,
        base_resource_type_id: i64,
    ) -> WorkerResult<Option<RemoteVolume>> {
        let Some(row) = self
            .repository
            .find_import_volume(&self.worker_name, base_resource_type_id)
            .await?
        else {
            return Ok(None);
        };

        match self.service.lookup_volume(&row.handle).await? {
            Some(remote) => Ok(Some(remote)),
            None => Err(WorkerError::CreatedVolumeNotFound(row.handle)),
        }
    }

    /// Resolve the remote volume behind a created row, failing when the
    /// service no longer knows the handle.
    pub async fn lookup_created(&self, handle: &str) -> WorkerResult<RemoteVolume> {
        match self.service.lookup_volume(handle).await? {
            Some(remote) => Ok(remote),
            None => Err(WorkerError::CreatedVolumeNotFound(handle.to_string())),
        }
    }
}
