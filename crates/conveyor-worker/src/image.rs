// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Root filesystem resolution for new containers.
//!
//! Exactly one image source is set per container spec:
//!
//! - an artifact produced elsewhere in the pipeline, reused as a
//!   copy-on-write parent when it already has a volume on this worker and
//!   streamed into a fresh volume otherwise;
//! - an image resource, fetched through the resource plugin pipeline into
//!   a cached volume;
//! - a base resource type, cloned copy-on-write from the worker's import
//!   volume.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;

use conveyor_db::base_resource_type;
use conveyor_db::container::CreatingContainer;
use conveyor_db::worker::Worker;

use crate::error::{Result, WorkerError};
use crate::provider::CancelToken;
use crate::volumes::{RemoteVolume, VolumeClient, VolumeStrategy};

/// Where a container's root filesystem comes from. Exactly one source.
pub enum ImageSpec {
    /// An artifact from another step, addressed through its source.
    Artifact(Arc<dyn ArtifactSource>),
    /// An image resource fetched via the plugin pipeline.
    Resource(ImageResource),
    /// A base resource type imported on the worker.
    BaseType(String),
}

impl std::fmt::Debug for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSpec::Artifact(_) => f.write_str("ImageSpec::Artifact"),
            ImageSpec::Resource(resource) => {
                f.debug_tuple("ImageSpec::Resource").field(resource).finish()
            }
            ImageSpec::BaseType(name) => f.debug_tuple("ImageSpec::BaseType").field(name).finish(),
        }
    }
}

/// An image defined as a resource in the pipeline.
#[derive(Debug, Clone)]
pub struct ImageResource {
    /// Resource type fetching the image.
    pub type_name: String,
    /// Source config of the image resource.
    pub source: Value,
    /// Fetch params.
    pub params: Option<Value>,
    /// Pinned version; `None` means check for the latest first.
    pub version: Option<Value>,
}

/// Environment defaults shipped inside an image (`metadata.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageMetadata {
    /// Environment in `KEY=value` form.
    #[serde(default)]
    pub env: Vec<String>,
    /// Default user the image runs as.
    #[serde(default)]
    pub user: Option<String>,
}

/// A resolved root filesystem ready to hand to the runtime.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Root filesystem location in the runtime's addressing scheme.
    pub rootfs_path: String,
    /// Environment defaults from the image.
    pub metadata: ImageMetadata,
    /// Version of the resource type that produced the image, when one did.
    pub version: Option<Value>,
}

/// An artifact elsewhere in the cluster that can back an image.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// The artifact's volume on the named worker, if it has one there.
    async fn existing_volume_on(&self, worker_name: &str) -> Result<Option<RemoteVolume>>;

    /// Stream the artifact's bytes into a volume on this worker.
    async fn stream_into(&self, destination: &RemoteVolume) -> Result<()>;

    /// Read the artifact's `metadata.json`.
    async fn fetch_metadata(&self) -> Result<ImageMetadata>;
}

/// The resource plugin pipeline, run for image resources: check resolves a
/// version, get populates a cache volume on the worker.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch the image resource onto the worker, returning its initialized
    /// cache volume, resolved version, and metadata.
    async fn fetch_image_resource(
        &self,
        worker: &Worker,
        image: &ImageResource,
        team_id: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<FetchedResource>;
}

/// Result of fetching an image resource.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    /// The initialized cache volume on the worker.
    pub volume: RemoteVolume,
    /// The version that was fetched.
    pub version: Value,
    /// Metadata read from the fetched image.
    pub metadata: ImageMetadata,
}

/// Resolves an [`ImageSpec`] into a [`FetchedImage`] for a creating
/// container.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Resolve the root filesystem. Watched for cancellation; database
    /// work is not interrupted mid-transaction.
    async fn fetch(
        &self,
        worker: &Worker,
        container: &CreatingContainer,
        image: &ImageSpec,
        team_id: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<FetchedImage>;
}

/// Default image fetcher backed by the volume client and the resource
/// plugin pipeline.
pub struct ImageResolver {
    pool: PgPool,
    volume_client: Arc<VolumeClient>,
    resource_fetcher: Arc<dyn ResourceFetcher>,
}

impl ImageResolver {
    /// Create a resolver.
    pub fn new(
        pool: PgPool,
        volume_client: Arc<VolumeClient>,
        resource_fetcher: Arc<dyn ResourceFetcher>,
    ) -> Self {
        Self {
            pool,
            volume_client,
            resource_fetcher,
        }
    }

    async fn fetch_artifact(
        &self,
        container: &CreatingContainer,
        source: &dyn ArtifactSource,
    ) -> Result<FetchedImage> {
        let worker_name = self.volume_client.worker_name();

        let volume = match source.existing_volume_on(worker_name).await? {
            // Local artifact: branch a copy-on-write child instead of
            // duplicating the bytes.
            Some(local) => {
                self.volume_client
                    .create_volume_for_container(
                        container,
                        &VolumeStrategy::ContainerRootFs {
                            parent_handle: local.handle.clone(),
                        },
                        "",
                    )
                    .await?
            }
            None => {
                let fresh = self
                    .volume_client
                    .create_volume_for_container(container, &VolumeStrategy::Empty, "")
                    .await?;
                source.stream_into(&fresh).await?;
                fresh
            }
        };

        let metadata = source.fetch_metadata().await?;

        Ok(FetchedImage {
            rootfs_path: rootfs_path(&volume),
            metadata,
            version: None,
        })
    }

    async fn fetch_resource(
        &self,
        worker: &Worker,
        container: &CreatingContainer,
        image: &ImageResource,
        team_id: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<FetchedImage> {
        let fetched = self
            .resource_fetcher
            .fetch_image_resource(worker, image, team_id, cancel)
            .await?;

        // The cache volume is shared; the container gets its own
        // copy-on-write branch as a writable root filesystem.
        let rootfs = self
            .volume_client
            .create_volume_for_container(
                container,
                &VolumeStrategy::ContainerRootFs {
                    parent_handle: fetched.volume.handle.clone(),
                },
                "",
            )
            .await?;

        Ok(FetchedImage {
            rootfs_path: rootfs_path(&rootfs),
            metadata: fetched.metadata,
            version: Some(fetched.version),
        })
    }

    async fn fetch_base_type(
        &self,
        worker: &Worker,
        container: &CreatingContainer,
        type_name: &str,
    ) -> Result<FetchedImage> {
        let version = worker
            .resource_types
            .iter()
            .find(|t| t.name == type_name)
            .map(|t| t.version.clone())
            .ok_or_else(|| WorkerError::ResourceTypeNotFound(type_name.to_string()))?;

        let mut conn = self.pool.acquire().await.map_err(conveyor_db::DbError::from)?;
        let base_type = base_resource_type::find(&mut conn, type_name)
            .await?
            .ok_or_else(|| WorkerError::ResourceTypeNotFound(type_name.to_string()))?;
        drop(conn);

        let import = self
            .volume_client
            .find_import_volume(base_type.id)
            .await?
            .ok_or_else(|| WorkerError::ImportVolumeMissing(type_name.to_string()))?;

        let rootfs = self
            .volume_client
            .create_volume_for_container(
                container,
                &VolumeStrategy::ContainerRootFs {
                    parent_handle: import.handle.clone(),
                },
                "",
            )
            .await?;

        Ok(FetchedImage {
            rootfs_path: rootfs_path(&rootfs),
            metadata: ImageMetadata::default(),
            version: Some(Value::String(version)),
        })
    }
}

#[async_trait]
impl ImageFetcher for ImageResolver {
    async fn fetch(
        &self,
        worker: &Worker,
        container: &CreatingContainer,
        image: &ImageSpec,
        team_id: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<FetchedImage> {
        match image {
            ImageSpec::Artifact(source) => self.fetch_artifact(container, source.as_ref()).await,
            ImageSpec::Resource(resource) => {
                self.fetch_resource(worker, container, resource, team_id, cancel)
                    .await
            }
            ImageSpec::BaseType(name) => self.fetch_base_type(worker, container, name).await,
        }
    }
}

/// Runtime addressing for a volume-backed root filesystem.
fn rootfs_path(volume: &RemoteVolume) -> String {
    format!("raw://{}/rootfs", volume.path)
}
