// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-worker find-or-create container placement.
//!
//! All four typed entry points run the same protocol, parameterized only
//! by the container's parentage:
//!
//! 1. Find the container row for the owner on this worker.
//! 2. A created row must have a runtime container behind it; the database
//!    is authoritative, so a runtime miss is an invariant violation.
//! 3. A creating row whose handle the runtime does not know yet is the
//!    normal mid-creation state and is tolerated.
//! 4. With no row at all, reserve one; the fresh handle is assigned at
//!    insert time.
//! 5. Take the creation lock keyed by the row id. On contention, sleep
//!    briefly and restart from step 1: either the winner's created row
//!    shows up, or the lock frees.
//! 6. Resolve the root filesystem (cancellable).
//! 7. Build volume mounts in order: declared outputs, then the spec's
//!    mounts verbatim, then copy-on-write input branches.
//! 8. Compose environment: image defaults, then the spec, then the
//!    worker's proxy settings.
//! 9. Create the runtime container under the row's handle.
//! 10. Persist the resolved user, resource type version, and lifetime.
//! 11. Transition the row to created, then release the lock.
//!
//! The lock is the linearization point: whoever holds it finishes steps
//! 6-11 before any contender can observe the container as created.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use sqlx::PgPool;

use conveyor_db::container::{
    ContainerKind, ContainerOwner, ContainerRepository, CreatingContainer,
};
use conveyor_db::hashing;
use conveyor_db::lock::LockFactory;
use conveyor_db::resource_cache::ResourceCacheRegistry;
use conveyor_db::resource_config::{PipelineResourceType, ResourceConfigRegistry, ResourceUser};
use conveyor_db::volume::VolumeRepository;
use conveyor_db::worker::{Worker, WorkerState};

use crate::container::{Container, VolumeMount};
use crate::error::{Result, WorkerError};
use crate::image::{ImageFetcher, ImageSpec};
use crate::runtime::{BindMount, ContainerRuntime, RuntimeContainer, RuntimeContainerSpec};
use crate::volumes::{VolumeClient, VolumeStrategy};

/// Cancellation token watched during image fetch and runtime create.
/// Database work is never interrupted mid-transaction; an abandoned
/// container is reclaimed by normal garbage collection.
pub type CancelToken = Arc<AtomicBool>;

const CREATING_CONTAINER_RETRY_DELAY: Duration = Duration::from_secs(1);

const CHECK_LIFETIME_FLOOR: Duration = Duration::from_secs(5 * 60);
const CHECK_LIFETIME_CEILING: Duration = Duration::from_secs(60 * 60);

/// What the caller wants inside the container, beyond its parentage.
pub struct ContainerSpec {
    /// Root filesystem source; exactly one is set.
    pub image: ImageSpec,
    /// Team scoping, shared with the container row.
    pub team_id: Option<i64>,
    /// Environment in `KEY=value` form, appended after image defaults.
    pub env: Vec<String>,
    /// User override; falls back to the image's default user.
    pub user: Option<String>,
    /// Mark the container ephemeral to the runtime.
    pub ephemeral: bool,
    /// Pre-existing mounts passed through verbatim.
    pub mounts: Vec<VolumeMount>,
    /// Inputs mounted as copy-on-write branches of their volumes.
    pub inputs: Vec<VolumeMount>,
}

/// Find-or-create container placement on one worker.
pub struct ContainerProvider {
    lock_factory: LockFactory,
    runtime: Arc<dyn ContainerRuntime>,
    volume_client: Arc<VolumeClient>,
    image_fetcher: Arc<dyn ImageFetcher>,
    containers: ContainerRepository,
    volumes: VolumeRepository,
    resource_configs: ResourceConfigRegistry,
    resource_caches: ResourceCacheRegistry,
    worker: Worker,
    retry_delay: Duration,
}

impl ContainerProvider {
    /// Create a provider for one worker.
    pub fn new(
        pool: PgPool,
        runtime: Arc<dyn ContainerRuntime>,
        volume_client: Arc<VolumeClient>,
        image_fetcher: Arc<dyn ImageFetcher>,
        worker: Worker,
    ) -> Self {
        let lock_factory = LockFactory::new(pool.clone());
        Self {
            containers: ContainerRepository::new(pool.clone()),
            volumes: VolumeRepository::new(pool.clone()),
            resource_configs: ResourceConfigRegistry::new(pool.clone(), lock_factory.clone()),
            resource_caches: ResourceCacheRegistry::new(pool, lock_factory.clone()),
            lock_factory,
            runtime,
            volume_client,
            image_fetcher,
            worker,
            retry_delay: CREATING_CONTAINER_RETRY_DELAY,
        }
    }

    /// Override the contention retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Find or create the container for a build step.
    pub async fn find_or_create_build_container(
        &self,
        cancel: &CancelToken,
        build_id: i64,
        plan_id: &str,
        spec: ContainerSpec,
        output_paths: &[(String, String)],
    ) -> Result<Container> {
        self.find_or_create_container(
            cancel,
            ContainerOwner::Build {
                build_id,
                plan_id: plan_id.to_string(),
            },
            &spec,
            output_paths,
        )
        .await
    }

    /// Find or create the container checking a pipeline resource.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_resource_check_container(
        &self,
        cancel: &CancelToken,
        resource_id: i64,
        type_name: &str,
        source: Value,
        resource_types: &[PipelineResourceType],
        spec: ContainerSpec,
    ) -> Result<Container> {
        let resource_config = self
            .resource_configs
            .find_or_create_for_resource(resource_id, type_name, source, resource_types)
            .await?;

        self.find_or_create_container(
            cancel,
            ContainerOwner::Check {
                resource_config_id: resource_config.id,
            },
            &spec,
            &[],
        )
        .await
    }

    /// Find or create the container checking a custom resource type.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_resource_type_check_container(
        &self,
        cancel: &CancelToken,
        resource_type_id: i64,
        type_name: &str,
        source: Value,
        resource_types: &[PipelineResourceType],
        spec: ContainerSpec,
    ) -> Result<Container> {
        let resource_config = self
            .resource_configs
            .find_or_create_for_resource_type(resource_type_id, type_name, source, resource_types)
            .await?;

        self.find_or_create_container(
            cancel,
            ContainerOwner::Check {
                resource_config_id: resource_config.id,
            },
            &spec,
            &[],
        )
        .await
    }

    /// Find or create the container fetching a resource version into its
    /// cache. The owner decides which use row pins the cache.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_resource_get_container(
        &self,
        cancel: &CancelToken,
        user: ResourceUser,
        type_name: &str,
        version: Value,
        source: Value,
        params: Option<Value>,
        resource_types: &[PipelineResourceType],
        step_name: &str,
        spec: ContainerSpec,
        output_paths: &[(String, String)],
    ) -> Result<Container> {
        let resource_cache = match user {
            ResourceUser::Build(build_id) => {
                self.resource_caches
                    .find_or_create_for_build(
                        build_id,
                        type_name,
                        version,
                        source,
                        params,
                        resource_types,
                    )
                    .await?
            }
            ResourceUser::Resource(resource_id) => {
                self.resource_caches
                    .find_or_create_for_resource(
                        resource_id,
                        type_name,
                        version,
                        source,
                        params,
                        resource_types,
                    )
                    .await?
            }
            ResourceUser::ResourceType(resource_type_id) => {
                self.resource_caches
                    .find_or_create_for_resource_type(
                        resource_type_id,
                        type_name,
                        version,
                        source,
                        params,
                        resource_types,
                    )
                    .await?
            }
        };

        self.find_or_create_container(
            cancel,
            ContainerOwner::Get {
                resource_cache_id: resource_cache.id,
                step_name: step_name.to_string(),
            },
            &spec,
            output_paths,
        )
        .await
    }

    /// Look up a placed container by handle.
    ///
    /// A handle unknown to both the runtime and the database resolves to
    /// `None`. A created row whose handle the runtime has lost is the
    /// invariant violation [`WorkerError::CreatedContainerNotFound`].
    pub async fn find_container_by_handle(
        &self,
        handle: &str,
        team_id: Option<i64>,
    ) -> Result<Option<Container>> {
        let created = self.containers.find_created_by_handle(handle, team_id).await?;
        let runtime_container = self.runtime.lookup(handle).await?;

        match (runtime_container, created) {
            (Some(runtime_container), Some(created)) => {
                Ok(Some(self.hydrate(runtime_container, created).await?))
            }
            (None, Some(_)) => Err(WorkerError::CreatedContainerNotFound(handle.to_string())),
            _ => Ok(None),
        }
    }

    async fn find_or_create_container(
        &self,
        cancel: &CancelToken,
        owner: ContainerOwner,
        spec: &ContainerSpec,
        output_paths: &[(String, String)],
    ) -> Result<Container> {
        if self.worker.state != WorkerState::Running {
            return Err(WorkerError::WorkerNotRunning(self.worker.name.clone()));
        }

        loop {
            let (creating, created) = self
                .containers
                .find_container(&self.worker.name, spec.team_id, &owner)
                .await?;

            if let Some(created) = created {
                let runtime_container =
                    self.runtime.lookup(created.handle()).await?.ok_or_else(|| {
                        WorkerError::CreatedContainerNotFound(created.handle().to_string())
                    })?;
                return self.hydrate(runtime_container, created).await;
            }

            let mut runtime_container = None;
            let creating = match creating {
                Some(creating) => {
                    // Mid-creation: the runtime not knowing the handle yet
                    // is the expected state.
                    runtime_container = self.runtime.lookup(creating.handle()).await?;
                    creating
                }
                None => {
                    match self
                        .containers
                        .create_container(&self.worker.name, spec.team_id, &owner)
                        .await
                    {
                        Ok(creating) => creating,
                        // A peer reserved the row first; re-find and join
                        // its container.
                        Err(conveyor_db::DbError::SafeRetryFindOrCreate) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
            };

            if let Some(runtime_container) = runtime_container {
                let created = creating.created().await?;
                return self.hydrate(runtime_container, created).await;
            }

            let lock_name = creating_lock_name(creating.id());
            let Some(lock) = self.lock_factory.try_acquire(&lock_name).await? else {
                tracing::debug!(
                    handle = %creating.handle(),
                    "Creation lock contended, retrying"
                );
                tokio::time::sleep(self.retry_delay).await;
                continue;
            };

            let built = self
                .build_runtime_container(cancel, &creating, owner.kind(), spec, output_paths)
                .await;

            let runtime_container = match built {
                Ok(runtime_container) => runtime_container,
                Err(err) => {
                    lock.release().await?;
                    return Err(err);
                }
            };

            let transitioned = creating.created().await;
            lock.release().await?;
            let created = transitioned?;

            return self.hydrate(runtime_container, created).await;
        }
    }

    async fn build_runtime_container(
        &self,
        cancel: &CancelToken,
        creating: &CreatingContainer,
        kind: ContainerKind,
        spec: &ContainerSpec,
        output_paths: &[(String, String)],
    ) -> Result<RuntimeContainer> {
        check_cancelled(cancel)?;

        let image = self
            .image_fetcher
            .fetch(&self.worker, creating, &spec.image, spec.team_id, cancel)
            .await?;

        let mut mounts: Vec<VolumeMount> = Vec::new();

        for (name, path) in output_paths {
            let volume = self
                .volume_client
                .create_volume_for_container(
                    creating,
                    &VolumeStrategy::Output { name: name.clone() },
                    path,
                )
                .await?;
            mounts.push(VolumeMount {
                volume,
                mount_path: path.clone(),
            });
        }

        mounts.extend(spec.mounts.iter().cloned());

        for input in &spec.inputs {
            let volume = self
                .volume_client
                .create_volume_for_container(
                    creating,
                    &VolumeStrategy::ContainerRootFs {
                        parent_handle: input.volume.handle.clone(),
                    },
                    &input.mount_path,
                )
                .await?;
            mounts.push(VolumeMount {
                volume,
                mount_path: input.mount_path.clone(),
            });
        }

        let bind_mounts: Vec<BindMount> = mounts
            .iter()
            .map(|mount| BindMount {
                src_path: mount.volume.path.clone(),
                dst_path: mount.mount_path.clone(),
            })
            .collect();

        let env = compose_env(&image.metadata.env, &spec.env, &self.worker);

        let resolved_user = spec
            .user
            .clone()
            .or_else(|| image.metadata.user.clone())
            .unwrap_or_default();

        let mut properties = HashMap::from([("user".to_string(), resolved_user.clone())]);
        if spec.ephemeral {
            properties.insert("ephemeral".to_string(), "true".to_string());
        }

        check_cancelled(cancel)?;

        let runtime_container = self
            .runtime
            .create(&RuntimeContainerSpec {
                handle: creating.handle().to_string(),
                rootfs_path: image.rootfs_path.clone(),
                env,
                bind_mounts,
                properties,
            })
            .await?;

        self.containers
            .update_placement(
                creating.id(),
                &resolved_user,
                image.version.as_ref(),
                max_container_lifetime(kind, self.worker.uptime()),
            )
            .await?;

        tracing::info!(
            handle = %creating.handle(),
            worker = %self.worker.name,
            kind = %kind.as_str(),
            "Created runtime container"
        );

        Ok(runtime_container)
    }

    async fn hydrate(
        &self,
        runtime_container: RuntimeContainer,
        created: conveyor_db::container::CreatedContainer,
    ) -> Result<Container> {
        let rows = self.volumes.find_volumes_for_container(created.id()).await?;

        let mut mounts = Vec::new();
        for row in rows {
            // Rootfs and cache branches carry no mount path; only actual
            // mounts are hydrated.
            if row.mount_path.is_empty() {
                continue;
            }
            let remote = self.volume_client.lookup_created(&row.handle).await?;
            mounts.push(VolumeMount {
                volume: remote,
                mount_path: row.mount_path,
            });
        }

        Ok(Container::new(
            runtime_container,
            created,
            mounts,
            self.runtime.clone(),
        ))
    }
}

fn creating_lock_name(container_id: i64) -> String {
    hashing::lock_name(&json!({"container_creating": container_id}))
}

fn check_cancelled(cancel: &CancelToken) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(WorkerError::Aborted);
    }
    Ok(())
}

/// Image defaults first, then the spec, then the worker's proxy settings,
/// each proxy triple appended only when non-empty.
fn compose_env(image_env: &[String], spec_env: &[String], worker: &Worker) -> Vec<String> {
    let mut env: Vec<String> = image_env.iter().chain(spec_env.iter()).cloned().collect();

    if !worker.http_proxy_url.is_empty() {
        env.push(format!("http_proxy={}", worker.http_proxy_url));
    }
    if !worker.https_proxy_url.is_empty() {
        env.push(format!("https_proxy={}", worker.https_proxy_url));
    }
    if !worker.no_proxy.is_empty() {
        env.push(format!("no_proxy={}", worker.no_proxy));
    }

    env
}

/// Check containers live as long as the worker has been up, clamped to
/// between five minutes and one hour. Everything else has no expiry here;
/// lifetime is governed by subsequent steps.
fn max_container_lifetime(kind: ContainerKind, worker_uptime: Duration) -> Option<Duration> {
    match kind {
        ContainerKind::Check => Some(worker_uptime.clamp(CHECK_LIFETIME_FLOOR, CHECK_LIFETIME_CEILING)),
        _ => None,
    }
}
