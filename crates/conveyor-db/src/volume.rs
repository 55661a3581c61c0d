// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volume rows.
//!
//! Volumes follow the same two-phase lifecycle as containers. Each volume
//! is owned by exactly one container, resource cache, or base-resource-type
//! import slot; the owner determines the creation strategy sent to the
//! volume service.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{DbError, Result};

/// The single owner of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOwner {
    /// Mounted into a container.
    Container(i64),
    /// Holds a fetched resource artifact.
    ResourceCache(i64),
    /// Per-worker import of a base resource type image.
    BaseResourceType(i64),
}

impl VolumeOwner {
    fn columns(&self) -> (Option<i64>, Option<i64>, Option<i64>) {
        match self {
            VolumeOwner::Container(id) => (Some(*id), None, None),
            VolumeOwner::ResourceCache(id) => (None, Some(*id), None),
            VolumeOwner::BaseResourceType(id) => (None, None, Some(*id)),
        }
    }
}

/// A volume reservation awaiting its remote object.
#[derive(Debug)]
pub struct CreatingVolume {
    id: i64,
    handle: String,
    worker_name: String,
    pool: PgPool,
}

impl CreatingVolume {
    /// Row id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Globally unique handle.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Transition to created once the volume service has the volume.
    pub async fn created(self) -> Result<CreatedVolume> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE volumes SET state = 'created'
            WHERE id = $1 AND state IN ('creating', 'created')
            RETURNING mount_path
            "#,
        )
        .bind(self.id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((mount_path,)) = row else {
            return Err(DbError::VolumeDisappeared(self.handle));
        };

        Ok(CreatedVolume {
            id: self.id,
            handle: self.handle,
            worker_name: self.worker_name,
            mount_path,
        })
    }
}

/// A volume whose remote object is known to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVolume {
    /// Row id.
    pub id: i64,
    /// Globally unique handle.
    pub handle: String,
    /// Worker the volume lives on.
    pub worker_name: String,
    /// Path the volume mounts at inside its container, when
    /// container-owned; empty otherwise.
    pub mount_path: String,
}

/// Repository for volume rows.
pub struct VolumeRepository {
    pool: PgPool,
}

impl VolumeRepository {
    /// Create a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reserve a volume for an owner on a worker, assigning a fresh
    /// handle. `mount_path` is recorded for container-owned volumes so
    /// mounts can be rebuilt from rows alone.
    pub async fn create_volume(
        &self,
        worker_name: &str,
        owner: VolumeOwner,
        mount_path: &str,
    ) -> Result<CreatingVolume> {
        let (container_id, cache_id, base_type_id) = owner.columns();
        let handle = Uuid::new_v4().to_string();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO volumes (
                handle, worker_name, state,
                container_id, resource_cache_id, base_resource_type_id,
                mount_path
            ) VALUES ($1, $2, 'creating', $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&handle)
        .bind(worker_name)
        .bind(container_id)
        .bind(cache_id)
        .bind(base_type_id)
        .bind(mount_path)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(handle = %handle, worker = %worker_name, "Reserved volume");

        Ok(CreatingVolume {
            id,
            handle,
            worker_name: worker_name.to_string(),
            pool: self.pool.clone(),
        })
    }

    /// Created volumes mounted into a container, in creation order. The
    /// order is the mount order handed to the runtime.
    pub async fn find_volumes_for_container(
        &self,
        container_id: i64,
    ) -> Result<Vec<CreatedVolume>> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            r#"
            SELECT id, handle, worker_name, mount_path
            FROM volumes
            WHERE container_id = $1 AND state = 'created'
            ORDER BY id
            "#,
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, handle, worker_name, mount_path)| CreatedVolume {
                id,
                handle,
                worker_name,
                mount_path,
            })
            .collect())
    }

    /// The worker-local volume holding a resource cache, if initialized.
    pub async fn find_volume_for_resource_cache(
        &self,
        worker_name: &str,
        resource_cache_id: i64,
    ) -> Result<Option<CreatedVolume>> {
        let row: Option<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT id, handle, mount_path
            FROM volumes
            WHERE worker_name = $1 AND resource_cache_id = $2 AND state = 'created'
            "#,
        )
        .bind(worker_name)
        .bind(resource_cache_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, handle, mount_path)| CreatedVolume {
            id,
            handle,
            worker_name: worker_name.to_string(),
            mount_path,
        }))
    }

    /// The worker-local import volume for a base resource type, if the
    /// worker has imported it.
    pub async fn find_import_volume(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
    ) -> Result<Option<CreatedVolume>> {
        let row: Option<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT id, handle, mount_path
            FROM volumes
            WHERE worker_name = $1 AND base_resource_type_id = $2 AND state = 'created'
            "#,
        )
        .bind(worker_name)
        .bind(base_resource_type_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, handle, mount_path)| CreatedVolume {
            id,
            handle,
            worker_name: worker_name.to_string(),
            mount_path,
        }))
    }

    /// Remove a destroying volume row once its remote object is confirmed
    /// gone.
    pub async fn remove(&self, handle: &str) -> Result<()> {
        sqlx::query("DELETE FROM volumes WHERE handle = $1 AND state = 'destroying'")
            .bind(handle)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
