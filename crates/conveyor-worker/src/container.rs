// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The container handed back to callers.

use std::sync::Arc;

use conveyor_db::container::CreatedContainer;

use crate::error::Result;
use crate::runtime::{ContainerRuntime, RuntimeContainer};
use crate::volumes::RemoteVolume;

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// The mounted volume.
    pub volume: RemoteVolume,
    /// Path inside the container.
    pub mount_path: String,
}

/// A placed container: the runtime object joined with its authoritative
/// database row and its hydrated volume mounts.
pub struct Container {
    db: CreatedContainer,
    runtime_container: RuntimeContainer,
    mounts: Vec<VolumeMount>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("db", &self.db)
            .field("runtime_container", &self.runtime_container)
            .field("mounts", &self.mounts)
            .finish()
    }
}

impl Container {
    pub(crate) fn new(
        runtime_container: RuntimeContainer,
        db: CreatedContainer,
        mounts: Vec<VolumeMount>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            db,
            runtime_container,
            mounts,
            runtime,
        }
    }

    /// Globally unique handle.
    pub fn handle(&self) -> &str {
        self.db.handle()
    }

    /// Worker the container lives on.
    pub fn worker_name(&self) -> &str {
        self.db.worker_name()
    }

    /// Properties the runtime reports for the container.
    pub fn properties(&self) -> &std::collections::HashMap<String, String> {
        &self.runtime_container.properties
    }

    /// Volume mounts in the order they were handed to the runtime.
    pub fn volume_mounts(&self) -> &[VolumeMount] {
        &self.mounts
    }

    /// Tear down the runtime container and mark the row for removal.
    pub async fn destroy(self) -> Result<()> {
        let handle = self.db.handle().to_string();
        self.runtime.destroy(&handle).await?;
        self.db.destroying().await?;

        tracing::info!(handle = %handle, "Destroyed container");

        Ok(())
    }
}
