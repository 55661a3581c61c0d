// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock volume service for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RemoteVolume, Result, VolumeService, VolumeServiceError, VolumeStrategy};

/// Mock volume service keeping volumes in memory. Records the strategy of
/// every create call so tests can assert on projections.
#[derive(Default)]
pub struct MockVolumeService {
    volumes: Mutex<HashMap<String, RemoteVolume>>,
    create_calls: Mutex<Vec<(String, VolumeStrategy)>>,
}

impl MockVolumeService {
    /// Create an empty mock service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every create call so far as `(handle, strategy)`, in call order.
    pub async fn created(&self) -> Vec<(String, VolumeStrategy)> {
        self.create_calls.lock().await.clone()
    }

    /// Forget a volume, simulating service-side loss of state.
    pub async fn forget(&self, handle: &str) {
        self.volumes.lock().await.remove(handle);
    }
}

#[async_trait]
impl VolumeService for MockVolumeService {
    async fn create_volume(&self, handle: &str, strategy: &VolumeStrategy) -> Result<RemoteVolume> {
        let mut volumes = self.volumes.lock().await;
        if volumes.contains_key(handle) {
            return Err(VolumeServiceError::AlreadyExists(handle.to_string()));
        }

        if let VolumeStrategy::ContainerRootFs { parent_handle } = strategy
            && !volumes.contains_key(parent_handle)
        {
            return Err(VolumeServiceError::ParentNotFound(parent_handle.clone()));
        }

        self.create_calls
            .lock()
            .await
            .push((handle.to_string(), strategy.clone()));

        let volume = RemoteVolume {
            handle: handle.to_string(),
            path: format!("/volumes/live/{handle}"),
        };
        volumes.insert(handle.to_string(), volume.clone());

        Ok(volume)
    }

    async fn lookup_volume(&self, handle: &str) -> Result<Option<RemoteVolume>> {
        Ok(self.volumes.lock().await.get(handle).cloned())
    }

    async fn destroy_volume(&self, handle: &str) -> Result<()> {
        self.volumes.lock().await.remove(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_lookup() {
        let service = MockVolumeService::new();

        let volume = service
            .create_volume("v1", &VolumeStrategy::Empty)
            .await
            .unwrap();
        assert_eq!(volume.path, "/volumes/live/v1");

        let found = service.lookup_volume("v1").await.unwrap();
        assert_eq!(found, Some(volume));
    }

    #[tokio::test]
    async fn test_cow_requires_parent() {
        let service = MockVolumeService::new();

        let err = service
            .create_volume(
                "child",
                &VolumeStrategy::ContainerRootFs {
                    parent_handle: "absent".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeServiceError::ParentNotFound(_)));

        service
            .create_volume("parent", &VolumeStrategy::Empty)
            .await
            .unwrap();
        service
            .create_volume(
                "child",
                &VolumeStrategy::ContainerRootFs {
                    parent_handle: "parent".to_string(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_records_strategies() {
        let service = MockVolumeService::new();

        service
            .create_volume(
                "v1",
                &VolumeStrategy::Output {
                    name: "out".to_string(),
                },
            )
            .await
            .unwrap();

        let calls = service.created().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "v1");
        assert!(matches!(calls[0].1, VolumeStrategy::Output { ref name } if name == "out"));
    }
}
