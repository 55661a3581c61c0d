// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container runtime for testing.
//!
//! Keeps containers in memory and records every create call so tests can
//! assert on how many runtime containers were actually created and with
//! what spec.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ContainerRuntime, Result, RuntimeContainer, RuntimeContainerSpec, RuntimeError};

/// Mock runtime for testing.
#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, RuntimeContainer>>,
    create_calls: Mutex<Vec<RuntimeContainerSpec>>,
}

impl MockRuntime {
    /// Create an empty mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Specs of every create call so far, in call order.
    pub async fn created_specs(&self) -> Vec<RuntimeContainerSpec> {
        self.create_calls.lock().await.clone()
    }

    /// Number of create calls so far.
    pub async fn create_count(&self) -> usize {
        self.create_calls.lock().await.len()
    }

    /// Forget a container, simulating runtime-side loss of state.
    pub async fn forget(&self, handle: &str) {
        self.containers.lock().await.remove(handle);
    }

    /// Insert a container directly, simulating one created elsewhere.
    pub async fn adopt(&self, container: RuntimeContainer) {
        self.containers
            .lock()
            .await
            .insert(container.handle.clone(), container);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &RuntimeContainerSpec) -> Result<RuntimeContainer> {
        let mut containers = self.containers.lock().await;
        if containers.contains_key(&spec.handle) {
            return Err(RuntimeError::AlreadyExists(spec.handle.clone()));
        }

        self.create_calls.lock().await.push(spec.clone());

        let container = RuntimeContainer {
            handle: spec.handle.clone(),
            properties: spec.properties.clone(),
        };
        containers.insert(spec.handle.clone(), container.clone());

        Ok(container)
    }

    async fn lookup(&self, handle: &str) -> Result<Option<RuntimeContainer>> {
        Ok(self.containers.lock().await.get(handle).cloned())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.containers.lock().await.remove(handle);
        Ok(())
    }
}
