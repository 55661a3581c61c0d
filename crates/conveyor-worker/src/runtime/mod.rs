// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime client trait.
//!
//! The runtime is a remote service addressed by a worker's runtime
//! endpoint. It is a pure execution surface: it never touches the
//! database, and the handles it knows about are assigned by the data
//! layer, not by the runtime.

mod mock;

pub use mock::MockRuntime;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// A container with this handle already exists.
    #[error("container already exists: {0}")]
    AlreadyExists(String),

    /// The runtime rejected the container spec.
    #[error("invalid container spec: {0}")]
    InvalidSpec(String),

    /// Transport-level failure talking to the runtime.
    #[error("runtime transport error: {0}")]
    Transport(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// A single bind mount handed to the runtime. Order matters: the runtime
/// applies mounts in the order given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host path of the volume on the worker.
    pub src_path: String,
    /// Path inside the container.
    pub dst_path: String,
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainerSpec {
    /// Handle assigned by the data layer; addresses the container for the
    /// rest of its life.
    pub handle: String,
    /// Root filesystem location.
    pub rootfs_path: String,
    /// Environment in `KEY=value` form, already composed and ordered.
    pub env: Vec<String>,
    /// Bind mounts in mount order.
    pub bind_mounts: Vec<BindMount>,
    /// Opaque runtime properties (`user`, `ephemeral`, ...).
    pub properties: HashMap<String, String>,
}

/// A container as known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainer {
    /// The handle the container was created under.
    pub handle: String,
    /// Properties the runtime reports for the container.
    pub properties: HashMap<String, String>,
}

/// Client for a worker's container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container. Fails if the handle already exists.
    async fn create(&self, spec: &RuntimeContainerSpec) -> Result<RuntimeContainer>;

    /// Look up a container by handle. An unknown handle is `Ok(None)`, not
    /// an error.
    async fn lookup(&self, handle: &str) -> Result<Option<RuntimeContainer>>;

    /// Destroy a container. Destroying an unknown handle succeeds.
    async fn destroy(&self, handle: &str) -> Result<()>;
}
