// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for container placement.

use thiserror::Error;

/// Placement errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Data-layer operation failed.
    #[error("Data layer error: {0}")]
    Db(#[from] conveyor_db::DbError),

    /// Container runtime call failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    /// Volume service call failed.
    #[error("Volume service error: {0}")]
    VolumeService(#[from] crate::volumes::VolumeServiceError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller cancelled the operation.
    #[error("operation aborted")]
    Aborted,

    /// The database records a created container but the runtime does not
    /// know its handle. The database is authoritative; this is an
    /// invariant violation requiring operator intervention.
    #[error("container in created state not found in runtime: {0}")]
    CreatedContainerNotFound(String),

    /// The database records a created volume but the volume service does
    /// not know its handle.
    #[error("volume in created state not found on worker: {0}")]
    CreatedVolumeNotFound(String),

    /// The worker has not imported the named base resource type.
    #[error("no import volume for base resource type: {0}")]
    ImportVolumeMissing(String),

    /// The worker does not provide the named resource type.
    #[error("resource type not found: {0}")]
    ResourceTypeNotFound(String),

    /// The target worker is not in the running state.
    #[error("worker is not running: {0}")]
    WorkerNotRunning(String),

    /// Image fetching failed.
    #[error("image fetch failed: {0}")]
    ImageFetch(String),
}

/// Result type using [`WorkerError`].
pub type Result<T> = std::result::Result<T, WorkerError>;
