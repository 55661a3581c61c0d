// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the conveyor data layer.

use thiserror::Error;

/// Data-layer errors.
///
/// The sentinel variants are part of the interface contract: callers match
/// on them to distinguish retryable races from invariant violations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A find-or-create lost a race against a concurrent peer and the
    /// surrounding transaction must be abandoned and restarted from the top.
    /// Converges: on retry the loser observes the winner's row.
    #[error("lost a find-or-create race, retry from the top")]
    SafeRetryFindOrCreate,

    /// A resource cache with this identity already exists.
    #[error("resource cache already exists")]
    ResourceCacheAlreadyExists,

    /// The resource cache is still in use or was already removed.
    #[error("resource cache disappeared")]
    ResourceCacheDisappeared,

    /// The named worker has no row.
    #[error("worker not present")]
    WorkerNotPresent,

    /// Re-registration attempted with a different team than the owner.
    #[error("worker is owned by another team")]
    WorkerTeamMismatch,

    /// The named resource type is neither a base type nor defined by the
    /// submitted pipeline resource types.
    #[error("resource type not found: {0}")]
    ResourceTypeNotFound(String),

    /// Custom resource types form a cycle through their parents.
    #[error("cyclic resource type definition: {0}")]
    CyclicResourceType(String),

    /// No registered base resource type carries this name.
    #[error("base resource type not found: {0}")]
    BaseResourceTypeNotFound(String),

    /// A container row vanished mid-transition.
    #[error("container disappeared: {0}")]
    ContainerDisappeared(String),

    /// A volume row vanished mid-transition.
    #[error("volume disappeared: {0}")]
    VolumeDisappeared(String),
}

/// Result type using [`DbError`].
pub type Result<T> = std::result::Result<T, DbError>;

const FOREIGN_KEY_VIOLATION: &str = "23503";
const UNIQUE_VIOLATION: &str = "23505";

/// Whether a database error is a foreign-key or unique violation caused by a
/// racing peer, i.e. one that maps to [`DbError::SafeRetryFindOrCreate`].
pub fn is_safe_retry(err: &sqlx::Error) -> bool {
    match err.as_database_error().and_then(|db| db.code()) {
        Some(code) => code == FOREIGN_KEY_VIOLATION || code == UNIQUE_VIOLATION,
        None => false,
    }
}

/// Map retryable constraint violations to the safe-retry sentinel, leaving
/// every other error untouched.
pub(crate) fn safe_retry(err: sqlx::Error) -> DbError {
    if is_safe_retry(&err) {
        DbError::SafeRetryFindOrCreate
    } else {
        DbError::Database(err)
    }
}
