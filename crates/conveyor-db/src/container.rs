// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container rows.
//!
//! A container row is the authority for a runtime container; the runtime
//! handle is a cache of it. Rows move through `creating → created →
//! destroying`: a creating row is a reservation holding the globally
//! unique handle, a created row has a known runtime container behind it,
//! and a destroying row is waiting for the runtime object to be confirmed
//! gone before removal.

use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{DbError, Result};

/// What a container exists for. Exactly one variant is recorded per row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOwner {
    /// A step of a build plan.
    Build {
        /// Owning build.
        build_id: i64,
        /// Plan node the step executes.
        plan_id: String,
    },
    /// A version check against a resource config.
    Check {
        /// Config being checked.
        resource_config_id: i64,
    },
    /// A fetch populating a resource cache.
    Get {
        /// Cache being populated.
        resource_cache_id: i64,
        /// Step the fetch runs under.
        step_name: String,
    },
}

/// Broad container classification, recorded alongside the parentage and
/// used for lifetime policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Build step container.
    Task,
    /// Resource check container.
    Check,
    /// Resource get container.
    Get,
}

impl ContainerKind {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Task => "task",
            ContainerKind::Check => "check",
            ContainerKind::Get => "get",
        }
    }
}

impl ContainerOwner {
    /// The kind of container this parentage implies.
    pub fn kind(&self) -> ContainerKind {
        match self {
            ContainerOwner::Build { .. } => ContainerKind::Task,
            ContainerOwner::Check { .. } => ContainerKind::Check,
            ContainerOwner::Get { .. } => ContainerKind::Get,
        }
    }

    fn columns(&self) -> (Option<i64>, Option<String>, Option<i64>, Option<i64>, String) {
        match self {
            ContainerOwner::Build { build_id, plan_id } => {
                (Some(*build_id), Some(plan_id.clone()), None, None, String::new())
            }
            ContainerOwner::Check { resource_config_id } => {
                (None, None, Some(*resource_config_id), None, String::new())
            }
            ContainerOwner::Get {
                resource_cache_id,
                step_name,
            } => (None, None, None, Some(*resource_cache_id), step_name.clone()),
        }
    }
}

/// A container reservation: the row exists and holds the handle, but no
/// runtime container is known to exist yet.
#[derive(Debug)]
pub struct CreatingContainer {
    id: i64,
    handle: String,
    worker_name: String,
    pool: PgPool,
}

impl CreatingContainer {
    /// Row id; also the key of the creation lock.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Globally unique handle, stable across states.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Worker the container is reserved on.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Transition the row to created once the runtime container exists.
    pub async fn created(self) -> Result<CreatedContainer> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE containers SET state = 'created'
            WHERE id = $1 AND state IN ('creating', 'created')
            RETURNING id
            "#,
        )
        .bind(self.id)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            return Err(DbError::ContainerDisappeared(self.handle));
        }

        tracing::debug!(handle = %self.handle, "Container created");

        Ok(CreatedContainer {
            id: self.id,
            handle: self.handle,
            worker_name: self.worker_name,
            pool: self.pool,
        })
    }
}

/// A container whose runtime object is known to exist.
#[derive(Debug)]
pub struct CreatedContainer {
    id: i64,
    handle: String,
    worker_name: String,
    pool: PgPool,
}

impl CreatedContainer {
    /// Row id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Globally unique handle.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Worker the container lives on.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Transition the row to destroying. The row is removed only once the
    /// runtime object is confirmed gone.
    pub async fn destroying(self) -> Result<()> {
        let updated: Option<i64> = sqlx::query_scalar(
            "UPDATE containers SET state = 'destroying' WHERE id = $1 RETURNING id",
        )
        .bind(self.id)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            return Err(DbError::ContainerDisappeared(self.handle));
        }

        Ok(())
    }
}

/// Repository for container rows.
pub struct ContainerRepository {
    pool: PgPool,
}

impl ContainerRepository {
    /// Create a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find the container for an owner on a worker, in whichever lifecycle
    /// phase it is in. At most one of the two results is `Some`.
    pub async fn find_container(
        &self,
        worker_name: &str,
        team_id: Option<i64>,
        owner: &ContainerOwner,
    ) -> Result<(Option<CreatingContainer>, Option<CreatedContainer>)> {
        let (build_id, plan_id, config_id, cache_id, step_name) = owner.columns();

        let row: Option<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT id, handle, state FROM containers
            WHERE worker_name = $1
              AND team_id IS NOT DISTINCT FROM $2
              AND build_id IS NOT DISTINCT FROM $3
              AND plan_id IS NOT DISTINCT FROM $4
              AND resource_config_id IS NOT DISTINCT FROM $5
              AND resource_cache_id IS NOT DISTINCT FROM $6
              AND step_name = $7
              AND state IN ('creating', 'created')
            "#,
        )
        .bind(worker_name)
        .bind(team_id)
        .bind(build_id)
        .bind(plan_id)
        .bind(config_id)
        .bind(cache_id)
        .bind(&step_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((id, handle, state)) if state == "creating" => Ok((
                Some(CreatingContainer {
                    id,
                    handle,
                    worker_name: worker_name.to_string(),
                    pool: self.pool.clone(),
                }),
                None,
            )),
            Some((id, handle, _)) => Ok((
                None,
                Some(CreatedContainer {
                    id,
                    handle,
                    worker_name: worker_name.to_string(),
                    pool: self.pool.clone(),
                }),
            )),
            None => Ok((None, None)),
        }
    }

    /// Reserve a container for an owner on a worker, assigning a fresh
    /// handle. A racing peer's reservation surfaces as
    /// [`DbError::SafeRetryFindOrCreate`]; the caller re-finds and
    /// observes the winner's row.
    pub async fn create_container(
        &self,
        worker_name: &str,
        team_id: Option<i64>,
        owner: &ContainerOwner,
    ) -> Result<CreatingContainer> {
        let (build_id, plan_id, config_id, cache_id, step_name) = owner.columns();
        let handle = Uuid::new_v4().to_string();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO containers (
                handle, worker_name, team_id, state,
                build_id, plan_id, resource_config_id, resource_cache_id,
                step_name, meta_type
            ) VALUES ($1, $2, $3, 'creating', $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&handle)
        .bind(worker_name)
        .bind(team_id)
        .bind(build_id)
        .bind(plan_id)
        .bind(config_id)
        .bind(cache_id)
        .bind(&step_name)
        .bind(owner.kind().as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::safe_retry)?;

        tracing::debug!(
            handle = %handle,
            worker = %worker_name,
            kind = %owner.kind().as_str(),
            "Reserved container"
        );

        Ok(CreatingContainer {
            id,
            handle,
            worker_name: worker_name.to_string(),
            pool: self.pool.clone(),
        })
    }

    /// Look up a created container by handle.
    pub async fn find_created_by_handle(
        &self,
        handle: &str,
        team_id: Option<i64>,
    ) -> Result<Option<CreatedContainer>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, worker_name FROM containers
            WHERE handle = $1
              AND team_id IS NOT DISTINCT FROM $2
              AND state = 'created'
            "#,
        )
        .bind(handle)
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, worker_name)| CreatedContainer {
            id,
            handle: handle.to_string(),
            worker_name,
            pool: self.pool.clone(),
        }))
    }

    /// Persist post-creation metadata: the user the container runs as, the
    /// resolved resource type version, and the lifetime. A `None` lifetime
    /// means expiry is governed by subsequent steps.
    pub async fn update_placement(
        &self,
        container_id: i64,
        resolved_user: &str,
        resource_type_version: Option<&serde_json::Value>,
        lifetime: Option<Duration>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE containers SET
                resolved_user = $2,
                resource_type_version = $3,
                expires_at = CASE WHEN $4::DOUBLE PRECISION IS NULL THEN NULL
                                  ELSE NOW() + make_interval(secs => $4) END
            WHERE id = $1
            "#,
        )
        .bind(container_id)
        .bind(resolved_user)
        .bind(resource_type_version.map(|v| v.to_string()))
        .bind(lifetime.map(|d| d.as_secs() as f64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a destroying container row once its runtime object is
    /// confirmed gone.
    pub async fn remove(&self, handle: &str) -> Result<()> {
        sqlx::query("DELETE FROM containers WHERE handle = $1 AND state = 'destroying'")
            .bind(handle)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_kind() {
        let build = ContainerOwner::Build {
            build_id: 1,
            plan_id: "p".to_string(),
        };
        assert_eq!(build.kind(), ContainerKind::Task);

        let check = ContainerOwner::Check {
            resource_config_id: 2,
        };
        assert_eq!(check.kind(), ContainerKind::Check);

        let get = ContainerOwner::Get {
            resource_cache_id: 3,
            step_name: "fetch".to_string(),
        };
        assert_eq!(get.kind(), ContainerKind::Get);
    }

    #[test]
    fn test_owner_columns_are_exclusive() {
        let (build_id, plan_id, config_id, cache_id, _) = ContainerOwner::Check {
            resource_config_id: 7,
        }
        .columns();
        assert!(build_id.is_none());
        assert!(plan_id.is_none());
        assert_eq!(config_id, Some(7));
        assert!(cache_id.is_none());
    }
}
