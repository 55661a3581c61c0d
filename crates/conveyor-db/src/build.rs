// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build rows.
//!
//! Builds are produced by the upstream scheduler; the core only needs their
//! status to decide whether a worker may finish draining, and their ids to
//! anchor container parentage and cache uses.

use sqlx::PgPool;

use crate::error::{DbError, Result};

/// Build status as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// Queued, not yet picked up.
    Pending,
    /// Currently executing.
    Started,
    /// Cancelled by a user.
    Aborted,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failing step.
    Failed,
    /// Finished with an infrastructure error.
    Errored,
}

impl BuildStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Aborted => "aborted",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
        }
    }

    /// Whether this status blocks worker drain. Only pending and started
    /// builds keep a worker's containers counted as running work.
    pub fn is_running(&self) -> bool {
        matches!(self, BuildStatus::Pending | BuildStatus::Started)
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "aborted" => Ok(BuildStatus::Aborted),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            other => Err(DbError::Database(sqlx::Error::Decode(
                format!("unknown build status: {other}").into(),
            ))),
        }
    }
}

/// A build row.
#[derive(Debug, Clone)]
pub struct Build {
    /// Row id.
    pub id: i64,
    /// Owning team.
    pub team_id: i64,
    /// Current status.
    pub status: BuildStatus,
}

/// Registry for build rows.
pub struct BuildRegistry {
    pool: PgPool,
}

impl BuildRegistry {
    /// Create a new registry.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pending build for a team.
    pub async fn create(&self, team_id: i64) -> Result<Build> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO builds (team_id, status) VALUES ($1, 'pending') RETURNING id")
                .bind(team_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(Build {
            id,
            team_id,
            status: BuildStatus::Pending,
        })
    }

    /// Record a status reported by the scheduler.
    pub async fn save_status(&self, build_id: i64, status: BuildStatus) -> Result<()> {
        sqlx::query("UPDATE builds SET status = $2 WHERE id = $1")
            .bind(build_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Look up a build by id.
    pub async fn find(&self, build_id: i64) -> Result<Option<Build>> {
        let row: Option<(i64, i64, String)> =
            sqlx::query_as("SELECT id, team_id, status FROM builds WHERE id = $1")
                .bind(build_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((id, team_id, status)) => Ok(Some(Build {
                id,
                team_id,
                status: status.parse()?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Started,
            BuildStatus::Aborted,
            BuildStatus::Succeeded,
            BuildStatus::Failed,
            BuildStatus::Errored,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_only_pending_and_started_block_drain() {
        assert!(BuildStatus::Pending.is_running());
        assert!(BuildStatus::Started.is_running());
        assert!(!BuildStatus::Aborted.is_running());
        assert!(!BuildStatus::Succeeded.is_running());
        assert!(!BuildStatus::Failed.is_running());
        assert!(!BuildStatus::Errored.is_running());
    }
}
