// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker registry and lifecycle state machine.
//!
//! Workers register and heartbeat through here, and drain through the
//! landing/retiring states without interrupting in-flight work. A worker
//! that stops heartbeating is stalled by the background sweep; a stalled
//! worker recovers by re-registering or heartbeating again.
//!
//! ```text
//!                 save/heartbeat
//!        ┌─────────────────────────────┐
//!        ▼                             │
//!   ┌─────────┐  expires_at < now  ┌───┴─────┐
//!   │ RUNNING │───────────────────►│ STALLED │
//!   └──┬───┬──┘                    └─────────┘
//! land │   │ retire
//!      ▼   ▼
//! ┌─────────┐ no running builds ┌────────┐
//! │ LANDING │──────────────────►│ LANDED │
//! └─────────┘                   └────────┘
//! ┌──────────┐ no running builds
//! │ RETIRING │──────────────────► row removed
//! └──────────┘
//! ```
//!
//! "No running builds" means no container on the worker belongs to a build
//! in pending or started status; terminal build statuses never block drain.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::base_resource_type::BaseResourceType;
use crate::error::{DbError, Result};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Registered and heartbeating.
    Running,
    /// Missed its heartbeat deadline; runtime address cleared.
    Stalled,
    /// Draining for a temporary stop.
    Landing,
    /// Drained; waiting to come back.
    Landed,
    /// Draining for permanent removal.
    Retiring,
}

impl WorkerState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Stalled => "stalled",
            WorkerState::Landing => "landing",
            WorkerState::Landed => "landed",
            WorkerState::Retiring => "retiring",
        }
    }
}

impl std::str::FromStr for WorkerState {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(WorkerState::Running),
            "stalled" => Ok(WorkerState::Stalled),
            "landing" => Ok(WorkerState::Landing),
            "landed" => Ok(WorkerState::Landed),
            "retiring" => Ok(WorkerState::Retiring),
            other => Err(DbError::Database(sqlx::Error::Decode(
                format!("unknown worker state: {other}").into(),
            ))),
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource type a worker provides natively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResourceType {
    /// Type name (e.g. `git`).
    pub name: String,
    /// Worker-local image for the type.
    pub image: String,
    /// Implementation version.
    pub version: String,
}

/// Registration payload submitted by a worker.
///
/// The state field lets a worker restarted mid-drain re-register in its
/// drain state instead of silently resuming; fresh registrations use
/// [`WorkerState::Running`].
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Unique worker name.
    pub name: String,
    /// Container runtime endpoint.
    pub runtime_addr: Option<String>,
    /// Volume service endpoint.
    pub volumes_addr: String,
    /// Proxy URL injected into containers as `http_proxy`.
    pub http_proxy_url: String,
    /// Proxy URL injected into containers as `https_proxy`.
    pub https_proxy_url: String,
    /// Proxy exclusion list injected into containers as `no_proxy`.
    pub no_proxy: String,
    /// Containers currently active on the worker.
    pub active_containers: i32,
    /// Base resource types the worker can run.
    pub resource_types: Vec<WorkerResourceType>,
    /// Platform label (e.g. `linux`).
    pub platform: String,
    /// Placement tags.
    pub tags: Vec<String>,
    /// Unix timestamp of the worker process start.
    pub start_time: i64,
    /// Reported lifecycle state.
    pub state: WorkerState,
}

/// A worker row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    /// Unique worker name.
    pub name: String,
    /// Container runtime endpoint; `None` exactly while stalled or landed.
    pub runtime_addr: Option<String>,
    /// Volume service endpoint.
    pub volumes_addr: String,
    /// Proxy URL for containers.
    pub http_proxy_url: String,
    /// Proxy URL for containers.
    pub https_proxy_url: String,
    /// Proxy exclusion list for containers.
    pub no_proxy: String,
    /// Containers currently active on the worker.
    pub active_containers: i32,
    /// Base resource types the worker can run.
    pub resource_types: Vec<WorkerResourceType>,
    /// Platform label.
    pub platform: String,
    /// Placement tags.
    pub tags: Vec<String>,
    /// Owning team; `None` means cluster-wide.
    pub team_id: Option<i64>,
    /// Unix timestamp of the worker process start.
    pub start_time: i64,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Heartbeat deadline; `None` means the worker never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// Time since the worker process started. Saturates at zero when the
    /// reported start time is in the future.
    pub fn uptime(&self) -> Duration {
        let secs = Utc::now().timestamp() - self.start_time;
        Duration::from_secs(secs.max(0) as u64)
    }
}

type WorkerRow = (
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    i32,
    String,
    Vec<String>,
    Option<i64>,
    i64,
    String,
    Option<DateTime<Utc>>,
);

const WORKER_COLUMNS: &str = "name, runtime_addr, volumes_addr, http_proxy_url, \
     https_proxy_url, no_proxy, active_containers, platform, tags, team_id, \
     start_time, state, expires_at";

/// Workers blocked from finishing a drain: those with a container whose
/// owning build is still pending or started.
const WORKERS_WITH_RUNNING_BUILDS: &str = "SELECT DISTINCT c.worker_name
     FROM containers c
     JOIN builds b ON c.build_id = b.id
     WHERE b.status IN ('pending', 'started')";

/// Registry for worker rows and their lifecycle transitions.
pub struct WorkerRegistry {
    pool: PgPool,
}

impl WorkerRegistry {
    /// Create a new registry.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a cluster-wide worker, upserting its row and reconciling
    /// its base resource types. A TTL of zero means the worker never
    /// expires.
    pub async fn save_worker(&self, spec: &WorkerSpec, ttl: Duration) -> Result<Worker> {
        self.save(spec, None, ttl).await
    }

    /// Register a team-scoped worker. Fails with
    /// [`DbError::WorkerTeamMismatch`] when the row is already owned by a
    /// different team.
    pub async fn save_team_worker(
        &self,
        spec: &WorkerSpec,
        team_id: i64,
        ttl: Duration,
    ) -> Result<Worker> {
        self.save(spec, Some(team_id), ttl).await
    }

    async fn save(&self, spec: &WorkerSpec, team_id: Option<i64>, ttl: Duration) -> Result<Worker> {
        let mut tx = self.pool.begin().await?;

        let existing_team: Option<Option<i64>> =
            sqlx::query_scalar("SELECT team_id FROM workers WHERE name = $1")
                .bind(&spec.name)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(Some(owner)) = existing_team
            && Some(owner) != team_id
        {
            return Err(DbError::WorkerTeamMismatch);
        }

        sqlx::query(
            r#"
            INSERT INTO workers (
                name, runtime_addr, volumes_addr, http_proxy_url,
                https_proxy_url, no_proxy, active_containers, platform, tags,
                team_id, start_time, state, expires_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                CASE WHEN $13 = 0 THEN NULL
                     ELSE NOW() + make_interval(secs => $13) END
            )
            ON CONFLICT (name) DO UPDATE SET
                runtime_addr = EXCLUDED.runtime_addr,
                volumes_addr = EXCLUDED.volumes_addr,
                http_proxy_url = EXCLUDED.http_proxy_url,
                https_proxy_url = EXCLUDED.https_proxy_url,
                no_proxy = EXCLUDED.no_proxy,
                active_containers = EXCLUDED.active_containers,
                platform = EXCLUDED.platform,
                tags = EXCLUDED.tags,
                team_id = EXCLUDED.team_id,
                start_time = EXCLUDED.start_time,
                state = EXCLUDED.state,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.runtime_addr)
        .bind(&spec.volumes_addr)
        .bind(&spec.http_proxy_url)
        .bind(&spec.https_proxy_url)
        .bind(&spec.no_proxy)
        .bind(spec.active_containers)
        .bind(&spec.platform)
        .bind(&spec.tags)
        .bind(team_id)
        .bind(spec.start_time)
        .bind(spec.state.as_str())
        .bind(ttl.as_secs() as f64)
        .execute(&mut *tx)
        .await?;

        // Reconcile the base-type join and the self-reported mirror to
        // exactly the submitted list.
        let mut kept_ids: Vec<i64> = Vec::with_capacity(spec.resource_types.len());

        for resource_type in &spec.resource_types {
            let base = BaseResourceType {
                name: resource_type.name.clone(),
                image: resource_type.image.clone(),
                version: resource_type.version.clone(),
            };
            let used = base.find_or_create(&mut tx).await?;

            sqlx::query(
                r#"
                INSERT INTO worker_base_resource_types (worker_name, base_resource_type_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&spec.name)
            .bind(used.id)
            .execute(&mut *tx)
            .await?;

            kept_ids.push(used.id);
        }

        sqlx::query(
            r#"
            DELETE FROM worker_base_resource_types
            WHERE worker_name = $1 AND NOT (base_resource_type_id = ANY($2))
            "#,
        )
        .bind(&spec.name)
        .bind(&kept_ids)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM worker_resource_types WHERE worker_name = $1")
            .bind(&spec.name)
            .execute(&mut *tx)
            .await?;

        for resource_type in &spec.resource_types {
            sqlx::query(
                r#"
                INSERT INTO worker_resource_types (worker_name, type, image, version)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&spec.name)
            .bind(&resource_type.name)
            .bind(&resource_type.image)
            .bind(&resource_type.version)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            worker = %spec.name,
            state = %spec.state,
            team_id = ?team_id,
            "Saved worker"
        );

        self.require_worker(&spec.name).await
    }

    /// Look up a worker by name.
    pub async fn get_worker(&self, name: &str) -> Result<Option<Worker>> {
        let query = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE name = $1");
        let row: Option<WorkerRow> = sqlx::query_as(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// List every worker.
    pub async fn workers(&self) -> Result<Vec<Worker>> {
        let query = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY name");
        let rows: Vec<WorkerRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;

        let mut workers = Vec::with_capacity(rows.len());
        for row in rows {
            workers.push(self.hydrate(row).await?);
        }

        Ok(workers)
    }

    /// Refresh the heartbeat deadline and active-container count.
    ///
    /// A stalled worker recovers to running with its runtime address
    /// re-populated; landing, landed, and retiring are never regressed by
    /// a heartbeat.
    pub async fn heartbeat_worker(&self, spec: &WorkerSpec, ttl: Duration) -> Result<Worker> {
        let updated: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE workers SET
                expires_at = CASE WHEN $2 = 0 THEN NULL
                                  ELSE NOW() + make_interval(secs => $2) END,
                active_containers = $3,
                runtime_addr = CASE WHEN state = 'stalled' THEN $4
                                    ELSE runtime_addr END,
                state = CASE WHEN state = 'stalled' THEN 'running'
                             ELSE state END
            WHERE name = $1
            RETURNING name
            "#,
        )
        .bind(&spec.name)
        .bind(ttl.as_secs() as f64)
        .bind(spec.active_containers)
        .bind(&spec.runtime_addr)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            return Err(DbError::WorkerNotPresent);
        }

        self.require_worker(&spec.name).await
    }

    /// Mark a worker as stalled, clearing its runtime address and deadline.
    pub async fn stall_worker(&self, name: &str) -> Result<Worker> {
        let updated: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE workers
            SET state = 'stalled', runtime_addr = NULL, expires_at = NULL
            WHERE name = $1
            RETURNING name
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            return Err(DbError::WorkerNotPresent);
        }

        tracing::info!(worker = %name, "Stalled worker");

        self.require_worker(name).await
    }

    /// Stall every running worker whose heartbeat deadline has passed.
    /// Returns the workers that were stalled by this pass.
    pub async fn stall_unresponsive_workers(&self) -> Result<Vec<Worker>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE workers
            SET state = 'stalled', runtime_addr = NULL, expires_at = NULL
            WHERE state = 'running'
              AND expires_at IS NOT NULL
              AND expires_at < NOW()
            RETURNING name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if !names.is_empty() {
            tracing::info!(count = names.len(), "Stalled unresponsive workers");
        }

        let mut workers = Vec::with_capacity(names.len());
        for name in names {
            workers.push(self.require_worker(&name).await?);
        }

        Ok(workers)
    }

    /// Begin draining a worker for a temporary stop. Landing a worker that
    /// has already landed is a no-op.
    pub async fn land_worker(&self, name: &str) -> Result<Worker> {
        let updated: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE workers
            SET state = CASE WHEN state = 'landed' THEN 'landed' ELSE 'landing' END
            WHERE name = $1
            RETURNING name
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            return Err(DbError::WorkerNotPresent);
        }

        tracing::info!(worker = %name, "Landing worker");

        self.require_worker(name).await
    }

    /// Transition every landing worker with no running builds to landed.
    /// The check and the transition are one atomic statement.
    pub async fn land_finished_landing_workers(&self) -> Result<u64> {
        let query = format!(
            r#"
            UPDATE workers
            SET state = 'landed', runtime_addr = NULL, expires_at = NULL
            WHERE state = 'landing'
              AND name NOT IN ({WORKERS_WITH_RUNNING_BUILDS})
            "#
        );
        let result = sqlx::query(&query).execute(&self.pool).await?;

        if result.rows_affected() > 0 {
            tracing::info!(count = result.rows_affected(), "Landed workers");
        }

        Ok(result.rows_affected())
    }

    /// Begin draining a worker for permanent removal.
    pub async fn retire_worker(&self, name: &str) -> Result<Worker> {
        let updated: Option<String> = sqlx::query_scalar(
            "UPDATE workers SET state = 'retiring' WHERE name = $1 RETURNING name",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            return Err(DbError::WorkerNotPresent);
        }

        tracing::info!(worker = %name, "Retiring worker");

        self.require_worker(name).await
    }

    /// Delete every retiring worker with no running builds.
    pub async fn delete_finished_retiring_workers(&self) -> Result<u64> {
        let query = format!(
            r#"
            DELETE FROM workers
            WHERE state = 'retiring'
              AND name NOT IN ({WORKERS_WITH_RUNNING_BUILDS})
            "#
        );
        let result = sqlx::query(&query).execute(&self.pool).await?;

        if result.rows_affected() > 0 {
            tracing::info!(count = result.rows_affected(), "Deleted retired workers");
        }

        Ok(result.rows_affected())
    }

    /// Remove a worker row unconditionally.
    pub async fn delete_worker(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        tracing::info!(worker = %name, "Deleted worker");

        Ok(())
    }

    async fn require_worker(&self, name: &str) -> Result<Worker> {
        self.get_worker(name)
            .await?
            .ok_or(DbError::WorkerNotPresent)
    }

    async fn hydrate(&self, row: WorkerRow) -> Result<Worker> {
        let (
            name,
            runtime_addr,
            volumes_addr,
            http_proxy_url,
            https_proxy_url,
            no_proxy,
            active_containers,
            platform,
            tags,
            team_id,
            start_time,
            state,
            expires_at,
        ) = row;

        let resource_types: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT type, image, version
            FROM worker_resource_types
            WHERE worker_name = $1
            ORDER BY type
            "#,
        )
        .bind(&name)
        .fetch_all(&self.pool)
        .await?;

        Ok(Worker {
            name,
            runtime_addr,
            volumes_addr,
            http_proxy_url,
            https_proxy_url,
            no_proxy,
            active_containers,
            resource_types: resource_types
                .into_iter()
                .map(|(name, image, version)| WorkerResourceType {
                    name,
                    image,
                    version,
                })
                .collect(),
            platform,
            tags,
            team_id,
            start_time,
            state: state.parse()?,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            WorkerState::Running,
            WorkerState::Stalled,
            WorkerState::Landing,
            WorkerState::Landed,
            WorkerState::Retiring,
        ] {
            assert_eq!(state.as_str().parse::<WorkerState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        assert!("parked".parse::<WorkerState>().is_err());
    }

    #[test]
    fn test_uptime_saturates_at_zero() {
        let worker = Worker {
            name: "w1".to_string(),
            runtime_addr: Some("addr".to_string()),
            volumes_addr: "vols".to_string(),
            http_proxy_url: String::new(),
            https_proxy_url: String::new(),
            no_proxy: String::new(),
            active_containers: 0,
            resource_types: vec![],
            platform: "linux".to_string(),
            tags: vec![],
            team_id: None,
            start_time: Utc::now().timestamp() + 3600,
            state: WorkerState::Running,
            expires_at: None,
        };

        assert_eq!(worker.uptime(), Duration::ZERO);
    }
}
