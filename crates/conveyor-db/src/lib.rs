// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conveyor data layer - shared transactional state for the orchestration
//! core.
//!
//! Everything the cluster agrees on lives in one relational database:
//! worker lifecycle, canonical resource configs and caches with their use
//! pinning, container and volume records, and the advisory locks that
//! serialize find-or-create critical sections. The database row is the
//! authority for every runtime-visible object; the runtime handle is a
//! cache of it, and reconciliation on discrepancy favors the database.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Schedulers (upstream)                        │
//! └──────────────────────────────────────────────────────────────────┘
//!                │                                  │
//!                ▼                                  ▼
//! ┌──────────────────────────┐      ┌──────────────────────────────┐
//! │   conveyor-worker        │      │   conveyor-db (this crate)   │
//! │   container placement    │─────►│  locks · configs · caches    │
//! └──────────────────────────┘      │  workers · containers ·      │
//!                │                  │  volumes · GC · sweepers     │
//!                ▼                  └──────────────────────────────┘
//! ┌──────────────────────────┐                     │
//! │ Container runtime +      │                     ▼
//! │ volume service (remote)  │      ┌──────────────────────────────┐
//! └──────────────────────────┘      │          PostgreSQL          │
//!                                   └──────────────────────────────┘
//! ```
//!
//! # Worker state machine
//!
//! | From | Event | To |
//! |------|-------|----|
//! | – | save | running |
//! | stalled | save / heartbeat | running |
//! | running | heartbeat | running (deadline refreshed) |
//! | running | deadline passes | stalled |
//! | running | land | landing |
//! | landing | no running builds | landed |
//! | landed | land | landed |
//! | running | retire | retiring |
//! | retiring | no running builds | row removed |
//!
//! Heartbeats never regress landing, landed, or retiring.
//!
//! # Find-or-create
//!
//! Resource configs and caches are de-duplicated cluster-wide. Identity is
//! hashed over canonical JSON; creation runs under an advisory lock and
//! inside a transaction envelope that restarts from the top when a racing
//! peer wins a constraint (the safe-retry contract). Whoever holds the
//! lock completes creation before any contender observes the row.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CONVEYOR_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `CONVEYOR_DB_POOL_SIZE` | No | `20` | Connection pool size |
//! | `CONVEYOR_SWEEP_INTERVAL_SECS` | No | `30` | Background sweep interval |

#![deny(missing_docs)]

/// Central registry of base resource types reported by workers.
pub mod base_resource_type;

/// Build rows and statuses, as reported by the upstream scheduler.
pub mod build;

/// Configuration loaded from environment variables.
pub mod config;

/// Container rows and their two-phase lifecycle.
pub mod container;

/// Error types and the safe-retry classification.
pub mod error;

/// Garbage collection passes.
pub mod gc;

/// Canonical JSON and identity hashing.
pub mod hashing;

/// Cluster-wide named advisory locks.
pub mod lock;

/// Database migrations.
pub mod migrations;

/// Canonical resource config rows and their use pinning.
pub mod resource_config;

/// Canonical resource cache rows and their use pinning.
pub mod resource_cache;

/// Background sweepers for worker lifecycle and garbage collection.
pub mod sweeper;

/// Team rows.
pub mod team;

/// Volume rows and their two-phase lifecycle.
pub mod volume;

/// Worker registry and lifecycle state machine.
pub mod worker;

pub use config::Config;
pub use error::{DbError, Result};
pub use lock::{Lock, LockFactory};
