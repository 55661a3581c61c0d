// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conveyor worker - container placement and materialization.
//!
//! This crate places containers on a single worker: it finds or creates
//! the container for an intent (build step, resource check, resource get),
//! resolves the root filesystem, mounts volumes, and hands back a
//! container that exists both in the data layer and in the worker's
//! runtime.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Scheduler (upstream)                     │
//! └─────────────────────────────────────────────────────────────┘
//!                             │ find-or-create
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               conveyor-worker (this crate)                  │
//! │  ┌────────────┐ ┌────────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │ Container  │ │   Volume   │ │  Image  │ │  Runtime/  │  │
//! │  │  Provider  │ │   Client   │ │Resolver │ │Volume mocks│  │
//! │  └────────────┘ └────────────┘ └─────────┘ └────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!        │ rows + locks                │ create/lookup/destroy
//!        ▼                             ▼
//! ┌──────────────────┐   ┌─────────────────────────────────────┐
//! │   conveyor-db    │   │ Container runtime + volume service  │
//! │   (PostgreSQL)   │   │        (remote, per worker)         │
//! └──────────────────┘   └─────────────────────────────────────┘
//! ```
//!
//! # Container lifecycle
//!
//! ```text
//!  ┌──────────┐  runtime container   ┌─────────┐  expiry / teardown
//!  │ CREATING │─────────────────────►│ CREATED │────────────────────┐
//!  └──────────┘  exists              └─────────┘                    ▼
//!   reservation,                      runtime handle          ┌────────────┐
//!   handle assigned                   known                   │ DESTROYING │
//!                                                             └────────────┘
//!                                                       row removed once the
//!                                                       runtime object is gone
//! ```
//!
//! The database row is the authority at every step; a created row whose
//! handle the runtime has lost is surfaced as an invariant violation, not
//! repaired silently.
//!
//! # Modules
//!
//! - [`container`]: the placed container handed to callers
//! - [`error`]: error types for placement operations
//! - [`image`]: root filesystem resolution (artifact, resource, base type)
//! - [`provider`]: the find-or-create protocol and its entry points
//! - [`runtime`]: container runtime client trait and mock
//! - [`volumes`]: volume service client trait, volume client, and mock

#![deny(missing_docs)]

/// The placed container handed to callers.
pub mod container;

/// Error types for placement operations.
pub mod error;

/// Root filesystem resolution.
pub mod image;

/// The find-or-create container protocol.
pub mod provider;

/// Container runtime client.
pub mod runtime;

/// Volume service client and worker-side volume orchestration.
pub mod volumes;

pub use container::{Container, VolumeMount};
pub use error::{Result, WorkerError};
pub use provider::{CancelToken, ContainerProvider, ContainerSpec};
