// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Team rows.
//!
//! Workers and containers may be scoped to a team; the rows here exist so
//! that scoping has something to reference. Team management itself lives
//! outside the core.

use sqlx::PgPool;

use crate::error::Result;

/// A team row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Team {
    /// Row id.
    pub id: i64,
    /// Unique team name.
    pub name: String,
}

/// Registry for team rows.
pub struct TeamRegistry {
    pool: PgPool,
}

impl TeamRegistry {
    /// Create a new registry.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a team, or return the existing row with this name.
    pub async fn find_or_create(&self, name: &str) -> Result<Team> {
        let team = sqlx::query_as::<_, Team>(
            r#"
            INSERT INTO teams (name)
            VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(team)
    }

    /// Look up a team by name.
    pub async fn find(&self, name: &str) -> Result<Option<Team>> {
        let team = sqlx::query_as::<_, Team>("SELECT id, name FROM teams WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(team)
    }
}
