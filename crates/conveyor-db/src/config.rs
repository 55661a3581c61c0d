// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the conveyor data layer.

use std::time::Duration;

/// Data-layer configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL shared by every component of the core.
    pub database_url: String,
    /// Database connection pool size.
    pub db_pool_size: u32,
    /// Interval between background sweeper passes.
    pub sweep_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CONVEYOR_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CONVEYOR_DATABASE_URL"))?;

        let db_pool_size = std::env::var("CONVEYOR_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let sweep_interval_secs: u64 = std::env::var("CONVEYOR_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            database_url,
            db_pool_size,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();

        // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
        unsafe {
            env::set_var("CONVEYOR_DATABASE_URL", "postgres://localhost/conveyor");
            env::remove_var("CONVEYOR_DB_POOL_SIZE");
            env::remove_var("CONVEYOR_SWEEP_INTERVAL_SECS");
        }

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/conveyor");
        assert_eq!(config.db_pool_size, 20);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();

        // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
        unsafe {
            env::set_var("CONVEYOR_DATABASE_URL", "postgres://db:5432/prod");
            env::set_var("CONVEYOR_DB_POOL_SIZE", "50");
            env::set_var("CONVEYOR_SWEEP_INTERVAL_SECS", "5");
        }

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://db:5432/prod");
        assert_eq!(config.db_pool_size, 50);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));

        // SAFETY: still under ENV_MUTEX
        unsafe {
            env::remove_var("CONVEYOR_DB_POOL_SIZE");
            env::remove_var("CONVEYOR_SWEEP_INTERVAL_SECS");
        }
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();

        // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
        unsafe {
            env::remove_var("CONVEYOR_DATABASE_URL");
        }

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::MissingEnvVar("CONVEYOR_DATABASE_URL"))
        ));
    }
}
