// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Maximum pooled database connections
    pub db_max_connections: u32,
    /// Public base URL that VCS providers deliver webhooks to. Only needed
    /// when the embedding front end registers a VCS gateway.
    pub webhook_base_url: Option<String>,
    /// Bound on every VCS provider call
    pub vcs_timeout: Duration,
    /// How often the runner monitor sweeps
    pub runner_monitor_interval: Duration,
    /// Silence after which an idle or busy runner becomes unknown
    pub runner_ping_timeout: Duration,
    /// Time in unknown after which a runner becomes errored
    pub runner_unknown_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STRATUS_DATABASE_URL`: `postgres://...` or `sqlite:...`
    ///
    /// Optional:
    /// - `STRATUS_WEBHOOK_BASE_URL`: e.g. `https://stratus.example.com`,
    ///   validated when set
    ///
    /// Optional (with defaults):
    /// - `STRATUS_DB_MAX_CONNECTIONS` (10)
    /// - `STRATUS_VCS_TIMEOUT_SECS` (30)
    /// - `STRATUS_RUNNER_MONITOR_INTERVAL_SECS` (10)
    /// - `STRATUS_RUNNER_PING_TIMEOUT_SECS` (30)
    /// - `STRATUS_RUNNER_UNKNOWN_TIMEOUT_SECS` (300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STRATUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STRATUS_DATABASE_URL"))?;

        let webhook_base_url = match std::env::var("STRATUS_WEBHOOK_BASE_URL") {
            Ok(url) if url.starts_with("http://") || url.starts_with("https://") => {
                Some(url.trim_end_matches('/').to_string())
            }
            Ok(_) => {
                return Err(ConfigError::Invalid(
                    "STRATUS_WEBHOOK_BASE_URL",
                    "must be an http(s) URL",
                ));
            }
            Err(_) => None,
        };

        let db_max_connections: u32 = std::env::var("STRATUS_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "STRATUS_DB_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_url,
            db_max_connections,
            webhook_base_url,
            vcs_timeout: secs_from_env("STRATUS_VCS_TIMEOUT_SECS", 30)?,
            runner_monitor_interval: secs_from_env("STRATUS_RUNNER_MONITOR_INTERVAL_SECS", 10)?,
            runner_ping_timeout: secs_from_env("STRATUS_RUNNER_PING_TIMEOUT_SECS", 30)?,
            runner_unknown_timeout: secs_from_env("STRATUS_RUNNER_UNKNOWN_TIMEOUT_SECS", 300)?,
        })
    }
}

fn secs_from_env(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs = match std::env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(key, "must be a positive number of seconds"))?,
        Err(_) => default,
    };
    if secs == 0 {
        return Err(ConfigError::Invalid(
            key,
            "must be a positive number of seconds",
        ));
    }
    Ok(Duration::from_secs(secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
