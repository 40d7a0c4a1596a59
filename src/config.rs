// src/config.rs

//! Engine tuning knobs.
//!
//! This crate performs no config-file loading of its own; embedders
//! deserialize these sections from their own configuration and hand them to
//! [`crate::engine::Engine`]. Semantic validation lives here so every
//! embedder gets the same checks.

use std::time::Duration;

use serde::Deserialize;

use crate::errors::{Result, TaskloomError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lock: LockConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.lock.validate()
    }
}

/// Behaviour of the named-mutex service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Seconds a lease lives before a crashed holder is considered gone.
    pub lease_seconds: u64,
    /// Milliseconds an acquirer waits before giving up with a lock timeout.
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 30,
            acquire_timeout_ms: 5000,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_seconds == 0 {
            return Err(TaskloomError::Validation(
                "lock.lease_seconds must be >= 1 (got 0)".to_string(),
            ));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(TaskloomError::Validation(
                "lock.acquire_timeout_ms must be >= 1 (got 0)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
