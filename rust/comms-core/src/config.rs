// rust/comms-core/src/config.rs

//! Configuration management for communicator sessions.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CommsError, Result};

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub cluster: ClusterConfig,
}

/// Session bootstrap and teardown options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Request the direct point-to-point transport by default.
    pub p2p: bool,
    /// Upper bound on gathering all bootstrap confirmations.
    pub bootstrap_timeout_ms: u64,
    /// Upper bound on each worker's teardown.
    pub teardown_timeout_ms: u64,
}

// Transport substrate options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    // Timeout for a single collective or point-to-point operation.
    pub op_timeout_ms: u64,
    // Whether the direct transport can be established on this host.
    pub p2p_available: bool,
}

// Local cluster options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    // Number of workers to start.
    pub workers: usize,
    // Worker addresses are `{address_prefix}{index}`.
    pub address_prefix: String,
    // Queued tasks per worker before submit waits.
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            p2p: false,
            bootstrap_timeout_ms: 30_000,
            teardown_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: 10_000,
            p2p_available: true,
        }
    }
}

impl TransportConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            address_prefix: "local://worker-".to_string(),
            mailbox_capacity: 64,
        }
    }
}

impl FromStr for CommsConfig {
    type Err = CommsError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CommsError::config_with_source("failed to parse TOML config", e))
    }
}

impl CommsConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CommsError::config_with_source(
                format!("failed to read config file {}", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `COMMS_` followed by the
    // section and field name. For example:
    // - `COMMS_SESSION_P2P` overrides `session.p2p`
    // - `COMMS_TRANSPORT_OP_TIMEOUT_MS` overrides `transport.op_timeout_ms`
    // - `COMMS_CLUSTER_WORKERS` overrides `cluster.workers`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Session overrides
        if let Ok(val) = std::env::var("COMMS_SESSION_P2P") {
            if let Ok(v) = val.parse() {
                self.session.p2p = v;
            }
        }
        if let Ok(val) = std::env::var("COMMS_SESSION_BOOTSTRAP_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.session.bootstrap_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("COMMS_SESSION_TEARDOWN_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.session.teardown_timeout_ms = v;
            }
        }

        // Transport overrides
        if let Ok(val) = std::env::var("COMMS_TRANSPORT_OP_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.transport.op_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("COMMS_TRANSPORT_P2P_AVAILABLE") {
            if let Ok(v) = val.parse() {
                self.transport.p2p_available = v;
            }
        }

        // Cluster overrides
        if let Ok(val) = std::env::var("COMMS_CLUSTER_WORKERS") {
            if let Ok(v) = val.parse() {
                self.cluster.workers = v;
            }
        }
        if let Ok(val) = std::env::var("COMMS_CLUSTER_ADDRESS_PREFIX") {
            self.cluster.address_prefix = val;
        }
        if let Ok(val) = std::env::var("COMMS_CLUSTER_MAILBOX_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.cluster.mailbox_capacity = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.session.bootstrap_timeout_ms == 0 {
            return Err(CommsError::config(
                "session.bootstrap_timeout_ms must be greater than 0",
            ));
        }
        if self.session.teardown_timeout_ms == 0 {
            return Err(CommsError::config(
                "session.teardown_timeout_ms must be greater than 0",
            ));
        }

        if self.transport.op_timeout_ms == 0 {
            return Err(CommsError::config(
                "transport.op_timeout_ms must be greater than 0",
            ));
        }

        if self.cluster.workers == 0 {
            return Err(CommsError::config("cluster.workers must be greater than 0"));
        }
        if self.cluster.address_prefix.is_empty() {
            return Err(CommsError::config(
                "cluster.address_prefix must not be empty",
            ));
        }
        if self.cluster.mailbox_capacity == 0 {
            return Err(CommsError::config(
                "cluster.mailbox_capacity must be greater than 0",
            ));
        }

        Ok(())
    }
}
