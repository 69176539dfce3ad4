//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The operator's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The Kubernetes namespace of this operator.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// Leave ConfigMaps which are no longer generated in place instead of deleting them.
    ///
    /// Intended for migrations where component configuration is still provisioned by an
    /// external system.
    #[serde(default)]
    pub compatibility_mode: bool,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }
}
