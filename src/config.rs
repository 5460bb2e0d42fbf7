//! Configuration types for gridtune.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bundler::{Algorithm, TuningProfile};

/// Whether each node channel gets its own bundler or all share one.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One independent bundler per channel
    #[default]
    #[serde(rename = "node")]
    #[value(name = "node")]
    PerNode,
    /// A single bundler shared by every channel of the driver
    Global,
}

/// Load-balancing configuration of a driver.
///
/// This struct can be deserialized from TOML, YAML, JSON, or environment variables
/// using figment.
///
/// ```toml
/// algorithm = "autotuned"
/// scope = "node"
///
/// [profile]
/// initial_size = 10
/// min_samples_to_analyse = 100
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoadBalancingConfig {
    /// Algorithm used for new bundlers (default: proportional)
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Bundler sharing scope (default: node)
    #[serde(default)]
    pub scope: Scope,

    /// Tuning knobs, see [`TuningProfile`]
    #[serde(default)]
    pub profile: TuningProfile,

    /// Prefix of the Prometheus metric names (default: "gridtune")
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,

    /// Root directory of the file state store (default: none, state is not persisted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_dir: Option<PathBuf>,
}

fn default_metrics_prefix() -> String {
    "gridtune".to_string()
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            scope: Scope::default(),
            profile: TuningProfile::default(),
            metrics_prefix: default_metrics_prefix(),
            persistence_dir: None,
        }
    }
}

impl LoadBalancingConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }
}
