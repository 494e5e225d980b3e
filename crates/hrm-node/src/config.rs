//! Configuration loading from TOML and environment variables.
//!
//! The node reads its configuration from:
//! 1. A TOML config file (optional)
//! 2. Environment variables (override TOML values)
//!
//! Environment variable prefix: HRM_

use std::path::Path;

use serde::{Deserialize, Serialize};

use hrm_hierarchy::HierarchyConfig;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Runtime settings of a single node.
    #[serde(default)]
    pub node: RuntimeConfig,
    /// Hierarchy tunables handed to the controller.
    #[serde(default)]
    pub hierarchy: HierarchyConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Simulated network used by the binary.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Runtime settings of a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Interval of the controller timer tick in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Poll interval of the coordinator address accessor in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "hrm_hierarchy=debug").
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output JSON-formatted logs.
    #[serde(default)]
    pub json_format: bool,
}

/// Shape of the simulated network.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    #[default]
    Line,
    Ring,
    Star,
}

impl Topology {
    /// Links between node indices `0..nodes`.
    pub fn edges(&self, nodes: usize) -> Vec<(usize, usize)> {
        match self {
            Topology::Line => (1..nodes).map(|i| (i - 1, i)).collect(),
            Topology::Ring => {
                let mut edges: Vec<_> = (1..nodes).map(|i| (i - 1, i)).collect();
                if nodes > 2 {
                    edges.push((nodes - 1, 0));
                }
                edges
            }
            Topology::Star => (1..nodes).map(|i| (0, i)).collect(),
        }
    }
}

impl std::str::FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line" => Ok(Topology::Line),
            "ring" => Ok(Topology::Ring),
            "star" => Ok(Topology::Star),
            other => Err(format!("unknown topology: {other}")),
        }
    }
}

/// Simulated network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of simulated nodes.
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    #[serde(default)]
    pub topology: Topology,
    /// Run time of the simulation in seconds.
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
    /// Draw node priorities at random instead of using the node index.
    #[serde(default)]
    pub random_priorities: bool,
    /// Seed for the priority generator.
    #[serde(default)]
    pub seed: Option<u64>,
}

// -- Defaults --

fn default_tick_interval() -> u64 {
    250
}
fn default_poll_interval() -> u64 {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_nodes() -> usize {
    4
}
fn default_duration() -> u64 {
    10
}

// -- Trait impls --

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            topology: Topology::default(),
            duration_secs: default_duration(),
            random_priorities: false,
            seed: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, anyhow::Error> {
        let config: NodeConfig = toml::from_str(content)?;
        config.hierarchy.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, with environment variable overrides.
    ///
    /// For example: `HRM_PRIORITY=7 HRM_TOPOLOGY=ring`
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let mut config = if let Some(path) = path {
            if path.exists() {
                Self::from_file(path)?
            } else {
                tracing::warn!(
                    path = %path.display(),
                    "Config file not found, using defaults"
                );
                Self::default()
            }
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.hierarchy.validate()?;
        Ok(config)
    }

    /// Apply `HRM_*` overrides read through `lookup`. Values that fail to
    /// parse are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %value, "Ignoring unparsable override");
                    None
                }
            }
        }
        fn flag(value: Option<String>) -> Option<bool> {
            value.map(|v| v == "true" || v == "1")
        }

        if let Some(v) = parsed("HRM_PRIORITY", lookup("HRM_PRIORITY")) {
            self.hierarchy.priority = v;
        }
        if let Some(v) = parsed("HRM_DEPTH", lookup("HRM_DEPTH")) {
            self.hierarchy.depth = v;
        }
        if let Some(v) = parsed("HRM_EXPANSION_RADIUS", lookup("HRM_EXPANSION_RADIUS")) {
            self.hierarchy.expansion_radius = v;
        }
        if let Some(v) = flag(lookup("HRM_ADDRESS_REUSE")) {
            self.hierarchy.address_reuse = v;
        }
        if let Some(v) = parsed("HRM_TICK_INTERVAL_MS", lookup("HRM_TICK_INTERVAL_MS")) {
            self.node.tick_interval_ms = v;
        }
        if let Some(v) = lookup("HRM_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = flag(lookup("HRM_LOG_JSON")) {
            self.logging.json_format = v;
        }
        if let Some(v) = parsed("HRM_SIM_NODES", lookup("HRM_SIM_NODES")) {
            self.simulation.nodes = v;
        }
        if let Some(v) = parsed("HRM_TOPOLOGY", lookup("HRM_TOPOLOGY")) {
            self.simulation.topology = v;
        }
        if let Some(v) = parsed("HRM_SEED", lookup("HRM_SEED")) {
            self.simulation.seed = Some(v);
        }
    }
}
