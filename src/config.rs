//! Engine tuning configuration.
//!
//! Optional TOML file passed to the sidecar with `--config`. It holds
//! engine defaults only — query pagination and KWIC window, job retention,
//! similarity threshold. The sidecar identity (database path, host, port,
//! token mode) always comes from the command line and is never read from
//! this file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub align: AlignConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// Default page size when the request omits `limit`.
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    /// Default KWIC context width in tokens.
    #[serde(default = "default_window")]
    pub default_window: usize,
    /// Default cap on aligned siblings attached per hit.
    #[serde(default = "default_aligned_limit")]
    pub default_aligned_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_window: default_window(),
            default_aligned_limit: default_aligned_limit(),
        }
    }
}

fn default_limit() -> i64 {
    50
}
fn default_window() -> usize {
    10
}
fn default_aligned_limit() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// How many terminal jobs the runtime keeps in its recent-history window.
    #[serde(default = "default_retain_terminal")]
    pub retain_terminal: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retain_terminal: default_retain_terminal(),
        }
    }
}

fn default_retain_terminal() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlignConfig {
    /// Default similarity threshold for the similarity strategy.
    #[serde(default = "default_sim_threshold")]
    pub sim_threshold: f64,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            sim_threshold: default_sim_threshold(),
        }
    }
}

fn default_sim_threshold() -> f64 {
    0.8
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.query.default_limit < 1 || config.query.default_limit > 200 {
        anyhow::bail!("query.default_limit must be in 1..=200");
    }
    if !(1..=25).contains(&config.query.default_window) {
        anyhow::bail!("query.default_window must be in 1..=25");
    }
    if !(0.0..=1.0).contains(&config.align.sim_threshold) {
        anyhow::bail!("align.sim_threshold must be in [0.0, 1.0]");
    }

    Ok(config)
}
