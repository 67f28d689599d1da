use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_poll_secs() -> u64 {
    5
}

fn default_max_jobs() -> usize {
    1
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub name: String,
    pub owner: String,
    /// Broker addresses, polled in rotation.
    pub brokers: Vec<String>,
    pub shared_secret: Option<String>,
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Per-job scratch directories are created under here.
    pub workdir: PathBuf,
    pub processors: Vec<ProcessorConfig>,
    #[serde(default)]
    pub logger: utils::logger::Config,
}

/// An external program handling one job type.
#[derive(Deserialize, Debug)]
pub struct ProcessorConfig {
    #[serde(rename = "type")]
    pub ty: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::args()
            .nth(1)
            .context("usage: worker <config.json>")?;
        let raw = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {path}"))
    }
}
