use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_sweep_secs() -> u64 {
    10
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub name: String,
    /// Text-protocol listener.
    pub listen: String,
    /// Optional newline-delimited JSON listener.
    pub listen_json: Option<String>,
    /// Shared secret for the mutual challenge handshake. Absent means the
    /// broker runs open (lab setups).
    pub shared_secret: Option<String>,
    /// Lease-expiry sweep interval.
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// Shared backing store; absent means in-memory single-instance mode.
    pub redis: Option<utils::db_pools::redis::Config>,
    pub filestore: FilestoreConfig,
    #[serde(default)]
    pub logger: utils::logger::Config,
}

#[derive(Deserialize, Debug)]
pub struct FilestoreConfig {
    pub root: PathBuf,
    pub public_base: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::args()
            .nth(1)
            .context("usage: broker <config.json>")?;
        let raw = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {path}"))
    }
}
