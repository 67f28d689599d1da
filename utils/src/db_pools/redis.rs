//! Static redis connection pool shared by the broker components.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use deadpool_redis::{Pool, Runtime};
use serde::{Deserialize, Serialize};

static POOL: OnceLock<Pool> = OnceLock::new();

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub url: String,
    pub max_connection: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1/"),
            max_connection: 4,
        }
    }
}

/// Initialize the static pool. Call once at startup.
pub async fn init(config: &Config) -> Result<()> {
    let pool = deadpool_redis::Config::from_url(&config.url)
        .builder()?
        .max_size(config.max_connection)
        .runtime(Runtime::Tokio1)
        .build()?;

    // test pool connection
    pool.get().await.context("get init conn")?;

    POOL.get_or_init(|| pool);
    Ok(())
}

/// Get one pooled connection.
///
/// # Panics
///
/// Panics if called before a successful [`init`].
pub async fn redis_conn() -> Result<deadpool_redis::Connection> {
    Ok(POOL.get().unwrap().get().await?)
}

/// # Panics
///
/// Panics if called before a successful [`init`].
pub fn redis_pool() -> &'static deadpool_redis::Pool {
    POOL.get().unwrap()
}
