use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use broker::broker::shared::{run_submission_listener, SharedStore};
use broker::broker::store::{LocalStore, Store};
use broker::broker::Broker;
use broker::config::Config;
use broker::filestore::DirStore;
use broker::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    utils::logger::init(&config.logger)?;

    let store = match &config.redis {
        Some(redis) => {
            utils::db_pools::redis::init(redis).await?;
            Store::Shared(SharedStore::new())
        }
        None => Store::Local(LocalStore::new()),
    };
    let shared = matches!(store, Store::Shared(_));

    let engine = Broker::new(config.name.clone(), store);
    engine.start_reaper(std::time::Duration::from_secs(config.sweep_interval_secs));
    if shared {
        let url = config.redis.as_ref().map(|r| r.url.clone()).unwrap_or_default();
        tokio::spawn(run_submission_listener(url, engine.clone()));
    }

    let files = DirStore::new(config.filestore.root.clone(), config.filestore.public_base.clone());
    let server = Server::new(engine, files, config.shared_secret.clone());

    let text = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    tokio::spawn(server.clone().serve_text(text));

    if let Some(addr) = &config.listen_json {
        let json = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        tokio::spawn(server.clone().serve_json(json));
    }

    info!(name = %config.name, "broker up");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
