use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use worker::config::Config;
use worker::worker::pipeline::{ExecProcessor, Registry};
use worker::worker::DispatchLoop;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    utils::logger::init(&config.logger)?;

    let mut registry = Registry::new();
    for processor in &config.processors {
        registry.register(
            &processor.ty,
            Arc::new(ExecProcessor::new(
                processor.program.clone(),
                processor.args.clone(),
            )),
        );
    }
    anyhow::ensure!(
        !registry.types().is_empty(),
        "no processors configured, nothing to poll for"
    );

    info!(name = %config.name, types = ?registry.types(), "worker up");
    let dispatch = DispatchLoop::new(&config, Arc::new(registry));
    dispatch
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}
