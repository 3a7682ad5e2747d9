#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wan_gateway::config::Config;
use wan_gateway::server::{self, Gateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let gateway = Arc::new(Gateway::new(config));
    let shutdown = CancellationToken::new();

    server::run(gateway, shutdown.clone()).await?;

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received");
        ctrl_c_shutdown.cancel();
    });

    shutdown.cancelled().await;
    Ok(())
}
