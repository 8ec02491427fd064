/// Tradepost realtime hub - presence, direct messages, channel broadcasts and the shared store
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tradepost_core::realtime::Hub;
use tradepost_core::{HubConfig, SledStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let config = HubConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let store = SledStore::open(&config.data_dir)
        .map_err(|e| anyhow::anyhow!("Store error: {}", e))?;

    info!("Starting Tradepost hub");
    info!("   Listen: {}", config.listen_addr);
    info!("   Data: {}", config.data_dir.display());
    match &config.accounts {
        Some(accounts) => info!("   Accounts: {} configured", accounts.len()),
        None => info!("   Accounts: open (any well-formed login)"),
    }

    Hub::new(config, store)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Hub error: {}", e))?;

    Ok(())
}
