/// Tradepost chat client daemon - Main entry point
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tradepost_core::messenger_api::start_messenger_api;
use tradepost_core::realtime::TcpConnector;
use tradepost_core::{ChatClient, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let connector = TcpConnector {
        hub_addr: config.hub_addr,
        connection_timeout: config.connection_timeout,
        auth_timeout: config.auth_timeout,
        keepalive_interval: config.keepalive_interval,
    };
    let (client, _dispatch) = ChatClient::connect(&config, connector)
        .map_err(|e| anyhow::anyhow!("Client error: {}", e))?;

    info!("Starting Tradepost client");
    info!("   User: {}", client.local_user());
    info!("   Hub: {}", config.hub_addr);

    client
        .login()
        .await
        .map_err(|e| anyhow::anyhow!("Login error: {}", e))?;

    let api_addr = config.api_addr;
    let api_client = client.clone();
    let api = tokio::spawn(async move { start_messenger_api(api_client, api_addr).await });

    tokio::select! {
        result = api => {
            result
                .map_err(|e| anyhow::anyhow!("Messenger API task failed: {}", e))?
                .map_err(|e| anyhow::anyhow!("Messenger API error: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            let _ = client.logout().await;
            // Let the unavailable presence reach the hub
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    Ok(())
}
