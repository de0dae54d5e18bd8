//! tntc - connectivity probe
//!
//! Connects to the configured Tarantool-compatible servers, waits for a ready
//! session, pings and reports the server greeting.

use std::time::{Duration, Instant};
use tntc_client::{Client, ClientConfig, TarantoolOps};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::from_env();
    tracing::info!("Starting tntc probe");
    tracing::info!("  Addresses: {}", config.addresses.join(", "));
    match &config.username {
        Some(user) => tracing::info!("  User: {}", user),
        None => tracing::info!("  User: guest"),
    }

    // Allow a full backoff cycle across every address before giving up
    let wait = config.connect_timeout() * config.addresses.len().max(1) as u32
        + Duration::from_millis(config.max_reconnect_backoff_ms);

    let client = Client::connect(config)?;
    if !client.wait_alive(wait).await {
        let cause = client
            .thumbstone()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "timed out".to_string());
        tracing::error!("Failed to connect: {}", cause);
        client.close();
        return Err(cause.into());
    }

    if let Some(greeting) = client.server_greeting() {
        tracing::info!("Connected to Tarantool {}", greeting.version_number());
        if let Some(uuid) = greeting.instance_uuid {
            tracing::info!("  Instance: {}", uuid);
        }
    }

    let started = Instant::now();
    client.async_ops().ping().await?;
    tracing::info!("Ping: {:?}", started.elapsed());
    tracing::info!("Schema version: {}", client.schema_version());

    client.close();
    Ok(())
}
