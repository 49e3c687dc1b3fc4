mod api;
mod client;
mod config;
mod handlers;
mod listener;
mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{mask_token, Config};
use crate::server::Bot;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,webhook_guard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration: explicit path, ./config.toml, or defaults + env
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::resolve(config_path.as_deref()).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Bot token: {}", mask_token(&config.telegram.bot_token));
    info!("  Bind address: {}", config.server.bind_target());
    info!("  Webhook base: {}", config.webhook.public_url);
    info!("  API base: {}", config.telegram.api_base);
    info!(
        "  TLS: {} / {}",
        config.tls.certificate.display(),
        config.tls.private_key.display()
    );

    let bot = Bot::new(config)?;

    info!("Bot is starting...");
    bot.run().await?;

    Ok(())
}
