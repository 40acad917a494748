mod bot;
mod command;
mod config;
mod dispatch;
mod format;
mod gemini;
mod platform;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use teloxide::Bot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::command::BotIdentity;
use crate::config::{Cli, Config};
use crate::gemini::GeminiClient;
use crate::platform::telegram;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gemini_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let credentials = cli.credentials()?;

    let config = Config::load_or_default(cli.config.as_deref())?;

    info!("Configuration loaded successfully");
    info!("  Text model: {}", config.gemini.effective_text_model());
    info!("  Vision model: {}", config.gemini.effective_vision_model());
    info!("  Command: {}", config.relay.effective_command());
    match config.relay.max_concurrent_requests {
        0 => info!("  Concurrent requests: unbounded"),
        n => info!("  Concurrent requests: {}", n),
    }

    let bot = Bot::new(&credentials.telegram_bot_token);

    let identity = match telegram::resolve_identity(&bot).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("{:#}; matching only the plain command until it resolves", e);
            BotIdentity::unresolved()
        }
    };
    match &identity.username {
        Some(username) => info!("Authorized as @{}", username),
        None => warn!("Bot username unknown"),
    }

    let generator = Arc::new(GeminiClient::new(
        credentials.gemini_api_key.clone(),
        &config.gemini,
    ));
    let state = Arc::new(AppState::new(&config, &identity, generator));

    info!("Bot is starting...");
    bot::run(bot, state).await?;

    Ok(())
}
