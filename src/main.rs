//! WeChat bot adapter - Main Entry Point
//!
//! Serves the WeChat webhook and answers every message with a demo echo bot.

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wechat_bot_adapter::activity::activity_types;
use wechat_bot_adapter::prelude::*;
use wechat_bot_adapter::webhook::{self, WebhookState};

/// Echoes text back and greets new followers
struct EchoBot;

#[async_trait]
impl Bot for EchoBot {
    async fn on_turn(&self, ctx: &mut TurnContext) -> Result<()> {
        let activity = ctx.activity();

        if activity.activity_type == activity_types::EVENT {
            if activity.value.as_ref().and_then(|v| v.as_str()) == Some("subscribe") {
                ctx.send_text("Thanks for following!");
            }
            return Ok(());
        }

        let reply = match activity.text() {
            Some(text) => format!("You said: {}", text),
            None if !activity.attachments.is_empty() => {
                format!("Received {}", activity.attachments[0].content_type)
            }
            None => return Ok(()),
        };
        ctx.send_text(reply);

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wechat_bot_adapter=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("WeChat bot adapter starting...");

    // Load configuration
    let config = ServerConfig::from_env()?;
    config.settings.validate(true)?;
    info!(
        "Configuration loaded ({} mode)",
        if config.settings.passive_response_mode {
            "passive"
        } else {
            "active"
        }
    );

    let client = Arc::new(WechatApiClient::new(
        config.settings.app_id.clone(),
        config.settings.app_secret.clone(),
    ));
    let adapter = WechatAdapter::new(client).with_queue(Arc::new(TokioSpawnQueue));

    let shutdown = CancellationToken::new();
    let webhook_addr: SocketAddr = config.webhook_addr.parse()?;
    let state = WebhookState {
        config: config.clone(),
        adapter: Arc::new(adapter),
        bot: Arc::new(EchoBot),
        shutdown: shutdown.clone(),
    };

    let server = tokio::spawn(async move {
        if let Err(e) = webhook::run_server(webhook_addr, state).await {
            tracing::error!("Webhook server error: {}", e);
        }
    });

    info!("WeChat webhook server listening on {}", config.webhook_addr);

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }

    shutdown.cancel();
    if let Err(e) = server.await {
        tracing::error!("Webhook server task failed: {}", e);
    }

    info!("WeChat bot adapter stopped");
    Ok(())
}
