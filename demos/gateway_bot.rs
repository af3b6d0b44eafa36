//! Example: a small bot on shardgate
//!
//! Connects every recommended shard, answers `!ping` over REST, and prints
//! metrics on Ctrl+C.
//!
//! Run with: DISCORD_TOKEN=... cargo run --example gateway_bot
//!
//! Set SHARDGATE_SOURCE_IP to bind gateway connections to a local address.

use serde_json::json;
use shardgate::{
    ErrorKind, EventHandler, GatewayEvent, Request, RequestDispatcher, RestConfig,
    ShardManager, ShardManagerConfig, ShardState, TungsteniteConnector,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

struct PingBot {
    rest: RequestDispatcher,
}

impl EventHandler for PingBot {
    async fn on_event(&self, shard_id: u32, event: GatewayEvent) {
        if event.name != "MESSAGE_CREATE" || event.data["content"] != "!ping" {
            return;
        }
        let Some(channel_id) = event.data["channel_id"].as_str() else {
            return;
        };

        info!("[SHARD-{}] Ping in channel {}", shard_id, channel_id);
        let request = Request::post(format!("/channels/{}/messages", channel_id))
            .json(json!({ "content": "pong" }));
        let rest = self.rest.clone();
        tokio::spawn(async move {
            if let Err(e) = rest.enqueue(request).await {
                warn!("Reply failed: {}", e);
            }
        });
    }

    async fn on_state_change(&self, shard_id: u32, from: ShardState, to: ShardState) {
        info!("[SHARD-{}] {} -> {}", shard_id, from, to);
    }

    async fn on_error(&self, shard_id: u32, kind: ErrorKind, message: &str) {
        warn!("[SHARD-{}] {:?}: {}", shard_id, kind, message);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,shardgate=debug")),
        )
        .init();

    let token = std::env::var("DISCORD_TOKEN")?;

    let rest = RequestDispatcher::new(RestConfig::builder(token.as_str()).build()?)?;
    let config = ShardManagerConfig::builder(token.as_str())
        .intents(INTENTS)
        .build()?;

    let connector = match std::env::var("SHARDGATE_SOURCE_IP") {
        Ok(ip) => {
            info!("Binding gateway connections to {}", ip);
            TungsteniteConnector::new().with_source_ip(ip)
        }
        Err(_) => TungsteniteConnector::new(),
    };

    let manager = ShardManager::new(connector, PingBot { rest: rest.clone() });
    // Shard count and concurrency come from GET /gateway/bot
    manager.start(&config, &rest).await?;

    if let Some(resolved) = manager.resolved() {
        info!(
            "Running shards {}..={} of {}",
            resolved.first_shard_id, resolved.last_shard_id, resolved.total_shards
        );
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received"),
        failure = manager.next_failure() => {
            if let Some(failure) = failure {
                warn!("[SHARD-{}] Fatal: {}", failure.shard_id, failure.error);
            }
        }
    }

    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnections: {}", snapshot.reconnections_total);
    info!("  Events received: {}", snapshot.events_received_total);
    info!("  Ready shards: {}", snapshot.ready_shards);
    info!("  REST workers: {}", rest.active_buckets());

    manager.stop().await?;
    rest.shutdown().await;
    info!("Stopped");

    Ok(())
}
