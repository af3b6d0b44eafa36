//! # shardgate
//!
//! Sharded gateway connections and a rate-limited REST dispatcher for
//! Discord-style APIs.
//!
//! ## Features
//!
//! - **Sharding** with one task per shard and identify throttling per
//!   max-concurrency bucket
//! - **Resume and reconnect** driven by close codes, with exponential backoff
//!   and full jitter
//! - **Heartbeating** with zombie connection detection
//! - **Per-route rate limiting** learned from response headers, plus a global
//!   limit and global 429 pauses
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use shardgate::{
//!     EventHandler, GatewayEvent, RequestDispatcher, RestConfig, ShardManager,
//!     ShardManagerConfig, TungsteniteConnector,
//! };
//!
//! struct Bot;
//!
//! impl EventHandler for Bot {
//!     async fn on_event(&self, shard_id: u32, event: GatewayEvent) {
//!         println!("[{}] {}", shard_id, event.name);
//!     }
//! }
//!
//! let rest = RequestDispatcher::new(RestConfig::builder(&token).build()?)?;
//! let config = ShardManagerConfig::builder(&token).intents(513).build()?;
//!
//! let manager = ShardManager::new(TungsteniteConnector::new(), Bot);
//! manager.start(&config, &rest).await?;
//! ```

mod config;
mod connection;
mod dispatcher;
mod error;
mod handler;
mod health;
mod manager;
mod metrics;
mod payload;
mod ratelimit;
mod recommendation;
mod request;
mod shard;
mod socket;
mod throttle;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, ResolvedRestConfig, ResolvedShardConfig,
    RestConfig, RestConfigBuilder, ShardManagerConfig, ShardManagerConfigBuilder, Token,
    DEFAULT_API_BASE, DEFAULT_API_VERSION, DEFAULT_GATEWAY_URL,
};
pub use dispatcher::{RequestDispatcher, RestResponse, BUCKET_IDLE_TIMEOUT};
pub use error::{Error, ErrorKind};
pub use handler::{EventHandler, NoopHandler};
pub use health::{Beat, HeartbeatMonitor};
pub use manager::{ShardFailure, ShardManager};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use payload::{
    classify_close, close_reason, CloseAction, GatewayCommand, GatewayEvent, GatewayPayload,
    OpCode, NORMAL_CLOSE_CODE, RESUMABLE_CLOSE_CODE,
};
pub use ratelimit::{
    Acquire, GlobalRateLimit, RateLimitBucket, RateLimitHeaders, DEFAULT_RESET_AFTER,
    MAX_RATE_LIMIT_DELAY,
};
pub use recommendation::{
    GatewayRecommendation, RecommendationSource, SessionStartLimit, StaticRecommendation,
};
pub use request::{route_key, Method, Request, AUDIT_LOG_REASON};
pub use shard::{shard_for_guild, Handshake, ReconnectCause, ShardSession, ShardState};
pub use socket::{
    GatewayConnector, GatewaySocket, SocketMessage, TungsteniteConnector, TungsteniteSocket,
};
pub use throttle::IdentifyThrottle;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Result type for shardgate operations
pub type Result<T> = std::result::Result<T, Error>;
