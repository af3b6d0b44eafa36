use crate::recommendation::GatewayRecommendation;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Production REST base (unversioned)
pub const DEFAULT_API_BASE: &str = "https://discord.com/api";
/// Gateway used when neither the config nor the recommendation names one
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
/// API version for both REST and gateway
pub const DEFAULT_API_VERSION: u8 = 10;

/// Bot token. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Wrap a raw token. A leading `Bot ` prefix is stripped.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let raw = token.strip_prefix("Bot ").unwrap_or(&token).trim().to_string();
        Self(raw)
    }

    /// Raw token as sent in identify/resume payloads
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Value of the REST `Authorization` header
    pub fn authorization(&self) -> String {
        format!("Bot {}", self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Configuration for the shard manager, as supplied by the caller.
///
/// Optional fields are filled in by [`ShardManagerConfig::resolve`], which
/// may consult a [`GatewayRecommendation`].
#[derive(Debug, Clone)]
pub struct ShardManagerConfig {
    /// Bot token
    pub token: Token,
    /// Gateway URL override (defaults to the recommended url)
    pub gateway_url: Option<String>,
    /// Gateway API version
    pub api_version: u8,
    /// Gateway intents bitfield sent with identify
    pub intents: u64,
    /// First shard id this process runs (default 0)
    pub first_shard_id: Option<u32>,
    /// Last shard id this process runs (default `total_shards - 1`)
    pub last_shard_id: Option<u32>,
    /// Total shards across all processes. Values <= 1 use the recommendation.
    pub total_shards: Option<u32>,
    /// Identify concurrency (defaults to the recommendation)
    pub max_concurrency: Option<u32>,
    /// Minimum spacing between identifies within one concurrency bucket
    pub identify_interval: Duration,
    /// How long `stop()` waits for shard tasks before aborting them
    pub shutdown_grace: Duration,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
}

impl ShardManagerConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> ShardManagerConfigBuilder {
        ShardManagerConfigBuilder {
            config: ShardManagerConfig {
                token: Token::new(token),
                gateway_url: None,
                api_version: DEFAULT_API_VERSION,
                intents: 0,
                first_shard_id: None,
                last_shard_id: None,
                total_shards: None,
                max_concurrency: None,
                identify_interval: Duration::from_secs(5),
                shutdown_grace: Duration::from_secs(10),
                connection: ConnectionConfig::default(),
                backoff: BackoffConfig::default(),
            },
        }
    }

    /// Whether resolving needs a remote recommendation
    pub fn needs_recommendation(&self) -> bool {
        self.total_shards.map_or(true, |n| n <= 1) || self.max_concurrency.is_none()
    }

    /// Produce the immutable configuration the shards run with.
    pub fn resolve(
        &self,
        recommendation: Option<&GatewayRecommendation>,
    ) -> Result<ResolvedShardConfig, ConfigError> {
        let total_shards = match self.total_shards {
            Some(n) if n > 1 => n,
            explicit => recommendation
                .map(|r| r.shards)
                .or(explicit)
                .unwrap_or(1),
        };
        if total_shards == 0 {
            return Err(ConfigError::InvalidShardRange(
                "total_shards must be >= 1".to_string(),
            ));
        }

        let max_concurrency = self
            .max_concurrency
            .or_else(|| recommendation.map(|r| r.session_start_limit.max_concurrency))
            .unwrap_or(1);
        if max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(
                "max_concurrency must be >= 1".to_string(),
            ));
        }

        let first_shard_id = self.first_shard_id.unwrap_or(0);
        let last_shard_id = self.last_shard_id.unwrap_or(total_shards - 1);
        if first_shard_id > last_shard_id || last_shard_id >= total_shards {
            return Err(ConfigError::InvalidShardRange(format!(
                "[{}, {}] is not within [0, {})",
                first_shard_id, last_shard_id, total_shards
            )));
        }

        let gateway_url = self
            .gateway_url
            .clone()
            .or_else(|| recommendation.map(|r| r.url.clone()))
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());
        url::Url::parse(&gateway_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", gateway_url, e)))?;

        Ok(ResolvedShardConfig {
            token: self.token.clone(),
            gateway_url,
            api_version: self.api_version,
            intents: self.intents,
            total_shards,
            first_shard_id,
            last_shard_id,
            max_concurrency,
            identify_interval: self.identify_interval,
            shutdown_grace: self.shutdown_grace,
            connection: self.connection.clone(),
            backoff: self.backoff.clone(),
        })
    }
}

/// Builder for ShardManagerConfig
#[derive(Debug, Clone)]
pub struct ShardManagerConfigBuilder {
    config: ShardManagerConfig,
}

impl ShardManagerConfigBuilder {
    /// Override the gateway URL
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = Some(url.into());
        self
    }

    /// Set the gateway API version
    pub fn api_version(mut self, version: u8) -> Self {
        self.config.api_version = version;
        self
    }

    /// Set the intents bitfield
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    /// Run only shards `first..=last` of the cluster
    pub fn shard_range(mut self, first: u32, last: u32) -> Self {
        self.config.first_shard_id = Some(first);
        self.config.last_shard_id = Some(last);
        self
    }

    /// Set the total shard count
    pub fn total_shards(mut self, total: u32) -> Self {
        self.config.total_shards = Some(total);
        self
    }

    /// Set the identify concurrency
    pub fn max_concurrency(mut self, max: u32) -> Self {
        self.config.max_concurrency = Some(max);
        self
    }

    /// Set the spacing between identifies in one concurrency bucket
    pub fn identify_interval(mut self, interval: Duration) -> Self {
        self.config.identify_interval = interval;
        self
    }

    /// Set the grace period `stop()` waits for shard tasks
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ShardManagerConfig, ConfigError> {
        if self.config.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        self.config.backoff.validate()?;

        if let Some(0) = self.config.max_concurrency {
            return Err(ConfigError::InvalidConcurrency(
                "max_concurrency cannot be 0".to_string(),
            ));
        }

        if let (Some(first), Some(last)) = (self.config.first_shard_id, self.config.last_shard_id) {
            if first > last {
                return Err(ConfigError::InvalidShardRange(format!(
                    "first_shard_id {} > last_shard_id {}",
                    first, last
                )));
            }
        }

        Ok(self.config)
    }
}

/// Shard configuration with every default filled in.
#[derive(Debug, Clone)]
pub struct ResolvedShardConfig {
    pub token: Token,
    pub gateway_url: String,
    pub api_version: u8,
    pub intents: u64,
    pub total_shards: u32,
    pub first_shard_id: u32,
    pub last_shard_id: u32,
    pub max_concurrency: u32,
    pub identify_interval: Duration,
    pub shutdown_grace: Duration,
    pub connection: ConnectionConfig,
    pub backoff: BackoffConfig,
}

impl ResolvedShardConfig {
    /// Shard ids run by this manager
    pub fn shard_ids(&self) -> RangeInclusive<u32> {
        self.first_shard_id..=self.last_shard_id
    }

    /// Full connect URL for a gateway base (`?v=..&encoding=json`)
    pub fn connect_url(&self, base: &str) -> String {
        format!(
            "{}/?v={}&encoding=json",
            base.trim_end_matches('/'),
            self.api_version
        )
    }
}

/// Configuration for the REST dispatcher
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Bot token
    pub token: Token,
    /// Unversioned API base (default [`DEFAULT_API_BASE`])
    pub base_url: Option<String>,
    /// API version appended to the base
    pub api_version: u8,
    /// Replaces the versioned API base for every REST call when set
    pub proxy_url: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Retry attempts for transport failures and 5xx responses
    pub max_retries: u32,
    /// Backoff between retries
    pub retry_backoff: BackoffConfig,
    /// Calls allowed per global window across all buckets
    pub global_limit: u32,
    /// Length of the global window
    pub global_window: Duration,
    /// Longest a request waits on a rate limit before failing with
    /// [`crate::Error::RateLimited`]
    pub max_rate_limit_wait: Duration,
}

impl RestConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> RestConfigBuilder {
        RestConfigBuilder {
            config: RestConfig {
                token: Token::new(token),
                base_url: None,
                api_version: DEFAULT_API_VERSION,
                proxy_url: None,
                request_timeout: Duration::from_secs(15),
                max_retries: 3,
                retry_backoff: BackoffConfig {
                    initial_delay: Duration::from_millis(500),
                    max_delay: Duration::from_secs(10),
                    multiplier: 2.0,
                    jitter: true,
                },
                global_limit: 50,
                global_window: Duration::from_secs(1),
                max_rate_limit_wait: Duration::from_secs(60),
            },
        }
    }

    /// Produce the immutable configuration the dispatcher runs with.
    pub fn resolve(&self) -> Result<ResolvedRestConfig, ConfigError> {
        let api_base = match &self.proxy_url {
            Some(proxy) => proxy.trim_end_matches('/').to_string(),
            None => format!(
                "{}/v{}",
                self.base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_API_BASE)
                    .trim_end_matches('/'),
                self.api_version
            ),
        };
        url::Url::parse(&api_base)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", api_base, e)))?;

        Ok(ResolvedRestConfig {
            api_base,
            token: self.token.clone(),
            user_agent: format!(
                "DiscordBot ({}, {})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
            request_timeout: self.request_timeout,
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff.clone(),
            global_limit: self.global_limit,
            global_window: self.global_window,
            max_rate_limit_wait: self.max_rate_limit_wait,
        })
    }
}

/// Builder for RestConfig
#[derive(Debug, Clone)]
pub struct RestConfigBuilder {
    config: RestConfig,
}

impl RestConfigBuilder {
    /// Set the unversioned API base
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    /// Set the API version
    pub fn api_version(mut self, version: u8) -> Self {
        self.config.api_version = version;
        self
    }

    /// Send every REST call through a REST proxy
    pub fn proxy_url(mut self, url: impl Into<String>) -> Self {
        self.config.proxy_url = Some(url.into());
        self
    }

    /// Set the per-request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the retry budget for transport failures and 5xx responses
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the retry backoff
    pub fn retry_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// Set the global limit (`limit` calls per `window`)
    pub fn global_limit(mut self, limit: u32, window: Duration) -> Self {
        self.config.global_limit = limit;
        self.config.global_window = window;
        self
    }

    /// Set how long a request may wait on a rate limit
    pub fn max_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.config.max_rate_limit_wait = wait;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<RestConfig, ConfigError> {
        if self.config.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        self.config.retry_backoff.validate()?;
        if self.config.global_limit == 0 || self.config.global_window.is_zero() {
            return Err(ConfigError::InvalidRest(
                "global limit and window must be > 0".to_string(),
            ));
        }
        Ok(self.config)
    }
}

/// REST configuration with every default filled in.
#[derive(Debug, Clone)]
pub struct ResolvedRestConfig {
    pub api_base: String,
    pub token: Token,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: BackoffConfig,
    pub global_limit: u32,
    pub global_window: Duration,
    pub max_rate_limit_wait: Duration,
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token supplied
    #[error("a bot token is required")]
    MissingToken,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Shard range does not fit the shard count
    #[error("Invalid shard range: {0}")]
    InvalidShardRange(String),
    /// Invalid identify concurrency
    #[error("Invalid max concurrency: {0}")]
    InvalidConcurrency(String),
    /// URL failed to parse
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
    /// Invalid REST settings
    #[error("Invalid REST configuration: {0}")]
    InvalidRest(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Timeout for the Hello after the socket opens
    pub hello_timeout: Duration,
    /// Maximum silence on the socket before it is considered dead
    pub read_timeout: Duration,
    /// Buffer of the per-shard command channel
    pub command_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(120),
            command_buffer: 100,
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true, // Full jitter
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }
        if self.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
