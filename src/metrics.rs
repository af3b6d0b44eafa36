use crate::shard::ShardState;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters cover both the shard pool and the REST dispatcher. Use
/// `snapshot()` for a point-in-time view, or the individual getters.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
/// println!("Identifies: {}", metrics.identifies());
///
/// let snapshot = metrics.snapshot();
/// for shard in &snapshot.shards {
///     println!("shard {} is {} ({:?})", shard.shard_id, shard.state, shard.latency);
/// }
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeats_acked_total: AtomicU64,
    zombies_total: AtomicU64,
    events_received_total: AtomicU64,
    commands_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rest_requests_total: AtomicU64,
    rest_retries_total: AtomicU64,
    rest_rate_limited_total: AtomicU64,
    rest_global_rate_limited_total: AtomicU64,

    /// Per-shard metrics
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: u32,
    /// Current lifecycle state
    pub state: ShardState,
    /// Last heartbeat round trip
    pub latency: Option<Duration>,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last event received (None if no events)
    pub time_since_last_event: Option<Duration>,
    /// Current reconnection attempt (0 once ready)
    pub reconnect_attempt: u32,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_event_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            state: ShardState::Disconnected,
            latency: None,
            time_since_connected: None,
            time_since_last_event: None,
            reconnect_attempt: 0,
            last_connected_at: None,
            last_event_at: None,
        }
    }

    /// Create a snapshot with computed durations
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_event: self.last_event_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Sockets opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_acked(&self) -> u64 {
        self.heartbeats_acked_total.load(Ordering::Relaxed)
    }

    /// Connections dropped for a missed heartbeat ack
    pub fn zombies(&self) -> u64 {
        self.zombies_total.load(Ordering::Relaxed)
    }

    pub fn events_received(&self) -> u64 {
        self.events_received_total.load(Ordering::Relaxed)
    }

    pub fn commands_sent(&self) -> u64 {
        self.commands_sent_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// HTTP exchanges performed, including retries
    pub fn rest_requests(&self) -> u64 {
        self.rest_requests_total.load(Ordering::Relaxed)
    }

    pub fn rest_retries(&self) -> u64 {
        self.rest_retries_total.load(Ordering::Relaxed)
    }

    /// 429 responses seen
    pub fn rest_rate_limited(&self) -> u64 {
        self.rest_rate_limited_total.load(Ordering::Relaxed)
    }

    pub fn rest_global_rate_limited(&self) -> u64 {
        self.rest_global_rate_limited_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self, shard_id: u32) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.last_connected_at = Some(Instant::now()));
    }

    pub(crate) fn record_reconnection(&self, shard_id: u32, attempt: u32) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.reconnect_attempt = attempt);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self, shard_id: u32, latency: Option<Duration>) {
        self.heartbeats_acked_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.latency = latency);
    }

    pub(crate) fn record_zombie(&self) {
        self.zombies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self, shard_id: u32) {
        self.events_received_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.last_event_at = Some(Instant::now()));
    }

    pub(crate) fn record_command_sent(&self) {
        self.commands_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rest_request(&self) {
        self.rest_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rest_retry(&self) {
        self.rest_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rest_rate_limited(&self, global: bool) {
        self.rest_rate_limited_total.fetch_add(1, Ordering::Relaxed);
        if global {
            self.rest_global_rate_limited_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_state(&self, shard_id: u32, state: ShardState) {
        self.update_shard(shard_id, |s| {
            s.state = state;
            if state.is_ready() {
                s.reconnect_attempt = 0;
            }
        });
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        update_fn(
            shards
                .entry(shard_id)
                .or_insert_with(|| ShardMetrics::new(shard_id)),
        );
    }

    /// Get a snapshot of all shard metrics, ordered by shard id
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    /// Shards currently in Ready
    pub fn ready_shards(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.state.is_ready())
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeats_acked_total: self.heartbeats_acked_total.load(Ordering::Acquire),
            zombies_total: self.zombies_total.load(Ordering::Acquire),
            events_received_total: self.events_received_total.load(Ordering::Acquire),
            commands_sent_total: self.commands_sent_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            rest_requests_total: self.rest_requests_total.load(Ordering::Acquire),
            rest_retries_total: self.rest_retries_total.load(Ordering::Acquire),
            rest_rate_limited_total: self.rest_rate_limited_total.load(Ordering::Acquire),
            rest_global_rate_limited_total: self
                .rest_global_rate_limited_total
                .load(Ordering::Acquire),
            ready_shards: shard_snapshots.iter().filter(|s| s.state.is_ready()).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeats_acked_total: u64,
    pub zombies_total: u64,
    pub events_received_total: u64,
    pub commands_sent_total: u64,
    pub errors_total: u64,
    pub rest_requests_total: u64,
    pub rest_retries_total: u64,
    pub rest_rate_limited_total: u64,
    pub rest_global_rate_limited_total: u64,
    pub ready_shards: usize,
    pub shards: Vec<ShardMetrics>,
}
