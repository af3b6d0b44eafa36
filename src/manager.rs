use crate::config::{ConfigError, ResolvedShardConfig, ShardManagerConfig};
use crate::connection::{ShardChannels, ShardConnection};
use crate::error::Error;
use crate::handler::EventHandler;
use crate::metrics::Metrics;
use crate::payload::GatewayCommand;
use crate::recommendation::RecommendationSource;
use crate::shard::{self, ShardState};
use crate::socket::GatewayConnector;
use crate::throttle::IdentifyThrottle;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A shard that ended with a fatal error
#[derive(Debug)]
pub struct ShardFailure {
    pub shard_id: u32,
    pub error: Error,
}

/// Manager-side view of one shard task
struct ShardHandle {
    commands: mpsc::Sender<GatewayCommand>,
    reconnect: Arc<Notify>,
    state: watch::Receiver<ShardState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ManagerState {
    is_running: bool,
    resolved: Option<Arc<ResolvedShardConfig>>,
    /// Kept after stop so final states stay readable
    shards: HashMap<u32, ShardHandle>,
    cancel: Option<CancellationToken>,
}

/// Owns the shard pool: one task per shard id, sharing an identify throttle.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync` and all methods can be called from
/// multiple tasks concurrently. `start` and `stop` are serialized.
pub struct ShardManager<C: GatewayConnector, H: EventHandler> {
    connector: Arc<C>,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    state: RwLock<ManagerState>,
    shard_handles: RwLock<HashMap<u32, JoinHandle<()>>>,
    /// tokio::Mutex so it can be held across await points
    lifecycle_lock: Mutex<()>,
    failures_tx: mpsc::UnboundedSender<ShardFailure>,
    failures_rx: Mutex<mpsc::UnboundedReceiver<ShardFailure>>,
}

impl<C: GatewayConnector, H: EventHandler> ShardManager<C, H> {
    pub fn new(connector: C, handler: H) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(connector),
            handler: Arc::new(handler),
            metrics: Arc::new(Metrics::new()),
            state: RwLock::new(ManagerState::default()),
            shard_handles: RwLock::new(HashMap::new()),
            lifecycle_lock: Mutex::new(()),
            failures_tx,
            failures_rx: Mutex::new(failures_rx),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn is_running(&self) -> bool {
        self.state.read().is_running
    }

    /// Configuration of the current (or last) start
    pub fn resolved(&self) -> Option<Arc<ResolvedShardConfig>> {
        self.state.read().resolved.clone()
    }

    /// Resolve `config` and spawn one task per shard id.
    ///
    /// `source` is consulted once, and only when the shard count or max
    /// concurrency is not given explicitly.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` if running, `Config` on invalid bounds, or whatever
    /// the recommendation source returns.
    pub async fn start(
        &self,
        config: &ShardManagerConfig,
        source: &impl RecommendationSource,
    ) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if self.state.read().is_running {
            return Err(Error::AlreadyStarted);
        }

        let recommendation = if config.needs_recommendation() {
            debug!("Fetching gateway recommendation");
            let recommendation = source.recommend().await?;
            info!(
                "Gateway recommends {} shards (max concurrency {})",
                recommendation.shards, recommendation.session_start_limit.max_concurrency
            );
            Some(recommendation)
        } else {
            None
        };
        let resolved = Arc::new(config.resolve(recommendation.as_ref())?);

        info!(
            "Starting ShardManager: shards {}..={} of {}, max concurrency {}",
            resolved.first_shard_id,
            resolved.last_shard_id,
            resolved.total_shards,
            resolved.max_concurrency
        );

        let throttle = Arc::new(IdentifyThrottle::new(
            resolved.max_concurrency,
            resolved.identify_interval,
        ));
        let cancel = CancellationToken::new();

        let mut shards = HashMap::new();
        let mut handles = HashMap::new();
        for shard_id in resolved.shard_ids() {
            let (handle, task) = self.create_shard(shard_id, &resolved, &throttle, &cancel);
            shards.insert(shard_id, handle);
            handles.insert(shard_id, task);
        }

        {
            let mut state = self.state.write();
            state.is_running = true;
            state.resolved = Some(resolved);
            state.shards = shards;
            state.cancel = Some(cancel);
        }
        *self.shard_handles.write() = handles;

        Ok(())
    }

    /// Stop all shards gracefully.
    ///
    /// Every shard closes its socket with 1000 and reaches Closed. Tasks still
    /// running after the shutdown grace period are aborted. A no-op when
    /// already stopped.
    pub async fn stop(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        let (cancel, grace) = {
            let mut state = self.state.write();
            if !state.is_running {
                debug!("ShardManager already stopped");
                return Ok(());
            }
            state.is_running = false;
            let grace = state
                .resolved
                .as_ref()
                .map_or(Duration::ZERO, |r| r.shutdown_grace);
            (state.cancel.take(), grace)
        };

        info!("Stopping ShardManager");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let handles: HashMap<u32, JoinHandle<()>> = std::mem::take(&mut *self.shard_handles.write());
        let deadline = Instant::now() + grace;
        for (shard_id, handle) in handles {
            await_or_abort(shard_id, handle, deadline).await;
        }

        info!("ShardManager stopped");
        Ok(())
    }

    /// Stop one shard. The others keep running. A no-op for a shard that
    /// is already stopped.
    pub async fn stop_shard(&self, shard_id: u32) -> Result<(), Error> {
        let grace = {
            let state = self.state.read();
            let handle = state.shards.get(&shard_id).ok_or_else(|| unknown_shard(shard_id))?;
            handle.cancel.cancel();
            state
                .resolved
                .as_ref()
                .map_or(Duration::ZERO, |r| r.shutdown_grace)
        };

        let task = self.shard_handles.write().remove(&shard_id);
        if let Some(task) = task {
            info!("[SHARD-{}] Stopping", shard_id);
            await_or_abort(shard_id, task, Instant::now() + grace).await;
        }
        Ok(())
    }

    /// Ask one shard to drop its socket and reconnect (resuming if it can)
    pub fn reconnect_shard(&self, shard_id: u32) -> Result<(), Error> {
        let state = self.state.read();
        let handle = state.shards.get(&shard_id).ok_or_else(|| unknown_shard(shard_id))?;
        handle.reconnect.notify_one();
        Ok(())
    }

    /// Queue an outbound gateway command on `shard_id`.
    ///
    /// Commands wait until the shard is Ready and within its send limit.
    pub async fn send(&self, shard_id: u32, command: GatewayCommand) -> Result<(), Error> {
        let commands = {
            let state = self.state.read();
            if !state.is_running {
                return Err(Error::Shutdown);
            }
            let handle = state.shards.get(&shard_id).ok_or_else(|| unknown_shard(shard_id))?;
            handle.commands.clone()
        };
        commands.send(command).await.map_err(|_| Error::Shutdown)
    }

    /// Queue a command on the shard responsible for `guild_id`
    pub async fn send_to_guild(&self, guild_id: u64, command: GatewayCommand) -> Result<(), Error> {
        let shard_id = self.shard_for_guild(guild_id).ok_or(Error::Shutdown)?;
        self.send(shard_id, command).await
    }

    /// Shard that receives events for `guild_id`; `None` before the first start
    pub fn shard_for_guild(&self, guild_id: u64) -> Option<u32> {
        self.state
            .read()
            .resolved
            .as_ref()
            .map(|r| shard::shard_for_guild(guild_id, r.total_shards))
    }

    pub fn shard_state(&self, shard_id: u32) -> Option<ShardState> {
        self.state
            .read()
            .shards
            .get(&shard_id)
            .map(|h| *h.state.borrow())
    }

    pub fn shard_states(&self) -> BTreeMap<u32, ShardState> {
        self.state
            .read()
            .shards
            .iter()
            .map(|(id, h)| (*id, *h.state.borrow()))
            .collect()
    }

    /// Wait for the next shard to end with a fatal error
    pub async fn next_failure(&self) -> Option<ShardFailure> {
        self.failures_rx.lock().await.recv().await
    }

    fn create_shard(
        &self,
        shard_id: u32,
        resolved: &Arc<ResolvedShardConfig>,
        throttle: &Arc<IdentifyThrottle>,
        cancel: &CancellationToken,
    ) -> (ShardHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(resolved.connection.command_buffer);
        let reconnect = Arc::new(Notify::new());
        let (state_tx, state_rx) = watch::channel(ShardState::Disconnected);
        let shard_cancel = cancel.child_token();

        debug!("[SHARD-{}] Creating shard", shard_id);
        self.metrics.update_shard(shard_id, |s| {
            s.state = ShardState::Disconnected;
            s.reconnect_attempt = 0;
        });

        let connection = ShardConnection::new(
            shard_id,
            self.connector.clone(),
            self.handler.clone(),
            throttle.clone(),
            resolved.clone(),
            self.metrics.clone(),
            ShardChannels {
                commands,
                reconnect: reconnect.clone(),
                state: state_tx,
                cancel: shard_cancel.clone(),
            },
        );

        let metrics = self.metrics.clone();
        let failures = self.failures_tx.clone();
        let task = tokio::spawn(Self::run_connection_with_recovery(
            shard_id, connection, metrics, failures,
        ));

        let handle = ShardHandle {
            commands: commands_tx,
            reconnect,
            state: state_rx,
            cancel: shard_cancel,
        };
        (handle, task)
    }

    /// Run a shard task, forwarding fatal errors and logging panics
    async fn run_connection_with_recovery(
        shard_id: u32,
        connection: ShardConnection<C, H>,
        metrics: Arc<Metrics>,
        failures: mpsc::UnboundedSender<ShardFailure>,
    ) {
        match AssertUnwindSafe(connection.run()).catch_unwind().await {
            Ok(Ok(())) => {
                debug!("[SHARD-{}] Connection task completed normally", shard_id);
            }
            Ok(Err(error)) => {
                warn!("[SHARD-{}] Connection task ended with error: {}", shard_id, error);
                let _ = failures.send(ShardFailure { shard_id, error });
            }
            Err(panic_err) => {
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(
                    "[SHARD-{}] Connection task PANICKED: {}. Shard is now dead.",
                    shard_id, panic_msg
                );
                metrics.record_error();
            }
        }
    }
}

async fn await_or_abort(shard_id: u32, mut task: JoinHandle<()>, deadline: Instant) {
    if timeout_at(deadline, &mut task).await.is_err() {
        warn!("[SHARD-{}] Did not stop within grace period, aborting", shard_id);
        task.abort();
    }
}

fn unknown_shard(shard_id: u32) -> Error {
    Error::Config(ConfigError::InvalidShardRange(format!(
        "shard {} is not managed here",
        shard_id
    )))
}

impl<C: GatewayConnector, H: EventHandler> Drop for ShardManager<C, H> {
    fn drop(&mut self) {
        if let Some(cancel) = self.state.write().cancel.take() {
            cancel.cancel();
        }
        // Abort all shard handles to prevent orphaned tasks
        let handles = std::mem::take(&mut *self.shard_handles.write());
        for (_shard_id, handle) in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::recommendation::{GatewayRecommendation, StaticRecommendation};
    use crate::testing::{wait_for_state, MockConnector, MockServer, Record, RecordingHandler};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    type TestManager = ShardManager<MockConnector, RecordingHandler>;

    fn manager() -> (TestManager, UnboundedReceiver<MockServer>, UnboundedReceiver<Record>) {
        let (connector, servers) = MockConnector::new();
        let (handler, records) = RecordingHandler::new();
        (ShardManager::new(connector, handler), servers, records)
    }

    fn config(total_shards: u32, max_concurrency: u32) -> ShardManagerConfig {
        ShardManagerConfig::builder("token")
            .gateway_url("wss://gateway.test")
            .total_shards(total_shards)
            .max_concurrency(max_concurrency)
            .shutdown_grace(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    fn no_recommendation() -> StaticRecommendation {
        StaticRecommendation::new("wss://unused.test", 1, 1)
    }

    /// Accept one connection, answer hello, and return the shard id it identified as
    async fn accept(servers: &mut UnboundedReceiver<MockServer>) -> (u32, MockServer, Instant) {
        let mut server = servers.recv().await.unwrap();
        server.hello(45000);
        let identify = server.recv_op(2).await;
        let shard_id = identify["d"]["shard"][0].as_u64().unwrap() as u32;
        (shard_id, server, Instant::now())
    }

    struct CountingSource {
        calls: AtomicUsize,
        recommendation: GatewayRecommendation,
    }

    impl RecommendationSource for CountingSource {
        async fn recommend(&self) -> Result<GatewayRecommendation, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.recommendation.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_identifies_spaced_within_bucket() {
        let (manager, mut servers, _records) = manager();
        manager.start(&config(3, 1), &no_recommendation()).await.unwrap();

        let mut accepted = Vec::new();
        for _ in 0..3 {
            accepted.push(accept(&mut servers).await);
        }

        let mut ids: Vec<u32> = accepted.iter().map(|(id, _, _)| *id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);

        let mut times: Vec<Instant> = accepted.iter().map(|(_, _, t)| *t).collect();
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(5));
        }

        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_identifies_parallel_across_buckets() {
        let (manager, mut servers, _records) = manager();
        manager.start(&config(2, 2), &no_recommendation()).await.unwrap();

        let (_, _a, first) = accept(&mut servers).await;
        let (_, _b, second) = accept(&mut servers).await;
        assert!(second - first < Duration::from_secs(5));

        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let (manager, _servers, _records) = manager();
        manager.start(&config(2, 1), &no_recommendation()).await.unwrap();
        assert!(manager.is_running());

        let again = manager.start(&config(2, 1), &no_recommendation()).await;
        assert!(matches!(again, Err(Error::AlreadyStarted)));

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        let states = manager.shard_states();
        assert_eq!(states.len(), 2);
        assert!(states.values().all(|s| *s == ShardState::Closed));

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let (manager, mut servers, _records) = manager();
        manager.start(&config(1, 1), &no_recommendation()).await.unwrap();
        let _first = servers.recv().await.unwrap();
        manager.stop().await.unwrap();

        manager.start(&config(1, 1), &no_recommendation()).await.unwrap();
        let _second = servers.recv().await.unwrap();
        assert!(manager.is_running());
        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recommendation_only_when_needed() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            recommendation: StaticRecommendation::new("wss://recommended.test", 4, 2).0,
        };

        let (explicit, _servers, _records) = manager();
        explicit.start(&config(2, 1), &source).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        explicit.stop().await.unwrap();

        let (recommended, mut servers, _records) = manager();
        let config = ShardManagerConfig::builder("token").build().unwrap();
        recommended.start(&config, &source).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let resolved = recommended.resolved().unwrap();
        assert_eq!(resolved.total_shards, 4);
        assert_eq!(resolved.max_concurrency, 2);
        assert_eq!(resolved.gateway_url, "wss://recommended.test");
        assert_eq!(recommended.shard_states().len(), 4);

        let server = servers.recv().await.unwrap();
        assert!(server.url.starts_with("wss://recommended.test/?v=10"));
        recommended.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_range_rejected() {
        let (manager, _servers, _records) = manager();
        let config = ShardManagerConfig::builder("token")
            .total_shards(4)
            .max_concurrency(1)
            .shard_range(2, 5)
            .build()
            .unwrap();
        let result = manager.start(&config, &no_recommendation()).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(!manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shard_range_subset() {
        let (manager, _servers, _records) = manager();
        let config = ShardManagerConfig::builder("token")
            .gateway_url("wss://gateway.test")
            .total_shards(8)
            .max_concurrency(1)
            .shard_range(2, 4)
            .build()
            .unwrap();
        manager.start(&config, &no_recommendation()).await.unwrap();
        let ids: Vec<u32> = manager.shard_states().keys().copied().collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert!(manager.shard_state(0).is_none());
        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_close_surfaces_and_others_continue() {
        let (manager, mut servers, mut records) = manager();
        manager.start(&config(2, 2), &no_recommendation()).await.unwrap();

        let (id_a, server_a, _) = accept(&mut servers).await;
        let (id_b, server_b, _) = accept(&mut servers).await;
        let (failing, healthy, healthy_id) = if id_a == 0 {
            (server_a, server_b, id_b)
        } else {
            (server_b, server_a, id_a)
        };

        failing.close(4004);
        let failure = manager.next_failure().await.unwrap();
        assert_eq!(failure.shard_id, 0);
        assert_eq!(failure.error.kind(), ErrorKind::Auth);
        assert_eq!(manager.shard_state(0), Some(ShardState::Closed));

        healthy.ready("sess", 1);
        wait_for_state(&mut records, healthy_id, ShardState::Ready).await;
        assert_eq!(manager.shard_state(healthy_id), Some(ShardState::Ready));

        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_guild_routes_by_shard() {
        let (manager, mut servers, mut records) = manager();
        manager.start(&config(2, 2), &no_recommendation()).await.unwrap();

        let mut by_id = HashMap::new();
        for _ in 0..2 {
            let (id, server, _) = accept(&mut servers).await;
            server.ready(&format!("sess-{}", id), 1);
            by_id.insert(id, server);
        }
        wait_for_state(&mut records, 0, ShardState::Ready).await;
        // Shard 1 may already have reported Ready while we waited on shard 0
        if manager.shard_state(1) != Some(ShardState::Ready) {
            wait_for_state(&mut records, 1, ShardState::Ready).await;
        }

        let guild_id = 1u64 << 22;
        assert_eq!(manager.shard_for_guild(guild_id), Some(1));
        manager
            .send_to_guild(
                guild_id,
                GatewayCommand::RequestGuildMembers(json!({"guild_id": guild_id.to_string()})),
            )
            .await
            .unwrap();

        let server = by_id.get_mut(&1).unwrap();
        let frame = server.recv_op(8).await;
        assert_eq!(frame["d"]["guild_id"], guild_id.to_string());

        manager.stop().await.unwrap();
        let result = manager
            .send(1, GatewayCommand::PresenceUpdate(json!({})))
            .await;
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_shard_leaves_others_running() {
        let (manager, mut servers, _records) = manager();
        manager.start(&config(2, 2), &no_recommendation()).await.unwrap();
        let _a = accept(&mut servers).await;
        let _b = accept(&mut servers).await;

        manager.stop_shard(1).await.unwrap();
        assert_eq!(manager.shard_state(1), Some(ShardState::Closed));
        assert_ne!(manager.shard_state(0), Some(ShardState::Closed));

        manager.stop_shard(1).await.unwrap();
        assert!(manager.stop_shard(9).await.is_err());

        manager.stop().await.unwrap();
        assert_eq!(manager.shard_state(0), Some(ShardState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_shard_resumes() {
        let (manager, mut servers, mut records) = manager();
        manager.start(&config(1, 1), &no_recommendation()).await.unwrap();
        let (_, server, _) = accept(&mut servers).await;
        server.ready("sess-0", 4);
        wait_for_state(&mut records, 0, ShardState::Ready).await;

        manager.reconnect_shard(0).unwrap();
        let mut server = servers.recv().await.unwrap();
        server.hello(45000);
        let resume = server.recv_op(6).await;
        assert_eq!(resume["d"]["session_id"], "sess-0");
        assert_eq!(resume["d"]["seq"], 4);

        manager.stop().await.unwrap();
    }

    #[test]
    fn test_shard_for_guild_before_start() {
        let (manager, _servers, _records) = manager();
        assert_eq!(manager.shard_for_guild(1 << 22), None);
        assert!(manager.shard_states().is_empty());
    }
}
