use crate::config::ResolvedShardConfig;
use crate::error::Error;
use crate::handler::EventHandler;
use crate::health::{Beat, HeartbeatMonitor};
use crate::metrics::Metrics;
use crate::payload::{
    self, classify_close, close_reason, CloseAction, GatewayCommand, GatewayEvent,
    GatewayPayload, Hello, OpCode, Ready, NORMAL_CLOSE_CODE, RESUMABLE_CLOSE_CODE,
};
use crate::shard::{Handshake, ReconnectCause, ShardSession, ShardState};
use crate::socket::{GatewayConnector, GatewaySocket, SocketMessage};
use crate::throttle::IdentifyThrottle;
use futures_util::future::{BoxFuture, OptionFuture};
use futures_util::FutureExt;
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Sends allowed per socket within [`SEND_WINDOW`] for application commands.
/// The gateway allows 120; the rest is left to heartbeats and handshakes.
const COMMAND_SEND_LIMIT: usize = 110;
const SEND_WINDOW: Duration = Duration::from_secs(60);

/// Close code assumed when the server closes without one
const NO_STATUS_CLOSE_CODE: u16 = 1005;

/// How a single connection ended
#[derive(Debug)]
enum Exit {
    Stopped,
    Reconnect(ReconnectCause),
}

/// Sliding-window count of frames sent on one socket
#[derive(Debug, Default)]
struct SendLimiter {
    sent: VecDeque<Instant>,
}

impl SendLimiter {
    fn record(&mut self, now: Instant) {
        self.sent.push_back(now);
    }

    /// When the next application command may go out, if not now
    fn command_wait(&mut self, now: Instant) -> Option<Instant> {
        while let Some(&first) = self.sent.front() {
            if first + SEND_WINDOW <= now {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() < COMMAND_SEND_LIMIT {
            None
        } else {
            self.sent.front().map(|first| *first + SEND_WINDOW)
        }
    }
}

/// Channels the manager uses to talk to one shard task
pub(crate) struct ShardChannels {
    pub commands: mpsc::Receiver<GatewayCommand>,
    pub reconnect: Arc<Notify>,
    pub state: watch::Sender<ShardState>,
    pub cancel: CancellationToken,
}

/// Drives one shard: connect, hello, identify or resume, heartbeat, and
/// reconnect until cancelled or fatally closed.
pub(crate) struct ShardConnection<C: GatewayConnector, H: EventHandler> {
    id: u32,
    connector: Arc<C>,
    handler: Arc<H>,
    throttle: Arc<IdentifyThrottle>,
    settings: Arc<ResolvedShardConfig>,
    metrics: Arc<Metrics>,
    session: ShardSession,
    channels: ShardChannels,
    /// Reconnect attempts since the last Ready
    attempt: u32,
}

impl<C: GatewayConnector, H: EventHandler> ShardConnection<C, H> {
    pub fn new(
        id: u32,
        connector: Arc<C>,
        handler: Arc<H>,
        throttle: Arc<IdentifyThrottle>,
        settings: Arc<ResolvedShardConfig>,
        metrics: Arc<Metrics>,
        channels: ShardChannels,
    ) -> Self {
        Self {
            id,
            connector,
            handler,
            throttle,
            settings,
            metrics,
            session: ShardSession::new(),
            channels,
            attempt: 0,
        }
    }

    /// Run the connection loop (reconnects on failure).
    ///
    /// Returns `Ok` once cancelled, or the fatal error that closed the shard.
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            let cause = match self.connect_and_run().await {
                Ok(Exit::Stopped) => {
                    self.transition(ShardState::Closed).await;
                    info!("[SHARD-{}] Closed", self.id);
                    return Ok(());
                }
                Ok(Exit::Reconnect(cause)) => cause,
                Err(e) => {
                    error!("[SHARD-{}] Fatal: {}", self.id, e);
                    self.metrics.record_error();
                    self.report_error(&e).await;
                    self.transition(ShardState::Closed).await;
                    return Err(e);
                }
            };

            let prev = self.session.state();
            if self.session.reconnect(&cause) {
                self.state_changed(prev).await;
            }

            let delay = match cause {
                ReconnectCause::InvalidSession { resumable: false } => invalid_session_delay(),
                _ => self.settings.backoff.delay_for_attempt(self.attempt),
            };
            self.attempt = self.attempt.saturating_add(1);
            self.metrics.record_reconnection(self.id, self.attempt);
            info!(
                "[SHARD-{}] Reconnecting in {:?} (attempt {}, {}, resume: {})",
                self.id,
                delay,
                self.attempt,
                cause,
                self.session.session_id().is_some()
            );

            tokio::select! {
                _ = self.channels.cancel.cancelled() => {
                    self.transition(ShardState::Closed).await;
                    info!("[SHARD-{}] Closed while waiting to reconnect", self.id);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Connect and run until disconnection
    async fn connect_and_run(&mut self) -> Result<Exit, Error> {
        self.transition(ShardState::Connecting).await;

        let base = self
            .session
            .resume_url()
            .unwrap_or(self.settings.gateway_url.as_str())
            .to_string();
        let url = self.settings.connect_url(&base);
        debug!("[SHARD-{}] Connecting to {}", self.id, url);

        let connect = timeout(
            self.settings.connection.connect_timeout,
            self.connector.connect(&url),
        );
        let mut socket = tokio::select! {
            _ = self.channels.cancel.cancelled() => return Ok(Exit::Stopped),
            result = connect => match result {
                Ok(Ok(socket)) => socket,
                Ok(Err(e)) => {
                    warn!("[SHARD-{}] Connect failed: {}", self.id, e);
                    self.report_error(&e).await;
                    return Ok(Exit::Reconnect(ReconnectCause::Transport));
                }
                Err(_) => {
                    let e = Error::Transport(format!(
                        "connect timed out after {:?}",
                        self.settings.connection.connect_timeout
                    ));
                    warn!("[SHARD-{}] {}", self.id, e);
                    self.report_error(&e).await;
                    return Ok(Exit::Reconnect(ReconnectCause::Transport));
                }
            }
        };

        self.metrics.record_connection(self.id);
        info!("[SHARD-{}] Connected to {}", self.id, url);
        self.transition(ShardState::WaitingHello).await;

        let exit = self.drive(&mut socket).await;

        let close_code = match &exit {
            Ok(Exit::Stopped) => Some(NORMAL_CLOSE_CODE),
            // Remote already closed or the socket is gone
            Ok(Exit::Reconnect(ReconnectCause::Closed(_)))
            | Ok(Exit::Reconnect(ReconnectCause::Transport))
            | Err(_) => None,
            Ok(Exit::Reconnect(cause)) if cause.is_resumable() => Some(RESUMABLE_CLOSE_CODE),
            Ok(Exit::Reconnect(_)) => Some(NORMAL_CLOSE_CODE),
        };
        if let Some(code) = close_code {
            trace!("[SHARD-{}] Closing socket with {}", self.id, code);
            match timeout(self.settings.connection.connect_timeout, socket.close(code)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[SHARD-{}] Close failed: {}", self.id, e),
                Err(_) => debug!("[SHARD-{}] Close timed out", self.id),
            }
        }

        exit
    }

    /// Message loop for one open socket
    async fn drive(&mut self, socket: &mut C::Socket) -> Result<Exit, Error> {
        let mut heartbeat: Option<HeartbeatMonitor> = None;
        let mut identify_wait: Option<BoxFuture<'static, ()>> = None;
        let mut limiter = SendLimiter::default();
        let mut last_read = Instant::now();

        loop {
            // Never shorter than two heartbeat intervals once hello arrived
            let read_window = match &heartbeat {
                Some(monitor) => self
                    .settings
                    .connection
                    .read_timeout
                    .max(monitor.interval().saturating_mul(2)),
                None => self.settings.connection.hello_timeout,
            };
            let read_deadline = last_read + read_window;
            let beat_deadline = heartbeat
                .as_ref()
                .map_or(read_deadline, |h| h.next_deadline());
            let ready = self.session.state().is_ready();
            let command_wait = limiter.command_wait(Instant::now());

            tokio::select! {
                _ = self.channels.cancel.cancelled() => {
                    info!("[SHARD-{}] Received stop", self.id);
                    return Ok(Exit::Stopped);
                }

                _ = self.channels.reconnect.notified() => {
                    info!("[SHARD-{}] Received reconnect command", self.id);
                    return Ok(Exit::Reconnect(ReconnectCause::Requested));
                }

                _ = sleep_until(read_deadline) => {
                    warn!(
                        "[SHARD-{}] No data for {:?}, reconnecting",
                        self.id,
                        Instant::now() - last_read
                    );
                    return Ok(Exit::Reconnect(ReconnectCause::ReadTimeout));
                }

                _ = sleep_until(beat_deadline), if heartbeat.is_some() => {
                    let Some(monitor) = heartbeat.as_mut() else { continue };
                    match monitor.on_deadline() {
                        Beat::Zombie => {
                            warn!(
                                "[SHARD-{}] Heartbeat not acknowledged within {:?}, connection is zombied",
                                self.id,
                                monitor.interval()
                            );
                            self.metrics.record_zombie();
                            return Ok(Exit::Reconnect(ReconnectCause::Zombie));
                        }
                        Beat::Send => {
                            if let Err(e) = self.send_heartbeat(socket, monitor, &mut limiter).await {
                                return Ok(self.transport_failure(e).await);
                            }
                        }
                    }
                }

                Some(()) = OptionFuture::from(identify_wait.as_mut()), if identify_wait.is_some() => {
                    identify_wait = None;
                    let identify = payload::identify(
                        self.settings.token.expose(),
                        self.settings.intents,
                        self.id,
                        self.settings.total_shards,
                    );
                    if let Err(e) = socket.send(identify).await {
                        return Ok(self.transport_failure(e).await);
                    }
                    limiter.record(Instant::now());
                    self.metrics.record_identify();
                    info!(
                        "[SHARD-{}] Sent identify ({} of {})",
                        self.id, self.id, self.settings.total_shards
                    );
                }

                command = self.channels.commands.recv(), if ready && command_wait.is_none() => {
                    let Some(command) = command else {
                        debug!("[SHARD-{}] Command channel closed", self.id);
                        return Ok(Exit::Stopped);
                    };
                    trace!("[SHARD-{}] Sending op {}", self.id, command.opcode().as_u8());
                    if let Err(e) = socket.send(command.to_json()).await {
                        return Ok(self.transport_failure(e).await);
                    }
                    limiter.record(Instant::now());
                    self.metrics.record_command_sent();
                }

                _ = sleep_until(command_wait.unwrap_or(read_deadline)), if ready && command_wait.is_some() => {
                    debug!("[SHARD-{}] Command send limit reached", self.id);
                }

                message = socket.next_message() => {
                    last_read = Instant::now();
                    let text = match message {
                        None => {
                            info!("[SHARD-{}] WebSocket stream ended", self.id);
                            return Ok(Exit::Reconnect(ReconnectCause::Transport));
                        }
                        Some(Err(e)) => return Ok(self.transport_failure(e).await),
                        Some(Ok(SocketMessage::Close(code))) => {
                            return self.closed(code.unwrap_or(NO_STATUS_CLOSE_CODE));
                        }
                        Some(Ok(SocketMessage::Text(text))) => text,
                    };

                    let payload = match GatewayPayload::parse(&text) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("[SHARD-{}] {}", self.id, e);
                            self.report_error(&e).await;
                            return Ok(Exit::Reconnect(ReconnectCause::Protocol));
                        }
                    };

                    let step = self
                        .handle_payload(payload, socket, &mut heartbeat, &mut identify_wait, &mut limiter)
                        .await;
                    if let Some(exit) = step {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    /// Apply one inbound payload. Returns `Some` when the connection must end.
    async fn handle_payload(
        &mut self,
        payload: GatewayPayload,
        socket: &mut C::Socket,
        heartbeat: &mut Option<HeartbeatMonitor>,
        identify_wait: &mut Option<BoxFuture<'static, ()>>,
        limiter: &mut SendLimiter,
    ) -> Option<Exit> {
        let Some(op) = payload.opcode() else {
            return Some(Exit::Reconnect(ReconnectCause::Protocol));
        };

        match op {
            OpCode::Hello => {
                if self.session.state() != ShardState::WaitingHello {
                    debug!("[SHARD-{}] Ignoring repeated hello", self.id);
                    return None;
                }
                let hello: Hello = match serde_json::from_value(payload.d) {
                    Ok(hello) => hello,
                    Err(e) => {
                        let e = Error::Protocol(format!("invalid hello: {}", e));
                        self.report_error(&e).await;
                        return Some(Exit::Reconnect(ReconnectCause::Protocol));
                    }
                };
                let interval = Duration::from_millis(hello.heartbeat_interval);
                debug!("[SHARD-{}] Hello, heartbeat every {:?}", self.id, interval);
                *heartbeat = Some(HeartbeatMonitor::with_random_jitter(interval));

                let prev = self.session.state();
                let handshake = self.session.hello();
                self.state_changed(prev).await;

                match handshake {
                    Handshake::Identify => {
                        let throttle = self.throttle.clone();
                        let id = self.id;
                        *identify_wait = Some(async move { throttle.acquire(id).await }.boxed());
                    }
                    Handshake::Resume {
                        session_id,
                        sequence,
                    } => {
                        let resume = payload::resume(
                            self.settings.token.expose(),
                            &session_id,
                            sequence,
                        );
                        if let Err(e) = socket.send(resume).await {
                            return Some(self.transport_failure(e).await);
                        }
                        limiter.record(Instant::now());
                        self.metrics.record_resume();
                        info!(
                            "[SHARD-{}] Sent resume (session {}, seq {:?})",
                            self.id, session_id, sequence
                        );
                    }
                }
            }

            OpCode::HeartbeatAck => {
                if let Some(monitor) = heartbeat.as_mut() {
                    monitor.record_ack();
                    trace!("[SHARD-{}] Heartbeat ack ({:?})", self.id, monitor.latency());
                    self.metrics.record_heartbeat_ack(self.id, monitor.latency());
                }
            }

            OpCode::Heartbeat => {
                debug!("[SHARD-{}] Server requested heartbeat", self.id);
                let sent = match heartbeat.as_mut() {
                    Some(monitor) => self.send_heartbeat(socket, monitor, limiter).await,
                    None => socket.send(payload::heartbeat(self.session.sequence())).await,
                };
                if let Err(e) = sent {
                    return Some(self.transport_failure(e).await);
                }
            }

            OpCode::Reconnect => {
                info!("[SHARD-{}] Server requested reconnect", self.id);
                return Some(Exit::Reconnect(ReconnectCause::ServerRequested));
            }

            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                warn!("[SHARD-{}] Invalid session (resumable: {})", self.id, resumable);
                return Some(Exit::Reconnect(ReconnectCause::InvalidSession { resumable }));
            }

            OpCode::Dispatch => self.dispatch(payload).await,

            OpCode::Identify
            | OpCode::PresenceUpdate
            | OpCode::VoiceStateUpdate
            | OpCode::Resume
            | OpCode::RequestGuildMembers => {
                let e = Error::Protocol(format!("unexpected inbound opcode {}", payload.op));
                warn!("[SHARD-{}] {}", self.id, e);
                self.report_error(&e).await;
                return Some(Exit::Reconnect(ReconnectCause::Protocol));
            }
        }

        None
    }

    async fn dispatch(&mut self, payload: GatewayPayload) {
        self.session.observe_sequence(payload.s);
        self.metrics.record_event(self.id);
        let name = payload.t.unwrap_or_default();

        match name.as_str() {
            "READY" => match serde_json::from_value::<Ready>(payload.d.clone()) {
                Ok(ready) => {
                    info!("[SHARD-{}] Ready (session {})", self.id, ready.session_id);
                    let prev = self.session.state();
                    self.session.ready(ready.session_id, ready.resume_gateway_url);
                    self.attempt = 0;
                    self.state_changed(prev).await;
                }
                Err(e) => warn!("[SHARD-{}] READY without session: {}", self.id, e),
            },
            "RESUMED" => {
                info!(
                    "[SHARD-{}] Resumed at seq {:?}",
                    self.id,
                    self.session.sequence()
                );
                let prev = self.session.state();
                self.session.resumed();
                self.attempt = 0;
                self.state_changed(prev).await;
            }
            _ => {}
        }

        let event = GatewayEvent {
            name,
            sequence: payload.s,
            data: payload.d,
        };
        let handler = self.handler.clone();
        self.guarded("on_event", handler.on_event(self.id, event))
            .await;
    }

    async fn send_heartbeat(
        &self,
        socket: &mut C::Socket,
        monitor: &mut HeartbeatMonitor,
        limiter: &mut SendLimiter,
    ) -> Result<(), Error> {
        socket
            .send(payload::heartbeat(self.session.sequence()))
            .await?;
        monitor.record_sent();
        limiter.record(Instant::now());
        self.metrics.record_heartbeat_sent();
        trace!("[SHARD-{}] Heartbeat sent", self.id);
        Ok(())
    }

    /// Remote closed the socket
    fn closed(&self, code: u16) -> Result<Exit, Error> {
        let reason = close_reason(code);
        match classify_close(code) {
            CloseAction::Fatal if code == 4004 => Err(Error::Auth(format!(
                "gateway closed shard {} with {}: {}",
                self.id, code, reason
            ))),
            CloseAction::Fatal => Err(Error::GatewayClosed {
                shard_id: self.id,
                code,
                reason: reason.to_string(),
            }),
            action => {
                info!(
                    "[SHARD-{}] Closed by server with {} ({}), {:?}",
                    self.id, code, reason, action
                );
                Ok(Exit::Reconnect(ReconnectCause::Closed(code)))
            }
        }
    }

    async fn transport_failure(&self, e: Error) -> Exit {
        warn!("[SHARD-{}] WebSocket error: {}", self.id, e);
        self.metrics.record_error();
        self.report_error(&e).await;
        Exit::Reconnect(ReconnectCause::Transport)
    }

    async fn report_error(&self, e: &Error) {
        let handler = self.handler.clone();
        let message = e.to_string();
        self.guarded("on_error", handler.on_error(self.id, e.kind(), &message))
            .await;
    }

    async fn transition(&mut self, next: ShardState) {
        let prev = self.session.state();
        if self.session.set_state(next).is_some() {
            self.state_changed(prev).await;
        }
    }

    /// Publish a state change the session already made
    async fn state_changed(&self, prev: ShardState) {
        let next = self.session.state();
        if prev == next {
            return;
        }
        debug!("[SHARD-{}] {} -> {}", self.id, prev, next);
        self.metrics.record_state(self.id, next);
        self.channels.state.send_replace(next);
        let handler = self.handler.clone();
        self.guarded("on_state_change", handler.on_state_change(self.id, prev, next))
            .await;
    }

    /// Run a handler callback, logging a panic instead of unwinding the shard
    async fn guarded(&self, callback: &str, fut: impl Future<Output = ()>) {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(
                "[SHARD-{}] Handler.{} panicked: {}",
                self.id, callback, message
            );
            self.metrics.record_error();
        }
    }
}

/// Wait before identifying after a non-resumable invalid session
fn invalid_session_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(1000..=5000))
}
