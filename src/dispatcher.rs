use crate::config::{ResolvedRestConfig, RestConfig};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::ratelimit::{
    capped_seconds, Acquire, GlobalRateLimit, RateLimitBucket, RateLimitHeaders,
    DEFAULT_RESET_AFTER,
};
use crate::recommendation::{GatewayRecommendation, RecommendationSource};
use crate::request::{build_http_request, Request};
use crate::transport::{HttpResponse, HttpTransport, ReqwestTransport};
use http::HeaderMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// A bucket worker with nothing queued for this long exits
pub const BUCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Successful (2xx) response
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RestResponse {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Body of a 429
#[derive(Debug, Deserialize)]
struct RateLimitedBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<RestResponse, Error>>,
}

struct Queues {
    accepting: bool,
    senders: HashMap<String, mpsc::UnboundedSender<Job>>,
}

struct Inner<T> {
    transport: T,
    config: ResolvedRestConfig,
    global: GlobalRateLimit,
    queues: Mutex<Queues>,
    /// Last published state of every bucket
    buckets: RwLock<HashMap<String, RateLimitBucket>>,
    tracker: TaskTracker,
    metrics: Arc<Metrics>,
}

/// Sends REST requests through per-route and global rate limits.
///
/// Each bucket key gets one worker task that runs its requests strictly in
/// arrival order. Buckets run concurrently, bounded by the global limit.
/// Clones share the same queues.
///
/// # Example
///
/// ```ignore
/// let rest = RequestDispatcher::new(RestConfig::builder(token).build()?)?;
/// let me: serde_json::Value = rest.get("/users/@me").await?.json()?;
/// rest.enqueue(Request::delete("/channels/123").reason("cleanup")).await?;
/// ```
pub struct RequestDispatcher<T: HttpTransport = ReqwestTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: HttpTransport> Clone for RequestDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RequestDispatcher<ReqwestTransport> {
    /// Create a dispatcher using `reqwest`
    pub fn new(config: RestConfig) -> Result<Self, Error> {
        let resolved = config.resolve()?;
        let transport = ReqwestTransport::new(resolved.request_timeout)?;
        Ok(Self::with_transport(resolved, transport))
    }
}

impl<T: HttpTransport> RequestDispatcher<T> {
    pub fn with_transport(config: ResolvedRestConfig, transport: T) -> Self {
        Self::with_metrics(config, transport, Arc::new(Metrics::new()))
    }

    /// Record into an existing [`Metrics`], e.g. the shard manager's
    pub fn with_metrics(config: ResolvedRestConfig, transport: T, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                global: GlobalRateLimit::new(config.global_limit, config.global_window),
                config,
                queues: Mutex::new(Queues {
                    accepting: true,
                    senders: HashMap::new(),
                }),
                buckets: RwLock::new(HashMap::new()),
                tracker: TaskTracker::new(),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &ResolvedRestConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Snapshot of a bucket by key (see [`crate::route_key`])
    pub fn bucket(&self, key: &str) -> Option<RateLimitBucket> {
        self.inner.buckets.read().get(key).cloned()
    }

    /// Number of bucket workers currently running
    pub fn active_buckets(&self) -> usize {
        self.inner.queues.lock().senders.len()
    }

    pub fn is_shutdown(&self) -> bool {
        !self.inner.queues.lock().accepting
    }

    /// Queue `request` on its bucket and wait for the outcome.
    ///
    /// Dropping the returned future does not cancel the request.
    pub async fn enqueue(&self, request: Request) -> Result<RestResponse, Error> {
        let (reply, rx) = oneshot::channel();
        {
            let mut queues = self.inner.queues.lock();
            if !queues.accepting {
                return Err(Error::Shutdown);
            }
            let key = request.bucket_key().to_string();
            trace!("Queueing {} {}", request.method(), request.path());
            let sender = queues
                .senders
                .entry(key.clone())
                .or_insert_with(|| self.spawn_bucket(key.clone()));

            if let Err(mpsc::error::SendError(job)) = sender.send(Job { request, reply }) {
                // Worker died without removing itself
                warn!("Worker for bucket {} is gone, restarting it", key);
                let sender = self.spawn_bucket(key.clone());
                sender.send(job).map_err(|_| Error::Shutdown)?;
                queues.senders.insert(key, sender);
            }
        }
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn get(&self, path: &str) -> Result<RestResponse, Error> {
        self.enqueue(Request::get(path)).await
    }

    pub async fn post(&self, path: &str, payload: Value) -> Result<RestResponse, Error> {
        self.enqueue(Request::post(path).json(payload)).await
    }

    pub async fn put(&self, path: &str, payload: Option<Value>) -> Result<RestResponse, Error> {
        let request = Request::put(path);
        let request = match payload {
            Some(payload) => request.json(payload),
            None => request,
        };
        self.enqueue(request).await
    }

    pub async fn patch(&self, path: &str, payload: Value) -> Result<RestResponse, Error> {
        self.enqueue(Request::patch(path).json(payload)).await
    }

    pub async fn delete(&self, path: &str) -> Result<RestResponse, Error> {
        self.enqueue(Request::delete(path)).await
    }

    /// Stop accepting requests and wait for everything already queued.
    pub async fn shutdown(&self) {
        {
            let mut queues = self.inner.queues.lock();
            if queues.accepting {
                info!("Shutting down request dispatcher");
            }
            queues.accepting = false;
            // Workers drain their queue and exit once their sender is gone
            queues.senders.clear();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("Request dispatcher drained");
    }

    fn spawn_bucket(&self, key: String) -> mpsc::UnboundedSender<Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        debug!("Starting worker for bucket {}", key);
        self.inner.tracker.spawn(inner.run_bucket(key, rx));
        tx
    }
}

impl<T: HttpTransport> Inner<T> {
    async fn run_bucket(self: Arc<Self>, key: String, mut rx: mpsc::UnboundedReceiver<Job>) {
        let mut bucket = self
            .buckets
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| RateLimitBucket::new(key.clone()));
        self.publish(&bucket);

        loop {
            let job = match timeout(BUCKET_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => {
                    // Senders only send under this lock, so an empty queue
                    // here stays empty once the entry is gone
                    let mut queues = self.queues.lock();
                    match rx.try_recv() {
                        Ok(job) => job,
                        Err(TryRecvError::Empty) => {
                            queues.senders.remove(&key);
                            self.forget_if_settled(&bucket);
                            debug!("Worker for bucket {} idle, exiting", key);
                            break;
                        }
                        Err(TryRecvError::Disconnected) => break,
                    }
                }
            };

            let result = self.execute(&mut bucket, job.request).await;
            if let Err(e) = &result {
                debug!("Request on {} failed: {}", key, e);
            }
            // Caller may have stopped waiting
            let _ = job.reply.send(result);
        }

        trace!("Worker for bucket {} finished", key);
    }

    /// Drop the state of an idle bucket unless it is still exhausted
    fn forget_if_settled(&self, bucket: &RateLimitBucket) {
        let settled = bucket
            .reset_at()
            .map_or(true, |reset_at| reset_at <= Instant::now());
        if settled {
            self.buckets.write().remove(bucket.key());
        }
    }

    /// Run one request to completion, retrying it in place so nothing
    /// queued behind it overtakes it.
    async fn execute(
        &self,
        bucket: &mut RateLimitBucket,
        mut request: Request,
    ) -> Result<RestResponse, Error> {
        let max_wait = self.config.max_rate_limit_wait;
        loop {
            if bucket.is_unknown() {
                trace!("Bucket {} not reported yet, sending optimistically", bucket.key());
            }
            loop {
                let acquired = bucket.try_acquire(Instant::now());
                self.publish(bucket);
                match acquired {
                    Acquire::Ready => break,
                    Acquire::WaitUntil(until) => {
                        let wait = until.saturating_duration_since(Instant::now());
                        if wait > max_wait {
                            return Err(Error::RateLimited {
                                retry_after: wait,
                                global: false,
                            });
                        }
                        debug!("Bucket {} exhausted, waiting {:?}", bucket.key(), wait);
                        tokio::time::sleep_until(until).await;
                    }
                }
            }
            if let Some(until) = self.global.paused_until() {
                let wait = until.saturating_duration_since(Instant::now());
                if wait > max_wait {
                    return Err(Error::RateLimited {
                        retry_after: wait,
                        global: true,
                    });
                }
            }
            self.global.acquire().await;

            let http = build_http_request(&request, &self.config)?;
            self.metrics.record_rest_request();
            trace!(
                "{} {} (attempt {})",
                request.method(),
                http.url,
                request.attempt + 1
            );

            let response = match self.transport.execute(http).await {
                Ok(response) => response,
                Err(e) if e.is_retryable() && request.attempt < self.config.max_retries => {
                    self.backoff(&mut request, &e.to_string()).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let now = Instant::now();
            let headers = RateLimitHeaders::from_headers(&response.headers);
            bucket.update(&headers, now);
            self.publish(bucket);

            match response.status {
                429 => {
                    let (retry_after, global) = rate_limited_wait(&headers, &response);
                    self.metrics.record_rest_rate_limited(global);
                    warn!(
                        "Rate limited on {} for {:?} (global: {})",
                        bucket.key(),
                        retry_after,
                        global
                    );
                    if let Some(until) = now.checked_add(retry_after) {
                        bucket.exhaust_until(until);
                        self.publish(bucket);
                        if global {
                            self.global.pause_until(until);
                        }
                    }
                    if retry_after > max_wait {
                        return Err(Error::RateLimited {
                            retry_after,
                            global,
                        });
                    }
                }
                200..=299 => {
                    return Ok(RestResponse {
                        status: response.status,
                        headers: response.headers,
                        body: response.body,
                    })
                }
                401 => return Err(Error::Auth(response.body_text())),
                status @ 500..=599 => {
                    if request.attempt < self.config.max_retries {
                        self.backoff(&mut request, &format!("status {}", status))
                            .await;
                        continue;
                    }
                    return Err(Error::Server {
                        status,
                        attempts: request.attempt + 1,
                    });
                }
                status => {
                    return Err(Error::Client {
                        status,
                        body: response.body_text(),
                    })
                }
            }
        }
    }

    async fn backoff(&self, request: &mut Request, reason: &str) {
        let delay = self.config.retry_backoff.delay_for_attempt(request.attempt);
        request.attempt += 1;
        self.metrics.record_rest_retry();
        warn!(
            "{} {} failed ({}), retry {}/{} in {:?}",
            request.method(),
            request.path(),
            reason,
            request.attempt,
            self.config.max_retries,
            delay
        );
        tokio::time::sleep(delay).await;
    }

    fn publish(&self, bucket: &RateLimitBucket) {
        self.buckets
            .write()
            .insert(bucket.key().to_string(), bucket.clone());
    }
}

/// How long a 429 blocks, and whether it blocks every route.
/// Headers win over the body.
fn rate_limited_wait(headers: &RateLimitHeaders, response: &HttpResponse) -> (Duration, bool) {
    let body: Option<RateLimitedBody> = serde_json::from_slice(&response.body).ok();

    let retry_after = headers
        .retry_after
        .or_else(|| {
            body.as_ref()
                .and_then(|b| b.retry_after)
                .and_then(capped_seconds)
        })
        .or_else(|| headers.reset_delay())
        .unwrap_or(DEFAULT_RESET_AFTER);
    let global = headers.is_global() || body.is_some_and(|b| b.global);

    (retry_after, global)
}

impl<T: HttpTransport> RecommendationSource for RequestDispatcher<T> {
    async fn recommend(&self) -> Result<GatewayRecommendation, Error> {
        self.get("/gateway/bot").await?.json()
    }
}
