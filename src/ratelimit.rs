//! Route buckets and the process-wide limit, fed by response headers.

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use http::HeaderMap;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroU32;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_SCOPE: &str = "x-ratelimit-scope";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Longest wait any rate-limit header or body can ask for
pub const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(60 * 60);

/// How long a bucket reported as empty stays closed when no reset was given
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(1);

/// Seconds from a header or body as a wait, capped at [`MAX_RATE_LIMIT_DELAY`].
/// Negative and NaN values are rejected.
pub(crate) fn capped_seconds(seconds: f64) -> Option<Duration> {
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(seconds)
            .map_or(MAX_RATE_LIMIT_DELAY, |d| d.min(MAX_RATE_LIMIT_DELAY)),
    )
}

/// Rate-limit headers of one response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// `X-RateLimit-Reset`, epoch seconds
    pub reset: Option<f64>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };
        let number = |name: &str| text(name).and_then(|v| v.parse::<f64>().ok());
        let seconds = |name: &str| number(name).and_then(capped_seconds);

        Self {
            limit: text(HEADER_LIMIT).and_then(|v| v.parse().ok()),
            remaining: text(HEADER_REMAINING).and_then(|v| v.parse().ok()),
            reset: number(HEADER_RESET),
            reset_after: seconds(HEADER_RESET_AFTER),
            bucket: text(HEADER_BUCKET).map(str::to_string),
            global: text(HEADER_GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            scope: text(HEADER_SCOPE).map(str::to_string),
            retry_after: seconds(HEADER_RETRY_AFTER),
        }
    }

    /// Whether the limit applies to every route
    pub fn is_global(&self) -> bool {
        self.global || self.scope.as_deref() == Some("global")
    }

    /// Time until the bucket resets. Prefers `Reset-After` over the wall clock.
    pub fn reset_delay(&self) -> Option<Duration> {
        if let Some(after) = self.reset_after {
            return Some(after);
        }
        let reset = self.reset?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
        capped_seconds((reset - now).max(0.0))
    }
}

/// Result of asking a bucket for budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Dispatch now
    Ready,
    /// Bucket exhausted until the given instant
    WaitUntil(Instant),
}

/// Remaining budget of one route group.
///
/// `remaining` is `None` until a response has reported the bucket, which
/// lets the first request through.
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    key: String,
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    bucket_id: Option<String>,
}

impl RateLimitBucket {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            limit: None,
            remaining: None,
            reset_at: None,
            bucket_id: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn remaining(&self) -> Option<u32> {
        self.remaining
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.reset_at
    }

    /// Server-side bucket hash, if reported
    pub fn bucket_id(&self) -> Option<&str> {
        self.bucket_id.as_deref()
    }

    /// Whether no response has described this bucket yet
    pub fn is_unknown(&self) -> bool {
        self.remaining.is_none()
    }

    /// Take one call from the budget, or report when budget returns.
    pub fn try_acquire(&mut self, now: Instant) -> Acquire {
        if let Some(reset_at) = self.reset_at {
            if now >= reset_at {
                // Optimistic refresh, corrected by the next response
                self.remaining = self.limit;
                self.reset_at = None;
            }
        }

        match self.remaining {
            None => Acquire::Ready,
            Some(0) => {
                // Empty without a reported reset
                let reset_at = *self
                    .reset_at
                    .get_or_insert_with(|| now.checked_add(DEFAULT_RESET_AFTER).unwrap_or(now));
                Acquire::WaitUntil(reset_at)
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                Acquire::Ready
            }
        }
    }

    /// Apply the headers of a response
    pub fn update(&mut self, headers: &RateLimitHeaders, now: Instant) {
        if let Some(limit) = headers.limit {
            self.limit = Some(limit);
        }
        if let Some(remaining) = headers.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(reset_at) = headers.reset_delay().and_then(|d| now.checked_add(d)) {
            self.reset_at = Some(reset_at);
        }
        if let Some(bucket) = &headers.bucket {
            self.bucket_id = Some(bucket.clone());
        }
    }

    /// Mark the bucket empty until `until` (after a 429)
    pub fn exhaust_until(&mut self, until: Instant) {
        self.remaining = Some(0);
        self.reset_at = Some(match self.reset_at {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

/// Limiter clock over tokio's `Instant`, so paused time drives it
#[derive(Debug, Clone)]
struct TokioClock {
    origin: Instant,
}

impl Clock for TokioClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(Instant::now().saturating_duration_since(self.origin))
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<Nanos>>;

/// Calls-per-window limit shared by every bucket, plus the pause set by a
/// global 429.
///
/// Calls are spaced `window / limit` apart (GCRA), so no rolling window of
/// length `window` ever holds more than `limit` calls.
pub struct GlobalRateLimit {
    limiter: DirectLimiter,
    clock: TokioClock,
    paused_until: Mutex<Option<Instant>>,
}

impl fmt::Debug for GlobalRateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalRateLimit")
            .field("paused_until", &*self.paused_until.lock())
            .finish_non_exhaustive()
    }
}

impl GlobalRateLimit {
    pub fn new(limit: u32, window: Duration) -> Self {
        let period = (window / limit.max(1)).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        let clock = TokioClock {
            origin: Instant::now(),
        };

        Self {
            limiter: RateLimiter::direct_with_clock(quota, clock.clone()),
            clock,
            paused_until: Mutex::new(None),
        }
    }

    /// Wait for a global slot and take it
    pub async fn acquire(&self) {
        loop {
            if let Some(until) = self.paused_until() {
                debug!("Global rate limit paused, waiting until {:?}", until);
                tokio::time::sleep_until(until).await;
                continue;
            }

            match self.limiter.check() {
                Ok(()) => return,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    trace!("Global rate limit reached, waiting {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Block every bucket until `until`
    pub fn pause_until(&self, until: Instant) {
        let mut paused = self.paused_until.lock();
        if paused.map_or(true, |existing| until > existing) {
            *paused = Some(until);
        }
    }

    /// End of the current global pause, if one is in force
    pub fn paused_until(&self) -> Option<Instant> {
        let mut paused = self.paused_until.lock();
        match *paused {
            Some(until) if until > Instant::now() => Some(until),
            _ => {
                *paused = None;
                None
            }
        }
    }
}
