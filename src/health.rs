use tokio::time::{Duration, Instant};

/// Outcome of a heartbeat deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Previous beat was acknowledged; send the next one
    Send,
    /// Previous beat was never acknowledged
    Zombie,
}

/// Tracks heartbeat liveness for a single connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,

    /// When the next periodic beat is due
    next_due: Instant,

    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Time of last ack received
    last_acked: Option<Instant>,

    /// Whether we're currently waiting for an ack
    awaiting_ack: bool,

    /// Round trip of the last acknowledged beat
    latency: Option<Duration>,
}

impl HeartbeatMonitor {
    /// Create a monitor whose first beat is due after `interval * jitter`.
    ///
    /// `jitter` is clamped to `[0, 1]`.
    pub fn new(interval: Duration, jitter: f64) -> Self {
        let jitter = jitter.clamp(0.0, 1.0);
        Self {
            interval,
            next_due: Instant::now() + interval.mul_f64(jitter),
            last_sent: None,
            last_acked: None,
            awaiting_ack: false,
            latency: None,
        }
    }

    /// Create a monitor with a random first-beat jitter
    pub fn with_random_jitter(interval: Duration) -> Self {
        Self::new(interval, rand::random::<f64>())
    }

    /// Deadline of the next periodic beat
    pub fn next_deadline(&self) -> Instant {
        self.next_due
    }

    /// Called when the deadline fires. Schedules the following deadline.
    pub fn on_deadline(&mut self) -> Beat {
        self.next_due = Instant::now() + self.interval;
        if self.awaiting_ack {
            Beat::Zombie
        } else {
            Beat::Send
        }
    }

    /// Record that we sent a heartbeat
    pub fn record_sent(&mut self) {
        self.last_sent = Some(Instant::now());
        self.awaiting_ack = true;
    }

    /// Record that we received an ack
    pub fn record_ack(&mut self) {
        let now = Instant::now();
        self.last_acked = Some(now);
        self.latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
        self.awaiting_ack = false;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn last_acked(&self) -> Option<Instant> {
        self.last_acked
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_beat_uses_jitter() {
        let start = Instant::now();
        let monitor = HeartbeatMonitor::new(Duration::from_millis(1000), 0.25);
        assert_eq!(monitor.next_deadline() - start, Duration::from_millis(250));

        let monitor = HeartbeatMonitor::with_random_jitter(Duration::from_millis(1000));
        assert!(monitor.next_deadline() - start <= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_cycle() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_millis(100), 0.0);

        assert_eq!(monitor.on_deadline(), Beat::Send);
        monitor.record_sent();
        assert!(monitor.is_awaiting_ack());

        tokio::time::advance(Duration::from_millis(20)).await;
        monitor.record_ack();
        assert!(!monitor.is_awaiting_ack());
        assert_eq!(monitor.latency(), Some(Duration::from_millis(20)));

        tokio::time::sleep_until(monitor.next_deadline()).await;
        assert_eq!(monitor.on_deadline(), Beat::Send);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_ack_is_zombie() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_millis(100), 0.0);

        assert_eq!(monitor.on_deadline(), Beat::Send);
        monitor.record_sent();

        tokio::time::sleep_until(monitor.next_deadline()).await;
        assert_eq!(monitor.on_deadline(), Beat::Zombie);
        assert!(monitor.last_acked().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_advances_by_interval() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_millis(100), 0.0);
        monitor.on_deadline();
        let first = monitor.next_deadline();
        tokio::time::advance(Duration::from_millis(100)).await;
        monitor.on_deadline();
        assert_eq!(monitor.next_deadline() - first, Duration::from_millis(100));
    }
}
