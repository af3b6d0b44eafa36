use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Spaces identifies per concurrency bucket.
///
/// Shard `id` belongs to bucket `id % max_concurrency`. Within a bucket one
/// shard identifies at a time and successive identifies are at least
/// `interval` apart. Different buckets never wait on each other.
#[derive(Debug)]
pub struct IdentifyThrottle {
    interval: Duration,
    /// Time of the last identify per bucket
    buckets: Vec<Mutex<Option<Instant>>>,
}

impl IdentifyThrottle {
    pub fn new(max_concurrency: u32, interval: Duration) -> Self {
        let buckets = (0..max_concurrency.max(1)).map(|_| Mutex::new(None)).collect();
        Self { interval, buckets }
    }

    pub fn max_concurrency(&self) -> u32 {
        self.buckets.len() as u32
    }

    pub fn bucket_for(&self, shard_id: u32) -> usize {
        (shard_id as usize) % self.buckets.len()
    }

    /// Wait until `shard_id` may send identify. The slot is consumed on return.
    pub async fn acquire(&self, shard_id: u32) {
        let bucket = self.bucket_for(shard_id);
        let mut last = self.buckets[bucket].lock().await;

        if let Some(at) = *last {
            let ready_at = at + self.interval;
            if ready_at > Instant::now() {
                debug!(
                    "[SHARD-{}] Waiting {:?} for identify slot in bucket {}",
                    shard_id,
                    ready_at - Instant::now(),
                    bucket
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_same_bucket_is_spaced() {
        let throttle = Arc::new(IdentifyThrottle::new(1, Duration::from_secs(5)));
        let start = Instant::now();

        let mut tasks = Vec::new();
        for shard_id in 0..3 {
            let throttle = throttle.clone();
            tasks.push(tokio::spawn(async move {
                throttle.acquire(shard_id).await;
                Instant::now() - start
            }));
        }

        let mut times = Vec::new();
        for task in tasks {
            times.push(task.await.unwrap());
        }
        times.sort();

        assert_eq!(times[0], Duration::ZERO);
        assert!(times[1] >= Duration::from_secs(5));
        assert!(times[2] >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_independent() {
        let throttle = Arc::new(IdentifyThrottle::new(4, Duration::from_secs(5)));
        let start = Instant::now();

        // Shards 0..4 each land in their own bucket
        for shard_id in 0..4 {
            throttle.acquire(shard_id).await;
        }
        assert_eq!(Instant::now() - start, Duration::ZERO);

        // Shard 4 shares bucket 0 with shard 0
        throttle.acquire(4).await;
        assert_eq!(Instant::now() - start, Duration::from_secs(5));
        assert_eq!(throttle.bucket_for(4), 0);
    }

    #[test]
    fn test_zero_concurrency_is_one_bucket() {
        let throttle = IdentifyThrottle::new(0, Duration::from_secs(5));
        assert_eq!(throttle.max_concurrency(), 1);
    }
}
