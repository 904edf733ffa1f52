use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::token_bucket::TokenBucket;

/// Tuning for [`PerClientRateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests per second granted to each client, also the burst size
    pub rate: NonZeroU32,
    /// How often the identity table is checked against `max_clients`
    pub cleanup_interval: Duration,
    /// Identity table size above which the whole table is cleared
    pub max_clients: usize,
}

impl RateLimiterConfig {
    pub fn new(rate: NonZeroU32) -> Self {
        Self {
            rate,
            cleanup_interval: Duration::from_secs(300),
            max_clients: 1000,
        }
    }
}

/// Token-bucket admission control keyed by client identity (IP address).
///
/// Buckets are created lazily under the table lock on first sight of an
/// identity; the consume itself only takes that bucket's own lock, so
/// unrelated clients never contend on a single global lock.
///
/// Eviction is coarse: when the table grows past `max_clients` the periodic
/// cleanup drops every bucket. Legitimate clients briefly regain a full
/// budget when that happens; this is accepted behavior.
#[derive(Debug)]
pub struct PerClientRateLimiter {
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    rate: AtomicU32,
    cleanup_interval: Duration,
    max_clients: usize,
}

impl PerClientRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate: AtomicU32::new(config.rate.get()),
            cleanup_interval: config.cleanup_interval,
            max_clients: config.max_clients,
        }
    }

    /// Current per-client rate in requests per second.
    pub fn rate(&self) -> u32 {
        self.rate.load(Ordering::Acquire)
    }

    /// Decide whether a request from `identity` is admitted.
    pub fn allow(&self, identity: &str) -> bool {
        let bucket = {
            let mut buckets = self.buckets.lock().expect("poisoned");
            match buckets.get(identity) {
                Some(bucket) => bucket.clone(),
                None => {
                    let bucket = Arc::new(TokenBucket::new(self.rate()));
                    buckets.insert(identity.to_string(), bucket.clone());
                    bucket
                }
            }
        };

        bucket.try_consume()
    }

    /// Replace the rate for every client.
    ///
    /// Every existing bucket is recreated full at the new capacity, which
    /// resets all clients' histories.
    pub fn set_rate(&self, rate: NonZeroU32) {
        let mut buckets = self.buckets.lock().expect("poisoned");
        self.rate.store(rate.get(), Ordering::Release);
        for bucket in buckets.values_mut() {
            *bucket = Arc::new(TokenBucket::new(rate.get()));
        }
        info!(
            requests_per_second = rate.get(),
            clients = buckets.len(),
            "Rate limit updated"
        );
    }

    /// Number of identities currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().expect("poisoned").len()
    }

    /// Clear the identity table if it exceeds the size ceiling.
    ///
    /// Returns the number of evicted identities.
    pub fn cleanup(&self) -> usize {
        let mut buckets = self.buckets.lock().expect("poisoned");
        if buckets.len() <= self.max_clients {
            return 0;
        }
        let evicted = buckets.len();
        buckets.clear();
        evicted
    }

    /// Run the periodic cleanup until `token` is cancelled.
    pub async fn run_cleanup(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.cleanup_interval);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Rate limiter cleanup stopped");
                    break;
                }
                _ = interval.tick() => {
                    let evicted = self.cleanup();
                    if evicted > 0 {
                        info!(evicted, max_clients = self.max_clients, "Rate limiter table cleared");
                    }
                }
            }
        }
    }
}
