use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

const NANOS_PER_SEC: u128 = Duration::from_secs(1).as_nanos();

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Fixed-capacity token bucket with continuous, whole-token refill.
///
/// Capacity and refill rate are the same number: a bucket configured for
/// `N` requests per second holds at most `N` tokens and regains `N` tokens
/// per second. A new bucket starts full, so the first burst of up to `N`
/// requests from a previously unseen client is never throttled.
///
/// The state is reconstructible from `last_refill` alone, no background
/// timer is needed for correctness.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens.
    pub fn new(capacity: u32) -> Self {
        Self::with_instant(capacity, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn with_instant(capacity: u32, now: Instant) -> Self {
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Try to take one token, returning whether the request is admitted.
    pub fn try_consume(&self) -> bool {
        self.try_consume_at(Instant::now())
    }

    /// Same as [`TokenBucket::try_consume`] with an explicit clock reading.
    pub fn try_consume_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().expect("poisoned");

        let elapsed = now.saturating_duration_since(state.last_refill);
        let new_tokens = (elapsed.as_nanos().saturating_mul(u128::from(self.capacity))
            / NANOS_PER_SEC)
            .min(u128::from(self.capacity)) as u32;

        // Fractional progress is discarded when the clock advances.
        if new_tokens > 0 {
            state.tokens = state.tokens.saturating_add(new_tokens).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, without refilling.
    pub fn available(&self) -> u32 {
        self.state.lock().expect("poisoned").tokens
    }
}
