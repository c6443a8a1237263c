//! Local (per-proxy) rate limiting with a global token bucket plus
//! descriptor-scoped buckets. Buckets are shared across workers; admission
//! and refill coordinate only through atomic compare-and-swap on the token
//! counters.

pub mod filter;

pub use filter::LocalRateLimitFilter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::{LocalRateLimitConfig, TokenBucketConfig};

/// One (key, value) element of a rate-limit descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorEntry {
    pub key: String,
    pub value: String,
}

impl DescriptorEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An ordered list of entries identifying one descriptor bucket.
/// Matching is set equality, so entries are normalized (sorted) before
/// lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalDescriptor {
    pub entries: Vec<DescriptorEntry>,
}

impl LocalDescriptor {
    pub fn new(entries: Vec<DescriptorEntry>) -> Self {
        Self { entries }.normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.entries.sort();
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    max_tokens: u32,
    tokens_per_fill: u32,
    fill_interval: Duration,
}

impl From<&TokenBucketConfig> for TokenBucket {
    fn from(config: &TokenBucketConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            tokens_per_fill: config.tokens_per_fill,
            fill_interval: Duration::from_millis(config.fill_interval_ms),
        }
    }
}

/// Atomic token counter plus the timestamp of the last refill.
#[derive(Debug)]
struct TokenState {
    tokens: AtomicU32,
    fill_time: Mutex<Instant>,
}

impl TokenState {
    fn new(initial: u32) -> Self {
        Self {
            tokens: AtomicU32::new(initial),
            fill_time: Mutex::new(Instant::now()),
        }
    }

    /// Take one token, failing when the bucket is empty.
    fn try_take(&self) -> bool {
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Undo a successful take. Saturates at `max_tokens` so a concurrent
    /// refill can never push the counter past the cap.
    fn give_back(&self, max_tokens: u32) {
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current >= max_tokens {
                return;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Add `tokens_per_fill`, capped at `max_tokens`, and stamp the fill
    /// time.
    fn fill(&self, bucket: &TokenBucket) {
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current >= bucket.max_tokens {
                break;
            }
            let next = current
                .saturating_add(bucket.tokens_per_fill)
                .min(bucket.max_tokens);
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        *self.fill_time.lock().expect("fill_time mutex poisoned") = Instant::now();
    }
}

#[derive(Debug)]
struct DescriptorBucket {
    bucket: TokenBucket,
    state: TokenState,
}

/// Token-bucket rate limiter shared across workers. Configuration is
/// immutable after construction; only the token counters move.
pub struct LocalRateLimiter {
    token_bucket: TokenBucket,
    tokens: TokenState,
    descriptors: HashMap<Vec<DescriptorEntry>, DescriptorBucket>,
}

impl LocalRateLimiter {
    pub fn new(config: &LocalRateLimitConfig) -> Self {
        let token_bucket = TokenBucket::from(&config.token_bucket);
        let mut descriptors = HashMap::new();
        for d in &config.descriptors {
            let entries = LocalDescriptor::new(
                d.entries
                    .iter()
                    .map(|kv| DescriptorEntry::new(kv.key.clone(), kv.value.clone()))
                    .collect(),
            )
            .entries;
            let bucket = TokenBucket::from(&d.token_bucket);
            descriptors.insert(
                entries,
                DescriptorBucket {
                    bucket,
                    state: TokenState::new(bucket.max_tokens),
                },
            );
        }
        debug!(
            max_tokens = token_bucket.max_tokens,
            descriptors = descriptors.len(),
            "local rate limiter configured"
        );
        Self {
            token_bucket,
            tokens: TokenState::new(token_bucket.max_tokens),
            descriptors,
        }
    }

    pub fn fill_interval(&self) -> Duration {
        self.token_bucket.fill_interval
    }

    /// Admit or reject one request. Every configured bucket matching a
    /// request descriptor is decremented, then the global bucket; if any
    /// decrement fails the earlier ones are compensated in reverse order
    /// so a denied call has zero net effect.
    pub fn request_allowed(&self, descriptors: &[LocalDescriptor]) -> bool {
        // (taken state, cap) pairs for rollback.
        let mut taken: Vec<(&TokenState, u32)> = Vec::new();

        for descriptor in descriptors {
            if let Some(bucket) = self.descriptors.get(descriptor.entries.as_slice()) {
                if bucket.state.try_take() {
                    taken.push((&bucket.state, bucket.bucket.max_tokens));
                } else {
                    trace!(?descriptor, "descriptor bucket exhausted");
                    Self::rollback(&mut taken);
                    return false;
                }
            }
        }

        if self.tokens.try_take() {
            true
        } else {
            trace!("global bucket exhausted");
            Self::rollback(&mut taken);
            false
        }
    }

    fn rollback(taken: &mut Vec<(&TokenState, u32)>) {
        while let Some((state, max)) = taken.pop() {
            state.give_back(max);
        }
    }

    /// One refill tick: the global bucket and every descriptor bucket gain
    /// their configured tokens, capped at their maxima.
    pub(crate) fn on_fill_timer(&self) {
        self.tokens.fill(&self.token_bucket);
        for bucket in self.descriptors.values() {
            bucket.state.fill(&bucket.bucket);
        }
    }

    /// Spawn the recurring refill task on the current tokio runtime.
    pub fn start_refill_task(self: Arc<Self>) -> JoinHandle<()> {
        let limiter = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.token_bucket.fill_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the initial
            // allowance is not doubled.
            interval.tick().await;
            loop {
                interval.tick().await;
                limiter.on_fill_timer();
            }
        })
    }

    #[cfg(test)]
    fn global_tokens(&self) -> u32 {
        self.tokens.tokens.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn descriptor_tokens(&self, descriptor: &LocalDescriptor) -> Option<u32> {
        self.descriptors
            .get(descriptor.entries.as_slice())
            .map(|b| b.state.tokens.load(Ordering::SeqCst))
    }
}
