//! Single-flight memoization with a TTL window.
//!
//! Concurrent callers coalesce onto one computation and all receive its
//! value; within the TTL the cached value is served without recomputing.
//! `reset` invalidates immediately and never blocks: any call sequenced
//! after a reset observes it and recomputes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    stored_at: Instant,
    generation: u64,
}

#[derive(Debug)]
pub struct SingleFlight<T> {
    ttl: Duration,
    generation: AtomicU64,
    slot: Mutex<Slot<T>>,
}

impl<T: Clone> SingleFlight<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            generation: AtomicU64::new(1),
            slot: Mutex::new(Slot {
                value: None,
                stored_at: Instant::now(),
                generation: 0,
            }),
        }
    }

    /// Runs `compute` unless a value from the current generation is still
    /// fresh. Returns the value and whether it was shared, i.e. served from
    /// the cache or from a computation another caller started.
    pub async fn run<F, Fut>(&self, compute: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut slot = self.slot.lock().await;
        let generation = self.generation.load(Ordering::Acquire);
        if slot.generation == generation && slot.stored_at.elapsed() < self.ttl {
            if let Some(value) = &slot.value {
                return (value.clone(), true);
            }
        }
        // Compute while holding the lock: late arrivals queue on it and then
        // take the stored result as a shared hit. The result is tagged with
        // the generation read before computing, so a reset that lands while
        // the computation runs still forces the next caller to recompute.
        let value = compute().await;
        slot.value = Some(value.clone());
        slot.stored_at = Instant::now();
        slot.generation = generation;
        (value, false)
    }

    /// Drops the cached value. Non-blocking.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}
