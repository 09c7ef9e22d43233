//! Periodic probe driver for a set of endpoints.
//!
//! A checker with a non-zero interval is "auto": its `process` loop runs in
//! the background until closed. Lazy checkers only probe when someone has
//! touched them since the previous tick, so idle groups stop generating
//! probe traffic.

use crate::outbound::Endpoint;
use crate::util::env::env_duration_ms;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";

/// Shared deadline for one probe round.
fn test_timeout() -> Duration {
    env_duration_ms("FG_TEST_TIMEOUT_MS", 5_000)
}

pub struct HealthCheck {
    url: String,
    interval: Duration,
    lazy: bool,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    touched: AtomicBool,
    cancel: CancellationToken,
}

impl HealthCheck {
    pub fn new(
        endpoints: Vec<Arc<Endpoint>>,
        url: impl Into<String>,
        interval: Duration,
        lazy: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            interval,
            lazy,
            endpoints: RwLock::new(endpoints),
            touched: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Whether this checker drives itself on a timer.
    pub fn auto(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Tick loop; spawned once per auto checker and exits on `close`.
    pub async fn process(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.lazy || self.touched.swap(false, Ordering::Relaxed) {
                        self.check().await;
                    } else {
                        tracing::trace!(url = %self.url, "skipping idle probe round");
                    }
                }
            }
        }
    }

    /// One probe round: every endpoint concurrently, under a shared
    /// deadline. Individual failures are consumed here; they are already
    /// recorded in the endpoints' telemetry.
    pub async fn check(&self) {
        let endpoints = self.endpoints.read().clone();
        if endpoints.is_empty() {
            return;
        }
        let deadline = test_timeout();
        tracing::debug!(count = endpoints.len(), url = %self.url, "probe round");
        let probes = endpoints.into_iter().map(|ep| {
            let url = self.url.clone();
            async move {
                match tokio::time::timeout(deadline, ep.url_test(&url, None)).await {
                    Ok(Ok(delay)) => {
                        tracing::trace!(endpoint = ep.name(), delay_ms = delay, "probe ok");
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(endpoint = ep.name(), error = %e, "probe failed");
                    }
                    Err(_) => {
                        tracing::debug!(endpoint = ep.name(), "probe timed out");
                    }
                }
            }
        });
        futures::future::join_all(probes).await;
    }

    /// Signals that the endpoints are actively needed, arming the next lazy
    /// tick.
    pub fn touch(&self) {
        self.touched.store(true, Ordering::Relaxed);
    }

    /// Atomically replaces the probed set.
    pub fn set_endpoints(&self, endpoints: Vec<Arc<Endpoint>>) {
        *self.endpoints.write() = endpoints;
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().clone()
    }

    /// Stops the tick loop. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}
