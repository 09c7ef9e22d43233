//! URL-test group: the cached fast-path selector.
//!
//! Selection ranks provider-supplied endpoints by measured throughput, then
//! latency against the group's test URL, with a tolerance band so the pick
//! does not oscillate between near-equal endpoints. The whole computation is
//! memoized behind a single-flight cell; dial failures past a threshold
//! invalidate the memo and schedule a fresh probe round.

use crate::adapter::{BoxedDatagram, BoxedStream, ProtocolTag};
use crate::error::{CoreError, Result};
use crate::health::DEFAULT_TEST_URL;
use crate::net::callback::FirstWriteStream;
use crate::outbound::Endpoint;
use crate::provider::Provider;
use crate::types::Metadata;
use crate::util::ranges::StatusRanges;
use crate::util::single::SingleFlight;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How long one selection stays memoized.
const SELECTION_TTL: Duration = Duration::from_secs(10);

/// Dial failures inside this window count toward the recheck threshold.
const FAILURE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct UrlTestOptions {
    pub name: String,
    pub test_url: String,
    /// `/`-separated status codes or ranges accepted by probes; empty means
    /// any status satisfies.
    pub expected_status: String,
    /// Hysteresis margin in milliseconds: the pick only moves to a candidate
    /// at least this much faster.
    pub tolerance: u16,
    pub disable_udp: bool,
    pub hidden: bool,
    pub icon: String,
    /// Dial failures tolerated within the window before forcing a recheck.
    pub max_failed_times: u32,
}

impl Default for UrlTestOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            test_url: DEFAULT_TEST_URL.to_string(),
            expected_status: String::new(),
            tolerance: 0,
            disable_udp: false,
            hidden: false,
            icon: String::new(),
            max_failed_times: 5,
        }
    }
}

#[derive(Default)]
struct FailureWindow {
    count: u32,
    since: Option<Instant>,
}

pub struct UrlTestGroup {
    name: String,
    test_url: String,
    expected_status: String,
    expected: Option<StatusRanges>,
    tolerance: u16,
    disable_udp: bool,
    hidden: bool,
    icon: String,
    max_failed_times: u32,
    providers: Vec<Arc<dyn Provider>>,
    /// Manual override; selection falls through when the named endpoint is
    /// missing or dead for the test URL.
    selected: RwLock<Option<String>>,
    /// Previous pick, the hysteresis anchor.
    fast_node: RwLock<Option<Arc<Endpoint>>>,
    single: SingleFlight<Option<Arc<Endpoint>>>,
    failures: Mutex<FailureWindow>,
    /// Used by deferred callbacks (first-write hooks, recheck tasks)
    /// without keeping the group alive; the checker side never owns the
    /// group, which breaks the group ↔ checker reference cycle.
    self_ref: Weak<UrlTestGroup>,
}

impl UrlTestGroup {
    pub fn new(
        options: UrlTestOptions,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Result<Arc<Self>> {
        let expected = if options.expected_status.is_empty() {
            None
        } else {
            Some(options.expected_status.parse()?)
        };
        Ok(Arc::new_cyclic(|weak| Self {
            name: options.name,
            test_url: options.test_url,
            expected_status: options.expected_status,
            expected,
            tolerance: options.tolerance,
            disable_udp: options.disable_udp,
            hidden: options.hidden,
            icon: options.icon,
            max_failed_times: options.max_failed_times,
            providers,
            selected: RwLock::new(None),
            fast_node: RwLock::new(None),
            single: SingleFlight::new(SELECTION_TTL),
            failures: Mutex::new(FailureWindow::default()),
            self_ref: weak.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test_url(&self) -> &str {
        &self.test_url
    }

    pub fn protocol(&self) -> ProtocolTag {
        ProtocolTag::UrlTest
    }

    /// All endpoints currently supplied by the providers, in provider order.
    /// Touching defers lazy-checker idle suspension.
    pub fn endpoints(&self, touch: bool) -> Vec<Arc<Endpoint>> {
        let mut list = Vec::new();
        for provider in &self.providers {
            if touch {
                provider.touch();
            }
            list.extend(provider.endpoints());
        }
        list
    }

    fn touch_providers(&self) {
        for provider in &self.providers {
            provider.touch();
        }
    }

    /// The selection fast path. Memoized for [`SELECTION_TTL`]; concurrent
    /// callers coalesce onto one computation. Returns `None` only when the
    /// providers supply no endpoints at all.
    pub async fn fast(&self, touch: bool) -> Option<Arc<Endpoint>> {
        let (node, shared) = self
            .single
            .run(|| async { self.pick(&self.endpoints(touch)) })
            .await;
        // A coalesced result bypassed the per-provider touch path, so touch
        // explicitly on behalf of this caller.
        if shared && touch {
            self.touch_providers();
        }
        node
    }

    fn pick(&self, endpoints: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        if endpoints.is_empty() {
            *self.fast_node.write() = None;
            return None;
        }

        if let Some(wanted) = self.selected.read().clone() {
            for ep in endpoints {
                if !ep.alive_for(&self.test_url) {
                    continue;
                }
                if ep.name() == wanted {
                    *self.fast_node.write() = Some(ep.clone());
                    return Some(ep.clone());
                }
            }
            // Override endpoint missing or dead: fall through to the
            // normal ranking.
        }

        let previous = self.fast_node.read().clone();
        let mut previous_present = false;

        // Throughput data, when any exists, dominates latency.
        let mut by_speed: Option<(Arc<Endpoint>, f64)> = None;

        // The delay scan seeds with the head of the list whether or not it
        // is alive, so a fully-dead set still yields a deterministic pick.
        let mut by_delay = endpoints[0].clone();
        let mut min_delay = by_delay.last_delay_for(&self.test_url);

        for ep in endpoints {
            if let Some(prev) = &previous {
                if ep.name() == prev.name() {
                    previous_present = true;
                }
            }
            if !ep.alive_for(&self.test_url) {
                continue;
            }
            let speed = ep.last_speed();
            if speed > 0.0 && by_speed.as_ref().map_or(true, |(_, best)| speed > *best) {
                by_speed = Some((ep.clone(), speed));
            }
            let delay = ep.last_delay_for(&self.test_url);
            if delay < min_delay {
                by_delay = ep.clone();
                min_delay = delay;
            }
        }

        if let Some((ep, _)) = by_speed {
            *self.fast_node.write() = Some(ep.clone());
            return Some(ep);
        }

        // Keep the previous pick unless the candidate beats it by more than
        // the tolerance band (or the previous pick is gone or dead).
        let chosen = match previous {
            Some(prev)
                if previous_present
                    && prev.alive_for(&self.test_url)
                    && prev.last_delay_for(&self.test_url)
                        <= by_delay
                            .last_delay_for(&self.test_url)
                            .saturating_add(self.tolerance) =>
            {
                prev
            }
            _ => by_delay,
        };
        *self.fast_node.write() = Some(chosen.clone());
        Some(chosen)
    }

    /// Name of the current pick; empty when the group is empty.
    pub async fn now(&self) -> String {
        match self.fast(false).await {
            Some(ep) => ep.name().to_string(),
            None => String::new(),
        }
    }

    /// Pins the selection to a named endpoint, verifying it exists.
    pub fn set(&self, name: &str) -> Result<()> {
        if !self.endpoints(false).iter().any(|ep| ep.name() == name) {
            return Err(CoreError::UnknownEndpoint(name.to_string()));
        }
        self.force_set(Some(name));
        Ok(())
    }

    /// Pins (or clears) the selection without checking membership, and
    /// invalidates the memoized pick.
    pub fn force_set(&self, name: Option<&str>) {
        *self.selected.write() = name.map(str::to_owned);
        self.single.reset();
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.read().clone()
    }

    /// Invalidate, probe every provider's endpoints, invalidate again so the
    /// next selection sees fresh telemetry.
    pub async fn health_check(&self) {
        self.single.reset();
        futures::future::join_all(self.providers.iter().map(|p| p.health_check())).await;
        self.single.reset();
    }

    /// Probes every current endpoint against the group URL; returns the
    /// delay of each probe that succeeded.
    pub async fn url_test_all(&self) -> HashMap<String, u16> {
        let endpoints = self.endpoints(false);
        let probes = endpoints.iter().map(|ep| async {
            let outcome = ep.url_test(&self.test_url, self.expected.as_ref()).await;
            (ep.name().to_string(), outcome)
        });
        let mut delays = HashMap::new();
        for (name, outcome) in futures::future::join_all(probes).await {
            if let Ok(delay) = outcome {
                delays.insert(name, delay);
            }
        }
        delays
    }

    /// Dials the destination through the current pick. Failures feed the
    /// group's failure window; streams of lazily-handshaking adapters are
    /// wrapped so a first-write failure is accounted the same way.
    pub async fn dial(&self, metadata: &Metadata) -> io::Result<BoxedStream> {
        let Some(endpoint) = self.fast(true).await else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no endpoint available in group {}", self.name),
            ));
        };
        match endpoint.dial(metadata).await {
            Ok(stream) => {
                self.on_dial_success();
                if endpoint.adapter().handshake_on_first_write() {
                    let group = self.self_ref.clone();
                    let protocol = endpoint.protocol();
                    let wrapped = FirstWriteStream::new(
                        stream,
                        Box::new(move |outcome| {
                            if let Some(group) = group.upgrade() {
                                match outcome {
                                    Ok(()) => group.on_dial_success(),
                                    Err(e) => group.on_dial_failed(protocol, &e),
                                }
                            }
                        }),
                    );
                    Ok(Box::new(wrapped))
                } else {
                    Ok(stream)
                }
            }
            Err(e) => {
                self.on_dial_failed(endpoint.protocol(), &e);
                Err(e)
            }
        }
    }

    pub async fn listen_udp(&self, metadata: &Metadata) -> io::Result<BoxedDatagram> {
        let Some(endpoint) = self.fast(true).await else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no endpoint available in group {}", self.name),
            ));
        };
        match endpoint.listen_udp(metadata).await {
            Ok(datagram) => {
                self.on_dial_success();
                Ok(datagram)
            }
            Err(e) => {
                self.on_dial_failed(endpoint.protocol(), &e);
                Err(e)
            }
        }
    }

    pub async fn supports_udp(&self) -> bool {
        if self.disable_udp {
            return false;
        }
        match self.fast(false).await {
            Some(ep) => ep.supports_udp(),
            None => false,
        }
    }

    fn on_dial_success(&self) {
        let mut window = self.failures.lock();
        window.count = 0;
        window.since = None;
    }

    fn on_dial_failed(&self, protocol: ProtocolTag, err: &io::Error) {
        tracing::warn!(
            group = %self.name,
            protocol = %protocol,
            error = %err,
            "dial through group failed"
        );
        let tripped = {
            let mut window = self.failures.lock();
            let now = Instant::now();
            match window.since {
                Some(since) if now.duration_since(since) <= FAILURE_WINDOW => {}
                _ => {
                    window.since = Some(now);
                    window.count = 0;
                }
            }
            window.count += 1;
            if window.count >= self.max_failed_times {
                window.count = 0;
                window.since = None;
                true
            } else {
                false
            }
        };
        if tripped {
            tracing::warn!(group = %self.name, "failure threshold reached, rechecking endpoints");
            if let Some(group) = self.self_ref.upgrade() {
                tokio::spawn(async move {
                    group.health_check().await;
                });
            }
        }
    }

    /// Serialized control-surface view.
    pub async fn as_json(&self) -> serde_json::Value {
        let all: Vec<String> = self
            .endpoints(false)
            .iter()
            .map(|ep| ep.name().to_string())
            .collect();
        json!({
            "type": self.protocol().as_str(),
            "now": self.now().await,
            "all": all,
            "testUrl": self.test_url,
            "expectedStatus": self.expected_status,
            "fixed": self.selected.read().clone().unwrap_or_default(),
            "hidden": self.hidden,
            "icon": self.icon,
        })
    }
}

#[cfg(test)]
#[path = "urltest_tests.rs"]
mod urltest_tests;
