//! Per-endpoint telemetry: liveness flags, bounded delay/throughput history,
//! and the probes that feed them.
//!
//! Every endpoint keeps one global state and one state per test URL it has
//! ever been probed against. Probes commit telemetry on every exit path —
//! success, failure, timeout or cancellation — through a scope-exit guard.

use crate::adapter::{BoxedDatagram, BoxedStream, EndpointAdapter, ProtocolTag};
use crate::error::{CoreError, Result};
use crate::history::{HistoryRing, Sample};
use crate::net::probe;
use crate::types::Metadata;
use crate::util::flags;
use crate::util::ranges::StatusRanges;
use dashmap::DashMap;
use serde_json::json;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Sentinel returned by delay accessors when an endpoint is unusable.
pub const DELAY_UNREACHABLE: u16 = u16::MAX;

/// Liveness flag plus bounded probe history.
#[derive(Debug)]
pub struct UrlState {
    alive: AtomicBool,
    history: HistoryRing,
}

impl UrlState {
    fn new(alive: bool) -> Self {
        Self {
            alive: AtomicBool::new(alive),
            history: HistoryRing::new(),
        }
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn history(&self) -> &HistoryRing {
        &self.history
    }
}

/// An upstream endpoint with live telemetry wrapped around its adapter.
///
/// Endpoint identity is the wrapper, not the name: when a provider refreshes
/// its set, replaced endpoints start from blank telemetry even if their
/// names match the previous generation.
pub struct Endpoint {
    adapter: Arc<dyn EndpointAdapter>,
    alive: AtomicBool,
    history: HistoryRing,
    extra: DashMap<String, Arc<UrlState>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name())
            .field("protocol", &self.protocol())
            .field("alive", &self.alive())
            .finish()
    }
}

impl Endpoint {
    pub fn new(adapter: Arc<dyn EndpointAdapter>) -> Self {
        Self {
            adapter,
            alive: AtomicBool::new(true),
            history: HistoryRing::new(),
            extra: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub fn protocol(&self) -> ProtocolTag {
        self.adapter.protocol()
    }

    pub fn adapter(&self) -> &Arc<dyn EndpointAdapter> {
        &self.adapter
    }

    pub fn supports_udp(&self) -> bool {
        self.adapter.supports_udp()
    }

    pub fn supports_uot(&self) -> bool {
        self.adapter.supports_uot()
    }

    /// Opens a connection through the adapter. Does not touch telemetry;
    /// failure accounting on the data plane belongs to the group layer.
    pub async fn dial(&self, metadata: &Metadata) -> io::Result<BoxedStream> {
        self.adapter.dial(metadata).await
    }

    pub async fn listen_udp(&self, metadata: &Metadata) -> io::Result<BoxedDatagram> {
        self.adapter.listen_udp(metadata).await
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Per-URL liveness when that URL was ever probed, global otherwise.
    pub fn alive_for(&self, url: &str) -> bool {
        match self.extra.get(url) {
            Some(state) => state.alive(),
            None => self.alive(),
        }
    }

    /// Most recent global delay; the unreachable sentinel when dead or
    /// unmeasured.
    pub fn last_delay(&self) -> u16 {
        if !self.alive() {
            return DELAY_UNREACHABLE;
        }
        match self.history.last().delay {
            0 => DELAY_UNREACHABLE,
            delay => delay,
        }
    }

    /// Most recent delay against `url`; the unreachable sentinel when the
    /// URL was never probed, the endpoint is dead for it, or unmeasured.
    pub fn last_delay_for(&self, url: &str) -> u16 {
        let Some(state) = self.extra.get(url) else {
            return DELAY_UNREACHABLE;
        };
        let last = state.history.last();
        if !state.alive() || last.delay == 0 {
            return DELAY_UNREACHABLE;
        }
        last.delay
    }

    /// Most recent download speed, zero when dead or unmeasured.
    pub fn last_speed(&self) -> f64 {
        if !self.alive() {
            return 0.0;
        }
        self.history.last().speed
    }

    pub fn delay_history(&self) -> Vec<Sample> {
        self.history.snapshot()
    }

    pub fn delay_history_for(&self, url: &str) -> Vec<Sample> {
        self.extra
            .get(url)
            .map(|state| state.history.snapshot())
            .unwrap_or_default()
    }

    /// Per-URL telemetry for serialization. Iteration is a best-effort
    /// snapshot of the concurrent map, not a frozen view.
    pub fn extra_delay_histories(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for entry in self.extra.iter() {
            map.insert(
                entry.key().clone(),
                json!({
                    "alive": entry.value().alive(),
                    "history": entry.value().history.snapshot(),
                }),
            );
        }
        serde_json::Value::Object(map)
    }

    /// Measures the HEAD round trip to `url` through this endpoint.
    ///
    /// Telemetry is committed exactly once whichever way the probe exits:
    /// the guard records a failure unless the probe marks itself complete,
    /// and also runs when the future is cancelled by a caller's deadline.
    pub async fn url_test(
        &self,
        url: &str,
        expected_status: Option<&StatusRanges>,
    ) -> Result<u16> {
        let mut guard = ProbeGuard::new(self, url);

        let target = probe::parse_probe_url(url)?;
        let metadata = target.metadata()?;
        let unified = flags::unified_delay();

        let mut start = Instant::now();
        let stream = self.adapter.dial(&metadata).await.map_err(CoreError::Dial)?;
        let mut stream: BoxedStream = if target.tls {
            probe::tls_handshake(stream, &target.host).await?
        } else {
            stream
        };

        let mut status = tokio::time::timeout(
            probe::REQUEST_TIMEOUT,
            probe::head_roundtrip(&mut stream, &target),
        )
        .await
        .map_err(|_| CoreError::Timeout(probe::REQUEST_TIMEOUT))??;

        if unified {
            // Repeat the request on the established connection and time only
            // the second round trip, excluding connection setup. A failed
            // second request keeps the first measurement.
            let second_start = Instant::now();
            let second = tokio::time::timeout(
                probe::REQUEST_TIMEOUT,
                probe::head_roundtrip(&mut stream, &target),
            )
            .await;
            match second {
                Ok(Ok(second_status)) => {
                    status = second_status;
                    start = second_start;
                }
                Ok(Err(e)) => self.warn_second_probe(url, &e.to_string()),
                Err(_) => self.warn_second_probe(url, "timed out"),
            }
        }

        let satisfied = expected_status.map_or(true, |ranges| ranges.contains(status));
        let delay = u16::try_from(start.elapsed().as_millis()).unwrap_or(u16::MAX);
        guard.succeed(delay, satisfied);
        Ok(delay)
    }

    fn warn_second_probe(&self, url: &str, reason: &str) {
        tracing::warn!(
            endpoint = self.name(),
            url,
            reason,
            "second probe failed; keeping the first measurement"
        );
        if url.starts_with("http://") {
            tracing::warn!(
                "plain-http test urls often reject repeated HEAD requests; prefer https"
            );
        }
    }

    /// Times a GET through the adapter for `timeout` and records the derived
    /// bytes-per-second estimate next to the most recent delay.
    pub async fn url_download(&self, timeout: Duration, url: &str) -> Result<f64> {
        let mut guard = DownloadGuard::new(self);

        let target = probe::parse_probe_url(url)?;
        let metadata = target.metadata()?;
        let stream = self.adapter.dial(&metadata).await.map_err(CoreError::Dial)?;
        let mut stream: BoxedStream = if target.tls {
            probe::tls_handshake(stream, &target.host).await?
        } else {
            stream
        };

        let speed = probe::download_speed(&mut stream, &target, timeout).await?;
        guard.succeed(speed);
        Ok(speed)
    }

    /// Commits one delay-probe outcome: global state first, then the per-URL
    /// entry (created on first probe). An unsatisfying status keeps the
    /// global delay but zeroes the per-URL record and marks it dead.
    pub(crate) fn record_probe(&self, url: &str, delay: u16, alive: bool, satisfied: bool) {
        self.alive.store(alive, Ordering::Relaxed);
        let mut sample = Sample {
            time: SystemTime::now(),
            delay: if alive { delay } else { 0 },
            speed: 0.0,
        };
        self.history.push(sample.clone());

        let state = self
            .extra
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(UrlState::new(true)))
            .clone();
        let mut url_alive = alive;
        if !satisfied {
            sample.delay = 0;
            url_alive = false;
        }
        state.alive.store(url_alive, Ordering::Relaxed);
        state.history.push(sample);
    }

    /// Commits one download-probe outcome into the global history.
    pub(crate) fn record_download(&self, speed: f64, ok: bool) {
        self.alive.store(ok, Ordering::Relaxed);
        let sample = if ok {
            Sample {
                time: SystemTime::now(),
                delay: self.last_delay(),
                speed,
            }
        } else {
            Sample {
                time: SystemTime::now(),
                delay: 0,
                speed: 0.0,
            }
        };
        self.history.push(sample);
    }

    /// Serialized view: the adapter's own fields merged with telemetry and
    /// the flattened dial-plane info.
    pub fn as_json(&self) -> serde_json::Value {
        let mut map = match self.adapter.as_json() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let info = self.adapter.proxy_info();
        map.insert("name".into(), json!(self.name()));
        map.insert("type".into(), json!(self.protocol().as_str()));
        map.insert("alive".into(), json!(self.alive()));
        map.insert("history".into(), json!(self.delay_history()));
        map.insert("extra".into(), self.extra_delay_histories());
        map.insert("udp".into(), json!(self.supports_udp()));
        map.insert("uot".into(), json!(self.supports_uot()));
        map.insert("xudp".into(), json!(info.xudp));
        map.insert("tfo".into(), json!(info.tfo));
        map.insert("mptcp".into(), json!(info.mptcp));
        map.insert("smux".into(), json!(info.smux));
        map.insert("interface".into(), json!(info.interface));
        map.insert("dialer-proxy".into(), json!(info.dialer_proxy));
        map.insert("routing-mark".into(), json!(info.routing_mark));
        serde_json::Value::Object(map)
    }
}

/// Scope-exit bookkeeping for delay probes. Commits a failure unless the
/// probe marked itself successful; dropping the probe future mid-flight
/// (caller deadline, shutdown) still lands a failure record.
struct ProbeGuard<'a> {
    endpoint: &'a Endpoint,
    url: &'a str,
    delay: u16,
    alive: bool,
    satisfied: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(endpoint: &'a Endpoint, url: &'a str) -> Self {
        Self {
            endpoint,
            url,
            delay: 0,
            alive: false,
            satisfied: false,
        }
    }

    fn succeed(&mut self, delay: u16, satisfied: bool) {
        self.delay = delay;
        self.alive = true;
        self.satisfied = satisfied;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.endpoint
            .record_probe(self.url, self.delay, self.alive, self.satisfied);
    }
}

struct DownloadGuard<'a> {
    endpoint: &'a Endpoint,
    speed: f64,
    ok: bool,
}

impl<'a> DownloadGuard<'a> {
    fn new(endpoint: &'a Endpoint) -> Self {
        Self {
            endpoint,
            speed: 0.0,
            ok: false,
        }
    }

    fn succeed(&mut self, speed: f64) {
        self.speed = speed;
        self.ok = true;
    }
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        self.endpoint.record_download(self.speed, self.ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct RefusingAdapter;

    #[async_trait]
    impl EndpointAdapter for RefusingAdapter {
        fn name(&self) -> &str {
            "refuser"
        }
        fn protocol(&self) -> ProtocolTag {
            ProtocolTag::Socks5
        }
        async fn dial(&self, _metadata: &Metadata) -> io::Result<BoxedStream> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "stub"))
        }
        async fn listen_udp(&self, _metadata: &Metadata) -> io::Result<BoxedDatagram> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "stub"))
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(Arc::new(RefusingAdapter))
    }

    const URL: &str = "http://probe.local/generate_204";

    #[test]
    fn fresh_endpoint_defaults() {
        let ep = endpoint();
        assert!(ep.alive());
        assert!(ep.alive_for(URL)); // falls back to the global flag
        assert_eq!(ep.last_delay(), DELAY_UNREACHABLE);
        assert_eq!(ep.last_delay_for(URL), DELAY_UNREACHABLE);
        assert_eq!(ep.last_speed(), 0.0);
    }

    #[test]
    fn satisfied_probe_records_delay_on_both_states() {
        let ep = endpoint();
        ep.record_probe(URL, 83, true, true);
        assert!(ep.alive());
        assert!(ep.alive_for(URL));
        assert_eq!(ep.last_delay(), 83);
        assert_eq!(ep.last_delay_for(URL), 83);
        assert_eq!(ep.delay_history_for(URL).len(), 1);
    }

    #[test]
    fn unsatisfied_probe_keeps_global_delay_but_kills_url_state() {
        let ep = endpoint();
        ep.record_probe(URL, 120, true, false);
        assert!(ep.alive());
        assert_eq!(ep.last_delay(), 120);
        assert!(!ep.alive_for(URL));
        assert_eq!(ep.last_delay_for(URL), DELAY_UNREACHABLE);
    }

    #[test]
    fn failed_probe_marks_everything_dead() {
        let ep = endpoint();
        ep.record_probe(URL, 50, true, true);
        ep.record_probe(URL, 0, false, false);
        assert!(!ep.alive());
        assert!(!ep.alive_for(URL));
        assert_eq!(ep.last_delay(), DELAY_UNREACHABLE);
        assert_eq!(ep.last_delay_for(URL), DELAY_UNREACHABLE);
    }

    #[tokio::test]
    async fn dial_failure_commits_telemetry_once() {
        let ep = endpoint();
        let err = ep.url_test(URL, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Dial(_)));
        assert!(!ep.alive());
        assert_eq!(ep.delay_history().len(), 1);
        assert_eq!(ep.delay_history_for(URL).len(), 1);
        assert_eq!(ep.delay_history_for(URL)[0].delay, 0);
    }

    #[tokio::test]
    async fn cancelled_probe_still_records_a_failure() {
        #[derive(Debug)]
        struct HangingAdapter;

        #[async_trait]
        impl EndpointAdapter for HangingAdapter {
            fn name(&self) -> &str {
                "hanger"
            }
            fn protocol(&self) -> ProtocolTag {
                ProtocolTag::Socks5
            }
            async fn dial(&self, _metadata: &Metadata) -> io::Result<BoxedStream> {
                futures::future::pending::<io::Result<BoxedStream>>().await
            }
            async fn listen_udp(&self, _metadata: &Metadata) -> io::Result<BoxedDatagram> {
                Err(io::Error::new(io::ErrorKind::Unsupported, "stub"))
            }
        }

        let ep = Endpoint::new(Arc::new(HangingAdapter));
        let probe = ep.url_test(URL, None);
        let result = tokio::time::timeout(Duration::from_millis(20), probe).await;
        assert!(result.is_err());
        assert!(!ep.alive());
        assert_eq!(ep.delay_history().len(), 1);
    }

    #[tokio::test]
    async fn invalid_scheme_is_surfaced_and_recorded() {
        let ep = endpoint();
        let err = ep.url_test("ftp://probe.local/x", None).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownScheme(_)));
        assert!(!ep.alive());
    }

    #[test]
    fn download_success_keeps_last_delay() {
        let ep = endpoint();
        ep.record_probe(URL, 42, true, true);
        ep.record_download(250_000.0, true);
        assert_eq!(ep.last_speed(), 250_000.0);
        assert_eq!(ep.history.last().delay, 42);

        ep.record_download(0.0, false);
        assert!(!ep.alive());
        assert_eq!(ep.last_speed(), 0.0);
    }

    #[test]
    fn history_stays_bounded_per_url() {
        let ep = endpoint();
        for i in 0..25u16 {
            ep.record_probe(URL, 10 + i, true, true);
        }
        assert!(ep.delay_history().len() <= crate::history::HISTORY_SIZE);
        assert!(ep.delay_history_for(URL).len() <= crate::history::HISTORY_SIZE);
    }

    #[test]
    fn json_view_carries_telemetry() {
        let ep = endpoint();
        ep.record_probe(URL, 77, true, true);
        let v = ep.as_json();
        assert_eq!(v["name"], "refuser");
        assert_eq!(v["type"], "Socks5");
        assert_eq!(v["alive"], true);
        assert_eq!(v["history"].as_array().map(Vec::len), Some(1));
        assert_eq!(v["extra"][URL]["alive"], true);
        assert_eq!(v["udp"], false);
    }
}
