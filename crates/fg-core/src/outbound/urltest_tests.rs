use super::*;
use crate::adapter::{BoxedDatagram, BoxedStream, EndpointAdapter};
use crate::provider::fetcher::VehicleType;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

const URL: &str = "https://www.gstatic.com/generate_204";

#[derive(Debug)]
struct StubAdapter {
    name: String,
}

#[async_trait]
impl EndpointAdapter for StubAdapter {
    fn name(&self) -> &str {
        &self.name
    }
    fn protocol(&self) -> ProtocolTag {
        ProtocolTag::Socks5
    }
    async fn dial(&self, _metadata: &Metadata) -> std::io::Result<BoxedStream> {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "stub",
        ))
    }
    async fn listen_udp(&self, _metadata: &Metadata) -> std::io::Result<BoxedDatagram> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "stub"))
    }
}

/// Fixed-membership provider with observable touch counts and no real
/// probing, so selection tests control telemetry directly.
struct SeededProvider {
    endpoints: Vec<Arc<Endpoint>>,
    touches: AtomicUsize,
}

impl SeededProvider {
    fn new(endpoints: Vec<Arc<Endpoint>>) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            touches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Provider for SeededProvider {
    fn name(&self) -> &str {
        "seeded"
    }
    fn vehicle_type(&self) -> VehicleType {
        VehicleType::Compatible
    }
    fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.clone()
    }
    fn version(&self) -> u32 {
        0
    }
    fn touch(&self) {
        self.touches.fetch_add(1, Ordering::SeqCst);
    }
    async fn health_check(&self) {}
    async fn initial(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn update(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn close(&self) {}
    fn as_json(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

fn endpoint(name: &str) -> Arc<Endpoint> {
    Arc::new(Endpoint::new(Arc::new(StubAdapter { name: name.into() })))
}

fn seed_delay(ep: &Endpoint, delay: u16) {
    ep.record_probe(URL, delay, true, true);
}

fn seed_dead(ep: &Endpoint) {
    ep.record_probe(URL, 0, false, false);
}

fn group_over(
    tolerance: u16,
    endpoints: Vec<Arc<Endpoint>>,
) -> (Arc<UrlTestGroup>, Arc<SeededProvider>) {
    let provider = SeededProvider::new(endpoints);
    let group = UrlTestGroup::new(
        UrlTestOptions {
            name: "auto".into(),
            test_url: URL.into(),
            tolerance,
            ..Default::default()
        },
        vec![provider.clone()],
    )
    .unwrap();
    (group, provider)
}

#[tokio::test]
async fn selection_by_latency_with_tolerance_band() {
    let (a, b, c) = (endpoint("a"), endpoint("b"), endpoint("c"));
    seed_delay(&a, 120);
    seed_delay(&b, 80);
    seed_delay(&c, 100);
    let (group, _) = group_over(50, vec![a.clone(), b.clone(), c.clone()]);

    assert_eq!(group.fast(false).await.unwrap().name(), "b");

    // An improvement inside the tolerance band does not move the pick.
    seed_delay(&a, 70);
    group.single.reset();
    assert_eq!(group.fast(false).await.unwrap().name(), "b");

    // An improvement beyond the band does.
    seed_delay(&a, 20);
    group.single.reset();
    assert_eq!(group.fast(false).await.unwrap().name(), "a");
}

#[tokio::test]
async fn measured_speed_beats_lower_latency() {
    let (a, b) = (endpoint("a"), endpoint("b"));
    seed_delay(&a, 50);
    seed_delay(&b, 200);
    b.record_download(1_000_000.0, true);
    let (group, _) = group_over(0, vec![a, b]);
    assert_eq!(group.fast(false).await.unwrap().name(), "b");
}

#[tokio::test]
async fn dead_override_falls_through_to_ranking() {
    let (x, b) = (endpoint("x"), endpoint("b"));
    seed_dead(&x);
    seed_delay(&b, 90);
    let (group, _) = group_over(0, vec![x, b]);
    group.force_set(Some("x"));
    assert_eq!(group.fast(false).await.unwrap().name(), "b");
}

#[tokio::test]
async fn alive_override_wins_over_faster_endpoints() {
    let (slow, fast) = (endpoint("slow"), endpoint("fast"));
    seed_delay(&slow, 900);
    seed_delay(&fast, 10);
    let (group, _) = group_over(0, vec![slow, fast]);
    group.set("slow").unwrap();
    assert_eq!(group.fast(false).await.unwrap().name(), "slow");
    assert_eq!(group.selected().as_deref(), Some("slow"));
}

#[tokio::test]
async fn set_rejects_unknown_names() {
    let (group, _) = group_over(0, vec![endpoint("only")]);
    assert!(matches!(
        group.set("ghost").unwrap_err(),
        CoreError::UnknownEndpoint(_)
    ));
}

#[tokio::test]
async fn all_dead_still_yields_the_first_endpoint() {
    let (a, b) = (endpoint("a"), endpoint("b"));
    seed_dead(&a);
    seed_dead(&b);
    let (group, _) = group_over(0, vec![a, b]);
    assert_eq!(group.fast(false).await.unwrap().name(), "a");
}

#[tokio::test]
async fn empty_group_selects_nothing_and_dial_errors() {
    let (group, _) = group_over(0, vec![]);
    assert!(group.fast(false).await.is_none());
    assert_eq!(group.now().await, "");

    let mut md = Metadata::new(crate::types::Network::Tcp);
    md.set_remote_address("example.com:80").unwrap();
    let err = match group.dial(&md).await {
        Err(e) => e,
        Ok(_) => panic!("expected dial to fail"),
    };
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}

#[tokio::test]
async fn memoized_callers_see_one_identity() {
    let (a, b) = (endpoint("a"), endpoint("b"));
    seed_delay(&a, 100);
    seed_delay(&b, 80);
    let (group, _) = group_over(0, vec![a.clone(), b]);

    let first = group.fast(false).await.unwrap();
    // Telemetry moves, but the memoized window keeps the identity stable.
    seed_delay(&a, 1);
    let second = group.fast(false).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // After an explicit reset the next call recomputes.
    group.single.reset();
    assert_eq!(group.fast(false).await.unwrap().name(), "a");
}

#[tokio::test]
async fn shared_hits_still_touch_providers() {
    let (group, provider) = group_over(0, vec![endpoint("a")]);
    group.fast(true).await.unwrap();
    let after_compute = provider.touches.load(Ordering::SeqCst);
    assert!(after_compute >= 1);

    // The second call is a memo hit; providers must still be touched.
    group.fast(true).await.unwrap();
    assert!(provider.touches.load(Ordering::SeqCst) > after_compute);
}

#[tokio::test]
async fn failure_threshold_invalidates_the_pick() {
    let (a, b) = (endpoint("a"), endpoint("b"));
    seed_delay(&a, 50);
    seed_delay(&b, 500);
    let (group, _) = group_over(0, vec![a.clone(), b]);
    assert_eq!(group.fast(false).await.unwrap().name(), "a");

    // New telemetry favors b, but the memo still serves a.
    seed_dead(&a);
    assert_eq!(group.fast(false).await.unwrap().name(), "a");

    let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down");
    for _ in 0..5 {
        group.on_dial_failed(ProtocolTag::Socks5, &err);
    }
    // The threshold schedules a recheck that resets the memo.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(group.fast(false).await.unwrap().name(), "b");
}

#[tokio::test]
async fn dial_success_clears_the_failure_window() {
    let (group, _) = group_over(0, vec![endpoint("a")]);
    let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down");
    for _ in 0..4 {
        group.on_dial_failed(ProtocolTag::Socks5, &err);
    }
    group.on_dial_success();
    assert_eq!(group.failures.lock().count, 0);
}

#[tokio::test]
async fn group_json_structural_fields_round_trip() {
    let (a, b) = (endpoint("a"), endpoint("b"));
    seed_delay(&a, 10);
    seed_delay(&b, 20);
    let provider = SeededProvider::new(vec![a, b]);
    let group = UrlTestGroup::new(
        UrlTestOptions {
            name: "auto".into(),
            test_url: URL.into(),
            expected_status: "200-299/400".into(),
            hidden: true,
            icon: "globe".into(),
            ..Default::default()
        },
        vec![provider],
    )
    .unwrap();
    group.force_set(Some("a"));

    let v = group.as_json().await;
    assert_eq!(v["type"], "URLTest");
    assert_eq!(v["testUrl"], URL);
    assert_eq!(v["expectedStatus"], "200-299/400");
    assert_eq!(v["fixed"], "a");
    assert_eq!(v["hidden"], true);
    assert_eq!(v["icon"], "globe");
    assert_eq!(v["now"], "a");
    assert_eq!(v["all"], serde_json::json!(["a", "b"]));
}

#[tokio::test]
async fn bad_expected_status_is_rejected() {
    let err = UrlTestGroup::new(
        UrlTestOptions {
            name: "auto".into(),
            expected_status: "banana".into(),
            ..Default::default()
        },
        vec![],
    )
    .err()
    .unwrap();
    assert!(matches!(err, CoreError::Parse(_)));
}

#[tokio::test]
async fn udp_support_follows_the_pick_and_the_switch() {
    let (group, _) = group_over(0, vec![endpoint("a")]);
    // Stub adapters do not support UDP.
    assert!(!group.supports_udp().await);

    let provider = SeededProvider::new(vec![endpoint("a")]);
    let group = UrlTestGroup::new(
        UrlTestOptions {
            name: "auto".into(),
            test_url: URL.into(),
            disable_udp: true,
            ..Default::default()
        },
        vec![provider],
    )
    .unwrap();
    assert!(!group.supports_udp().await);
}
