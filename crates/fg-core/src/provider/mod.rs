//! Endpoint providers: versioned endpoint sets with attached health
//! checking. A provider is either fetched (membership refreshed from a
//! remote document) or static (fixed membership); groups treat both
//! uniformly through the [`Provider`] trait.

pub mod fetcher;

use crate::adapter::AdapterFactory;
use crate::error::CoreError;
use crate::health::HealthCheck;
use crate::outbound::Endpoint;
use async_trait::async_trait;
use fetcher::{Fetcher, Vehicle, VehicleType};
use regex::Regex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn vehicle_type(&self) -> VehicleType;

    /// Snapshot of the current endpoint set. Membership changes only
    /// through `update`, never in place.
    fn endpoints(&self) -> Vec<Arc<Endpoint>>;

    /// Set version; bumps (wrapping) on every membership publish.
    fn version(&self) -> u32;

    /// Marks the endpoints as actively needed, deferring lazy-checker idle
    /// suspension.
    fn touch(&self);

    /// Runs one probe round over the current set.
    async fn health_check(&self);

    async fn initial(&self) -> anyhow::Result<()>;

    async fn update(&self) -> anyhow::Result<()>;

    /// Stops the health checker (and fetcher, when there is one).
    /// Idempotent; also invoked on drop.
    fn close(&self);

    fn as_json(&self) -> serde_json::Value;
}

/// State shared between a fetched provider's handle and its fetcher
/// callbacks.
struct ProviderState {
    name: String,
    endpoints: parking_lot::RwLock<Vec<Arc<Endpoint>>>,
    version: AtomicU32,
    health: Arc<HealthCheck>,
}

impl ProviderState {
    /// Publishes a freshly parsed set: swap the list, point the checker at
    /// it, kick an immediate probe round for auto checkers, bump the
    /// version. Replaced endpoints keep none of their telemetry.
    fn install(&self, endpoints: Vec<Arc<Endpoint>>) {
        tracing::info!(
            provider = %self.name,
            count = endpoints.len(),
            "installing endpoint set"
        );
        *self.endpoints.write() = endpoints.clone();
        self.health.set_endpoints(endpoints);
        if self.health.auto() {
            let health = self.health.clone();
            tokio::spawn(async move {
                health.check().await;
            });
        }
        self.version.fetch_add(1, Ordering::Relaxed);
    }
}

/// Provider whose membership is periodically refetched from a document.
pub struct FetchedProvider {
    state: Arc<ProviderState>,
    fetcher: Arc<Fetcher<Vec<Arc<Endpoint>>>>,
}

impl FetchedProvider {
    /// `filter` is a regex over entry names; entries that do not match are
    /// dropped before adapter construction. An empty filter keeps all.
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        filter: &str,
        vehicle: Vehicle,
        health: Arc<HealthCheck>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Result<Arc<Self>, CoreError> {
        let filter_regex = if filter.is_empty() {
            None
        } else {
            Some(
                Regex::new(filter)
                    .map_err(|e| CoreError::Parse(format!("invalid filter regex: {e}")))?,
            )
        };
        if health.auto() {
            tokio::spawn(health.clone().process());
        }

        let name = name.into();
        let state = Arc::new(ProviderState {
            name: name.clone(),
            endpoints: parking_lot::RwLock::new(Vec::new()),
            version: AtomicU32::new(0),
            health,
        });

        let parse_factory = factory;
        let parse = Box::new(move |buf: &[u8]| {
            parse_endpoints(buf, filter_regex.as_ref(), parse_factory.as_ref())
        });
        let update_state = state.clone();
        let on_update = Box::new(move |endpoints: Vec<Arc<Endpoint>>| {
            update_state.install(endpoints);
        });
        let fetcher = Fetcher::new(name, interval, vehicle, parse, on_update);

        Ok(Arc::new(Self { state, fetcher }))
    }
}

#[async_trait]
impl Provider for FetchedProvider {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn vehicle_type(&self) -> VehicleType {
        self.fetcher.vehicle_type()
    }

    fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.state.endpoints.read().clone()
    }

    fn version(&self) -> u32 {
        self.state.version.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.state.health.touch();
    }

    async fn health_check(&self) {
        self.state.health.check().await;
    }

    async fn initial(&self) -> anyhow::Result<()> {
        self.fetcher.initial().await
    }

    async fn update(&self) -> anyhow::Result<()> {
        self.fetcher.update().await.map(|_same| ())
    }

    fn close(&self) {
        self.state.health.close();
        self.fetcher.destroy();
    }

    fn as_json(&self) -> serde_json::Value {
        json!({
            "name": self.name(),
            "type": "Proxy",
            "vehicleType": self.vehicle_type().as_str(),
            "proxies": self.endpoints().iter().map(|ep| ep.as_json()).collect::<Vec<_>>(),
            "updatedAt": self.fetcher.updated_at_millis(),
        })
    }
}

impl Drop for FetchedProvider {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decodes a provider document into live endpoints: structured YAML first,
/// line-oriented share links as the fallback, then name filtering and
/// adapter construction.
fn parse_endpoints(
    buf: &[u8],
    filter: Option<&Regex>,
    factory: &dyn AdapterFactory,
) -> anyhow::Result<Vec<Arc<Endpoint>>> {
    let text = std::str::from_utf8(buf).map_err(|_| anyhow::anyhow!("document is not utf-8"))?;
    let raw = match fg_subscribe::parse_clash::parse(text) {
        Ok(raw) => raw,
        Err(yaml_err) => fg_subscribe::parse_uris::parse(text)
            .map_err(|uri_err| anyhow::anyhow!("{yaml_err}, {uri_err}"))?,
    };

    let mut endpoints = Vec::new();
    for (idx, entry) in raw.iter().enumerate() {
        if let Some(regex) = filter {
            if !regex.is_match(&entry.name) {
                continue;
            }
        }
        let adapter = factory
            .build(entry)
            .map_err(|e| anyhow::anyhow!("proxy {idx} ({}): {e}", entry.name))?;
        endpoints.push(Arc::new(Endpoint::new(adapter)));
    }

    if endpoints.is_empty() {
        if filter.is_some() {
            anyhow::bail!("no proxy matched the filter, check the filter expression");
        }
        anyhow::bail!("document does not contain any proxy");
    }
    Ok(endpoints)
}

/// Provider with fixed membership. Still owns a health checker; `initial`
/// and `update` are no-ops.
pub struct StaticProvider {
    name: String,
    endpoints: Vec<Arc<Endpoint>>,
    version: AtomicU32,
    health: Arc<HealthCheck>,
}

impl StaticProvider {
    pub fn new(
        name: impl Into<String>,
        endpoints: Vec<Arc<Endpoint>>,
        health: Arc<HealthCheck>,
    ) -> Result<Arc<Self>, CoreError> {
        if endpoints.is_empty() {
            return Err(CoreError::EmptySet);
        }
        if health.auto() {
            tokio::spawn(health.clone().process());
        }
        health.set_endpoints(endpoints.clone());
        Ok(Arc::new(Self {
            name: name.into(),
            endpoints,
            version: AtomicU32::new(0),
            health,
        }))
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn vehicle_type(&self) -> VehicleType {
        VehicleType::Compatible
    }

    fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.clone()
    }

    fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.health.touch();
    }

    async fn health_check(&self) {
        self.health.check().await;
    }

    async fn initial(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.health.close();
    }

    fn as_json(&self) -> serde_json::Value {
        json!({
            "name": self.name(),
            "type": "Proxy",
            "vehicleType": self.vehicle_type().as_str(),
            "proxies": self.endpoints.iter().map(|ep| ep.as_json()).collect::<Vec<_>>(),
        })
    }
}

impl Drop for StaticProvider {
    fn drop(&mut self) {
        self.close();
    }
}
