//! Periodic download-and-parse of a provider source document, with content
//! change detection and a local cache copy for remote vehicles.

use anyhow::Context;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const HTTP_FETCH_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VehicleType {
    Http,
    File,
    Compatible,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Http => "HTTP",
            VehicleType::File => "File",
            VehicleType::Compatible => "Compatible",
        }
    }
}

/// Where a provider document comes from.
#[derive(Clone, Debug)]
pub enum Vehicle {
    /// Remote document; a copy is cached at `path` after every fetch.
    Http { url: String, path: PathBuf },
    /// Local file, read as-is.
    File { path: PathBuf },
}

impl Vehicle {
    pub fn kind(&self) -> VehicleType {
        match self {
            Vehicle::Http { .. } => VehicleType::Http,
            Vehicle::File { .. } => VehicleType::File,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Vehicle::Http { path, .. } => path,
            Vehicle::File { path } => path,
        }
    }

    pub async fn read(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Vehicle::File { path } => Ok(tokio::fs::read(path)
                .await
                .with_context(|| format!("read {}", path.display()))?),
            Vehicle::Http { url, .. } => {
                let client = reqwest::Client::builder()
                    .timeout(HTTP_FETCH_TIMEOUT)
                    .build()?;
                let response = client.get(url).send().await?.error_for_status()?;
                Ok(response.bytes().await?.to_vec())
            }
        }
    }
}

type ParseFn<T> = dyn Fn(&[u8]) -> anyhow::Result<T> + Send + Sync;
type UpdateFn<T> = dyn Fn(T) + Send + Sync;

/// Fetch-parse-publish pipeline with a refresh ticker.
///
/// At most one refresh runs at a time; the ticker and manual `update` calls
/// serialize on the refresh lock.
pub struct Fetcher<T> {
    name: String,
    interval: Duration,
    vehicle: Vehicle,
    parse: Box<ParseFn<T>>,
    on_update: Box<UpdateFn<T>>,
    content_hash: Mutex<Option<[u8; 32]>>,
    updated_at: Mutex<Option<SystemTime>>,
    refresh: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    /// Handed to the ticker task, which must not keep a dropped fetcher
    /// alive.
    self_ref: Weak<Fetcher<T>>,
}

impl<T: Send + 'static> Fetcher<T> {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        vehicle: Vehicle,
        parse: Box<ParseFn<T>>,
        on_update: Box<UpdateFn<T>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            interval,
            vehicle,
            parse,
            on_update,
            content_hash: Mutex::new(None),
            updated_at: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            self_ref: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle.kind()
    }

    pub fn updated_at(&self) -> Option<SystemTime> {
        *self.updated_at.lock()
    }

    pub fn updated_at_millis(&self) -> Option<u64> {
        self.updated_at()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
    }

    /// First load: fetch, parse, cache, publish, then start the ticker. A
    /// failed remote fetch falls back to the cached copy when one exists.
    pub async fn initial(&self) -> anyhow::Result<()> {
        let _refresh = self.refresh.lock().await;
        let buf = match self.vehicle.read().await {
            Ok(buf) => buf,
            Err(e) => match &self.vehicle {
                Vehicle::Http { path, .. } if path.exists() => {
                    tracing::warn!(
                        provider = %self.name,
                        error = %e,
                        "fetch failed, loading cached document"
                    );
                    tokio::fs::read(path)
                        .await
                        .with_context(|| format!("read cache {}", path.display()))?
                }
                _ => return Err(e),
            },
        };
        let parsed =
            (self.parse)(&buf).with_context(|| format!("provider {} initial parse", self.name))?;
        self.store(&buf).await;
        (self.on_update)(parsed);
        if !self.interval.is_zero() {
            self.spawn_ticker();
        }
        Ok(())
    }

    /// One refresh cycle. `Ok(true)` means the document was unchanged and
    /// nothing was published.
    pub async fn update(&self) -> anyhow::Result<bool> {
        let _refresh = self.refresh.lock().await;
        let buf = self.vehicle.read().await?;
        let hash: [u8; 32] = Sha256::digest(&buf).into();
        if *self.content_hash.lock() == Some(hash) {
            *self.updated_at.lock() = Some(SystemTime::now());
            return Ok(true);
        }
        let parsed = (self.parse)(&buf).with_context(|| format!("provider {} parse", self.name))?;
        self.store(&buf).await;
        (self.on_update)(parsed);
        Ok(false)
    }

    async fn store(&self, buf: &[u8]) {
        *self.content_hash.lock() = Some(Sha256::digest(buf).into());
        *self.updated_at.lock() = Some(SystemTime::now());
        if let Vehicle::Http { path, .. } = &self.vehicle {
            if let Err(e) = tokio::fs::write(path, buf).await {
                tracing::warn!(
                    provider = %self.name,
                    path = %path.display(),
                    error = %e,
                    "failed to cache provider document"
                );
            }
        }
    }

    fn spawn_ticker(&self) {
        let weak = self.self_ref.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(fetcher) = weak.upgrade() else { break };
                        match fetcher.update().await {
                            Ok(true) => tracing::debug!(provider = %fetcher.name, "document unchanged"),
                            Ok(false) => tracing::info!(provider = %fetcher.name, "document refreshed"),
                            Err(e) => {
                                tracing::warn!(provider = %fetcher.name, error = %e, "refresh failed")
                            }
                        }
                    }
                }
            }
        });
    }

    /// Stops the ticker. Safe to call more than once.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }
}
