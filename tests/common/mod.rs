#![allow(dead_code)]

pub mod server;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use video_access::{
    AccessClient, AccessError, AccessGate, AssetId, BearerUrl, Clock, EntitlementLedger,
    GateAccessClient, HandleIssuer, IdentityResolver, MemoryCatalog, ObjectStorage,
    PlaybackSurface, PrincipalId, PurchaseCompleted, SignedHandle, StorageError,
};

pub const PRINCIPAL_HEADER: &str = "x-principal";

/// Wall clock that follows tokio's (possibly paused) time.
pub struct TokioClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            started: tokio::time::Instant::now(),
        })
    }

    pub fn base(&self) -> DateTime<Utc> {
        self.base
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + ChronoDuration::from_std(self.started.elapsed()).unwrap()
    }
}

/// Principal named by a request header.
pub struct HeaderIdentity;

#[async_trait]
impl IdentityResolver for HeaderIdentity {
    async fn resolve_principal(
        &self,
        credentials: &HeaderMap,
    ) -> anyhow::Result<Option<PrincipalId>> {
        Ok(credentials
            .get(PRINCIPAL_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(PrincipalId::new))
    }
}

/// Object storage that can be told to fail its next calls.
pub struct FlakyStorage {
    clock: Arc<dyn Clock>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    /// Presign-style lifetimes: whole seconds, nothing under one.
    pub whole_seconds: AtomicBool,
}

impl FlakyStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            whole_seconds: AtomicBool::new(false),
        })
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for FlakyStorage {
    async fn mint_bearer_url(
        &self,
        storage_key: &str,
        ttl: Duration,
    ) -> Result<BearerUrl, StorageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable("bucket offline".to_string()));
        }

        let ttl = if self.whole_seconds.load(Ordering::SeqCst) {
            let floored = Duration::from_secs(ttl.as_secs());
            if floored.is_zero() {
                return Err(StorageError::TtlTooShort(ttl));
            }
            floored
        } else {
            ttl
        };

        Ok(BearerUrl {
            url: format!("https://cdn.test/{storage_key}?sig={call}"),
            expires_at: self.clock.now() + ChronoDuration::from_std(ttl).unwrap(),
        })
    }
}

/// A gate over in-memory collaborators with one cataloged asset, `"x"`.
pub struct Harness {
    pub clock: Arc<TokioClock>,
    pub ledger: Arc<EntitlementLedger>,
    pub storage: Arc<FlakyStorage>,
    pub gate: Arc<AccessGate>,
}

impl Harness {
    pub fn new(ttl_ceiling: Duration) -> Self {
        let clock = TokioClock::new();
        let ledger = Arc::new(EntitlementLedger::new(clock.clone()));
        let catalog = Arc::new(MemoryCatalog::new());
        assert!(catalog.register(AssetId::new("x"), "films/x.mp4".to_string()));
        let storage = FlakyStorage::new(clock.clone());

        let gate = Arc::new(AccessGate::new(
            Arc::new(HeaderIdentity),
            ledger.clone(),
            catalog,
            HandleIssuer::new(storage.clone(), clock.clone()),
            clock.clone(),
            ttl_ceiling,
        ));

        Self {
            clock,
            ledger,
            storage,
            gate,
        }
    }

    /// Grant `principal` access to `"x"` for `secs` from now.
    pub async fn grant(&self, principal: &str, secs: i64) -> DateTime<Utc> {
        self.grant_for(principal, ChronoDuration::seconds(secs)).await
    }

    pub async fn grant_for(&self, principal: &str, length: ChronoDuration) -> DateTime<Utc> {
        let expires_at = self.clock.now() + length;
        self.ledger
            .record_purchase(PurchaseCompleted {
                principal_id: PrincipalId::new(principal),
                asset_id: AssetId::new("x"),
                expires_at: Some(expires_at),
                purchase_ref: None,
            })
            .await
            .unwrap();
        expires_at
    }

    pub fn client_for(&self, principal: &str) -> Arc<GateAccessClient> {
        let mut credentials = HeaderMap::new();
        credentials.insert(PRINCIPAL_HEADER, HeaderValue::from_str(principal).unwrap());
        Arc::new(GateAccessClient::new(self.gate.clone(), credentials))
    }
}

/// Access client that can hold calls open and tracks their overlap.
pub struct HoldingClient {
    inner: Arc<dyn AccessClient>,
    hold: AtomicBool,
    release: Notify,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl HoldingClient {
    pub fn new(inner: Arc<dyn AccessClient>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            hold: AtomicBool::new(false),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccessClient for HoldingClient {
    async fn request_access(&self, asset_id: &AssetId) -> Result<SignedHandle, AccessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        let result = self.inner.request_access(asset_id).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug, Default)]
pub struct SurfaceState {
    pub sources: Vec<String>,
    pub position: Duration,
    pub paused: bool,
    pub seeks: Vec<Duration>,
}

/// Media element stand-in. Loading a source resets position and play state
/// the way a real element does.
#[derive(Default)]
pub struct RecordingSurface {
    pub state: Mutex<SurfaceState>,
    pub fail_loads: AtomicBool,
    /// How long a source takes to become ready.
    pub load_delay: Mutex<Duration>,
}

impl RecordingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sources(&self) -> Vec<String> {
        self.state.lock().sources.clone()
    }

    /// Wait until at least `count` sources have been loaded.
    pub async fn wait_for_sources(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.sources().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    pub fn set_playhead(&self, position: Duration, paused: bool) {
        let mut state = self.state.lock();
        state.position = position;
        state.paused = paused;
    }
}

#[async_trait]
impl PlaybackSurface for RecordingSurface {
    fn position(&self) -> Duration {
        self.state.lock().position
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    async fn load_source(&self, url: &str) -> anyhow::Result<()> {
        let delay = *self.load_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(anyhow!("decode error"));
        }
        let mut state = self.state.lock();
        state.sources.push(url.to_string());
        state.position = Duration::ZERO;
        state.paused = true;
        Ok(())
    }

    fn seek(&self, position: Duration) {
        let mut state = self.state.lock();
        state.position = position;
        state.seeks.push(position);
    }

    fn play(&self) {
        self.state.lock().paused = false;
    }

    fn pause(&self) {
        self.state.lock().paused = true;
    }
}
