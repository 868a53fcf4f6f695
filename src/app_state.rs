use crate::catalog::MemoryCatalog;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::entitlement::EntitlementLedger;
use crate::gate::AccessGate;
use crate::identity::SessionTokenResolver;
use crate::issuer::HandleIssuer;
use crate::storage::StorageManager;
use crate::token::KeyRing;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Every collaborator the HTTP surface needs, constructed once and injected
/// into the routers as an `Extension`.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AccessGate>,
    pub ledger: Arc<EntitlementLedger>,
    pub catalog: Arc<MemoryCatalog>,
    pub sessions: SessionTokenResolver,
    pub storage_manager: Arc<StorageManager>,
    pub clock: Arc<dyn Clock>,
    pub session_ttl: Duration,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let keys = KeyRing::from_config(config.signing_keys.clone());
        if config.signing_keys.is_empty() {
            info!("No signing keys configured, using a random key");
        }

        let storage_manager = Arc::new(
            StorageManager::new(config.to_storage_config()?, keys.clone(), clock.clone()).await?,
        );

        let ledger = Arc::new(match &config.entitlements_file {
            Some(path) => EntitlementLedger::open(PathBuf::from(path), clock.clone()).await?,
            None => EntitlementLedger::new(clock.clone()),
        });

        let catalog = Arc::new(MemoryCatalog::new());
        let sessions = SessionTokenResolver::new(keys, clock.clone());

        let gate = Arc::new(AccessGate::new(
            Arc::new(sessions.clone()),
            ledger.clone(),
            catalog.clone(),
            HandleIssuer::new(storage_manager.clone(), clock.clone()),
            clock.clone(),
            config.delivery_ttl_ceiling(),
        ));

        info!(
            ttl_ceiling = ?gate.ttl_ceiling(),
            remote_storage = storage_manager.is_remote(),
            "Access gate ready"
        );

        Ok(Self {
            gate,
            ledger,
            catalog,
            sessions,
            storage_manager,
            clock,
            session_ttl: config.session_ttl(),
        })
    }
}
