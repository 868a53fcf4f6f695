pub mod api;
pub mod app_state;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod gate;
pub mod identity;
pub mod issuer;
pub mod playback;
pub mod storage;
pub mod token;

use axum::Router;
use axum::extract::Extension;
use axum::routing::{get, post, put};
use tokio::net::TcpListener;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tracing::info;

//
// Re-export
//
pub use app_state::AppState;
pub use catalog::{Catalog, MemoryCatalog};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use entitlement::{
    AssetId, Entitlement, EntitlementLedger, EntitlementStore, LedgerError, PurchaseCompleted,
    StoreError,
};
pub use error::AccessError;
pub use gate::{AccessGate, GateState};
pub use identity::{IdentityResolver, PrincipalId, SessionTokenResolver};
pub use issuer::{HandleIssuer, SignedHandle};
pub use playback::{
    AccessClient, EndReason, GateAccessClient, HttpAccessClient, PlaybackEvent, PlaybackSession,
    PlaybackSurface, RotationPolicy, SessionState,
};
pub use storage::{
    BearerUrl, ObjectStorage, StorageBackend, StorageConfig, StorageError, StorageManager,
};

/// External routes: what viewers and their players call.
pub fn external_router(state: AppState) -> Router {
    Router::new()
        .route("/access/{asset_id}", get(api::access_asset))
        .route("/objects/{*key}", get(api::serve_object))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(cors())
        .layer(Extension(state))
}

/// Internal routes: session minting, purchase ingestion and the catalog.
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(api::create_session))
        .route("/purchases", post(api::record_purchase))
        .route("/catalog/{asset_id}", put(api::register_asset))
        .route("/health", get(api::health))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(cors())
        .layer(Extension(state))
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(&config).await?;

    let external_addr = format!("0.0.0.0:{}", config.listen_on_port);
    let external_listener = TcpListener::bind(&external_addr).await?;
    info!("External API listening on {external_addr}");

    let internal_addr = format!("0.0.0.0:{}", config.internal_port);
    let internal_listener = TcpListener::bind(&internal_addr).await?;
    info!("Internal API listening on {internal_addr}");

    let external_app = external_router(state.clone());
    let internal_app = internal_router(state);

    tokio::select! {
        result = axum::serve(external_listener, external_app) => result?,
        result = axum::serve(internal_listener, internal_app) => result?,
    }

    Ok(())
}
