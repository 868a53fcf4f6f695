use crate::entitlement::AssetId;
use crate::error::AccessError;
use crate::gate::AccessGate;
use crate::issuer::SignedHandle;
use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How a playback session reaches the access gate on behalf of its viewer.
#[async_trait]
pub trait AccessClient: Send + Sync {
    async fn request_access(&self, asset_id: &AssetId) -> Result<SignedHandle, AccessError>;
}

/// Calls an in-process gate with fixed credentials.
pub struct GateAccessClient {
    gate: Arc<AccessGate>,
    credentials: HeaderMap,
}

impl GateAccessClient {
    pub fn new(gate: Arc<AccessGate>, credentials: HeaderMap) -> Self {
        Self { gate, credentials }
    }
}

#[async_trait]
impl AccessClient for GateAccessClient {
    async fn request_access(&self, asset_id: &AssetId) -> Result<SignedHandle, AccessError> {
        self.gate.authorize(&self.credentials, asset_id).await
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Calls `GET /access/{asset_id}` over HTTP with the viewer's session token.
pub struct HttpAccessClient {
    client: reqwest::Client,
    base_url: String,
    session_token: String,
}

impl HttpAccessClient {
    pub fn new(base_url: impl Into<String>, session_token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_token: session_token.into(),
        })
    }
}

#[async_trait]
impl AccessClient for HttpAccessClient {
    async fn request_access(&self, asset_id: &AssetId) -> Result<SignedHandle, AccessError> {
        let url = format!("{}/access/{asset_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.session_token)
            .send()
            .await
            .map_err(|error| AccessError::Transport(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<SignedHandle>()
                .await
                .map_err(|error| AccessError::Transport(error.to_string()));
        }

        let reason = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        debug!(%asset_id, %status, %reason, "Access request refused");

        Err(error_from_status(status, reason))
    }
}

fn error_from_status(status: StatusCode, reason: String) -> AccessError {
    match status {
        StatusCode::UNAUTHORIZED => AccessError::Unauthenticated,
        StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN => AccessError::NotEntitled,
        StatusCode::NOT_FOUND => AccessError::AssetUnavailable,
        StatusCode::BAD_GATEWAY => AccessError::StorageUnavailable(reason),
        StatusCode::SERVICE_UNAVAILABLE => AccessError::EntitlementUnavailable(reason),
        _ => AccessError::Transport(format!("{status}: {reason}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_status() {
        let reason = || "x".to_string();
        assert_eq!(
            error_from_status(StatusCode::UNAUTHORIZED, reason()),
            AccessError::Unauthenticated
        );
        assert_eq!(
            error_from_status(StatusCode::PAYMENT_REQUIRED, reason()),
            AccessError::NotEntitled
        );
        assert_eq!(
            error_from_status(StatusCode::NOT_FOUND, reason()),
            AccessError::AssetUnavailable
        );
        assert!(error_from_status(StatusCode::BAD_GATEWAY, reason()).is_transient());
        assert!(error_from_status(StatusCode::SERVICE_UNAVAILABLE, reason()).is_transient());
        assert!(error_from_status(StatusCode::INTERNAL_SERVER_ERROR, reason()).is_transient());
    }
}
