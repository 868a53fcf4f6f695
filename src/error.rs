use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a denied or failed access decision.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum AccessError {
    #[error("No authenticated principal")]
    Unauthenticated,

    #[error("No live entitlement")]
    NotEntitled,

    #[error("Entitlement has expired")]
    Expired,

    /// Live, but ending sooner than object storage can express a URL lifetime.
    #[error("Entitlement ends in {0:?}, below storage resolution")]
    Lapsing(Duration),

    #[error("Asset has no storage mapping")]
    AssetUnavailable,

    #[error("Object storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Entitlement store unavailable: {0}")]
    EntitlementUnavailable(String),

    #[error("Transport failure: {0}")]
    Transport(String),
}

impl AccessError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AccessError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AccessError::NotEntitled | AccessError::Expired => StatusCode::PAYMENT_REQUIRED,
            AccessError::AssetUnavailable => StatusCode::NOT_FOUND,
            AccessError::StorageUnavailable(_) | AccessError::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
            AccessError::EntitlementUnavailable(_) | AccessError::Lapsing(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Failures worth retrying inside a live playback session.
    ///
    /// Denials are never transient: once the gate says no, the viewer has
    /// lost access and retrying would only probe.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AccessError::StorageUnavailable(_)
                | AccessError::EntitlementUnavailable(_)
                | AccessError::Transport(_)
        )
    }

    /// Message shown to the viewer. `NotEntitled` and `Expired` share one
    /// message so a response never tells "never bought" from "lapsed".
    pub fn public_message(&self) -> &'static str {
        match self {
            AccessError::Unauthenticated => "Please sign in",
            AccessError::NotEntitled | AccessError::Expired => "Purchase required",
            AccessError::AssetUnavailable => "Asset unavailable",
            AccessError::StorageUnavailable(_) | AccessError::Transport(_) => {
                "Media storage unavailable"
            }
            AccessError::EntitlementUnavailable(_) => "Access check unavailable",
            AccessError::Lapsing(_) => "Access ending, retry shortly",
        }
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let mut res = err_response(self.status_code(), self.public_message());
        if let AccessError::Lapsing(_) = self {
            res.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        res
    }
}

/// Create an error response
pub fn err_response(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": message,
        "status": status.as_u16()
    });

    (status, Json(body)).into_response()
}
