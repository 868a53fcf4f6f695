use crate::AppState;
use crate::entitlement::{AssetId, LedgerError, PurchaseCompleted};
use crate::error::err_response;
use crate::identity::{MAX_SESSION_TTL, PrincipalId};
use crate::storage::GrantRejection;
use axum::body::Body;
use axum::extract::{Extension, Path as AxumPath, Query};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use mime_guess::from_path;
use opendal::Operator;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STREAM_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub principal_id: PrincipalId,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterAssetRequest {
    pub storage_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ObjectQuery {
    pub token: Option<String>,
}

/// Validate asset id with basic rules
fn is_valid_asset_id(asset_id: &str) -> bool {
    !asset_id.is_empty()
        && asset_id.len() <= 128
        && !asset_id.contains('/')
        && !asset_id.chars().any(char::is_whitespace)
}

/// `GET /access/{asset_id}`: the single entry point for initial loads and
/// rotations alike.
pub async fn access_asset(
    Extension(state): Extension<AppState>,
    AxumPath(asset_id): AxumPath<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let asset_id = AssetId::new(asset_id);

    match state.gate.authorize(&headers, &asset_id).await {
        Ok(handle) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "no-store")],
            Json(handle),
        )
            .into_response(),
        Err(error) => error.into_response(),
    }
}

/// `GET /objects/{*key}?token=`: serve a locally stored object to the
/// holder of a live object grant.
pub async fn serve_object(
    Extension(state): Extension<AppState>,
    AxumPath(storage_key): AxumPath<String>,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Response<Body> {
    let Some(token) = query.token else {
        return err_response(StatusCode::UNAUTHORIZED, "Missing token");
    };

    if let Err(rejection) = state.storage_manager.verify_grant(&storage_key, &token) {
        debug!(%storage_key, %rejection, "Object request rejected");
        let message = match rejection {
            GrantRejection::Invalid(_) => "Invalid token",
            GrantRejection::KeyMismatch | GrantRejection::Expired => "Access denied",
        };
        return err_response(rejection.to_err_code(), message);
    }

    let operator = state.storage_manager.operator().clone();
    let size = match operator.stat(&storage_key).await {
        Ok(metadata) => metadata.content_length(),
        Err(error) if error.kind() == opendal::ErrorKind::NotFound => {
            return err_response(StatusCode::NOT_FOUND, "Object not found");
        }
        Err(error) => {
            error!(%storage_key, ?error, "Failed to stat object");
            return err_response(StatusCode::BAD_GATEWAY, "Media storage unavailable");
        }
    };

    let (status, start, end) = match parse_range(&headers, size) {
        ByteRange::Full => (StatusCode::OK, 0, size),
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end + 1),
        ByteRange::Unsatisfiable => {
            let mut res = err_response(StatusCode::RANGE_NOT_SATISFIABLE, "Range not satisfiable");
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                res.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return res;
        }
    };

    let body = match read_range(&operator, &storage_key, start, end).await {
        Ok(body) => body,
        Err(error) => {
            error!(%storage_key, ?error, "Failed to read object");
            return err_response(StatusCode::BAD_GATEWAY, "Media storage unavailable");
        }
    };

    debug!(%storage_key, start, end, "Serving object");

    let mut res = Response::new(body);
    *res.status_mut() = status;
    let headers = res.headers_mut();
    let content_type = from_path(&storage_key).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(content_type.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, no-store"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start));
    if status == StatusCode::PARTIAL_CONTENT
        && let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{}/{size}", end - 1))
    {
        headers.insert(header::CONTENT_RANGE, value);
    }
    res
}

/// Stream `start..end` of an object in chunks without buffering the range.
async fn read_range(
    operator: &Operator,
    storage_key: &str,
    start: u64,
    end: u64,
) -> anyhow::Result<Body> {
    if start == end {
        return Ok(Body::empty());
    }

    let stream = operator
        .reader_with(storage_key)
        .chunk(STREAM_CHUNK_SIZE)
        .await?
        .into_bytes_stream(start..end)
        .await?;

    Ok(Body::from_stream(stream))
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Full,
    /// Inclusive bounds
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Interpret a single-range `Range` header. Anything unparseable serves the
/// whole object.
fn parse_range(headers: &HeaderMap, size: u64) -> ByteRange {
    let Some(spec) = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
    else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return ByteRange::Full;
    };

    let (start, end) = match (first.parse::<u64>(), last.parse::<u64>()) {
        (Ok(start), Ok(end)) if start <= end => (start, end.min(size.saturating_sub(1))),
        (Ok(start), Err(_)) if last.is_empty() => (start, size.saturating_sub(1)),
        (Err(_), Ok(suffix)) if first.is_empty() && suffix > 0 => {
            (size.saturating_sub(suffix), size.saturating_sub(1))
        }
        _ => return ByteRange::Full,
    };

    if size == 0 || start >= size {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial { start, end }
}

/// `POST /sessions`: mint a session token for a principal.
pub async fn create_session(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    if request.principal_id.as_str().is_empty() {
        warn!("principal_id is empty");
        return err_response(StatusCode::BAD_REQUEST, "principal_id is required");
    }

    let ttl = match request.ttl_secs {
        Some(0) => {
            return err_response(StatusCode::BAD_REQUEST, "ttl_secs must be positive");
        }
        Some(secs) if Duration::from_secs(secs) > MAX_SESSION_TTL => {
            return err_response(StatusCode::BAD_REQUEST, "ttl_secs is too long");
        }
        Some(secs) => Duration::from_secs(secs),
        None => state.session_ttl,
    };

    match state.sessions.issue_session(&request.principal_id, ttl) {
        Ok((token, expires_at)) => {
            debug!(principal_id = %request.principal_id, %expires_at, "Session created");
            (
                StatusCode::OK,
                Json(CreateSessionResponse { token, expires_at }),
            )
                .into_response()
        }
        Err(error) => {
            error!(?error, "Failed to create session");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session")
        }
    }
}

/// `POST /purchases`: ingest a purchase-completion event.
pub async fn record_purchase(
    Extension(state): Extension<AppState>,
    Json(event): Json<PurchaseCompleted>,
) -> impl IntoResponse {
    if event.principal_id.as_str().is_empty() || !is_valid_asset_id(event.asset_id.as_str()) {
        return err_response(
            StatusCode::BAD_REQUEST,
            "principal_id and a valid asset_id are required",
        );
    }

    match state.ledger.record_purchase(event).await {
        Ok(entitlement) => (StatusCode::CREATED, Json(entitlement)).into_response(),
        Err(LedgerError::Invalid(reason)) => {
            warn!(%reason, "Purchase rejected");
            err_response(StatusCode::BAD_REQUEST, reason)
        }
        Err(error) => {
            error!(?error, "Purchase not recorded");
            err_response(error.to_err_code(), "Failed to record purchase")
        }
    }
}

/// `PUT /catalog/{asset_id}`: point an asset at its storage object.
pub async fn register_asset(
    Extension(state): Extension<AppState>,
    AxumPath(asset_id): AxumPath<String>,
    Json(request): Json<RegisterAssetRequest>,
) -> impl IntoResponse {
    if !is_valid_asset_id(&asset_id) {
        return err_response(StatusCode::BAD_REQUEST, "Invalid asset id");
    }

    if !state
        .catalog
        .register(AssetId::new(asset_id.clone()), request.storage_key.clone())
    {
        return err_response(StatusCode::BAD_REQUEST, "Invalid storage key");
    }

    info!(%asset_id, storage_key = %request.storage_key, "Asset registered");
    (
        StatusCode::OK,
        Json(json!({
            "asset_id": asset_id,
            "storage_key": request.storage_key,
        })),
    )
        .into_response()
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
