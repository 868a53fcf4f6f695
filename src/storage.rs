use crate::clock::Clock;
use crate::token::{KeyRing, ObjectGrant, TokenError};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use opendal::Operator;
use opendal::services::{Fs, S3};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const OBJECTS_DIR: &str = "objects";

/// Bearer URL returned by the object-storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The backend cannot express a lifetime this short
    #[error("Requested lifetime {0:?} is below the backend resolution")]
    TtlTooShort(Duration),
}

/// Object-storage collaborator: mints a bearer URL for one stored object.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn mint_bearer_url(&self, storage_key: &str, ttl: Duration)
    -> Result<BearerUrl, StorageError>;
}

/// Storage configuration
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub workspace: PathBuf,
    /// Base URL local bearer URLs are minted under
    pub public_base_url: String,
}

#[derive(Clone, Debug)]
pub enum StorageBackend {
    Local,
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    },
}

/// Why a local object request was refused
#[derive(Debug, Error, Eq, PartialEq)]
pub enum GrantRejection {
    #[error("Invalid object grant: {0}")]
    Invalid(#[from] TokenError),

    #[error("Object grant does not cover this key")]
    KeyMismatch,

    #[error("Object grant has expired")]
    Expired,
}

impl GrantRejection {
    pub fn to_err_code(&self) -> StatusCode {
        match self {
            GrantRejection::Invalid(_) => StatusCode::UNAUTHORIZED,
            GrantRejection::KeyMismatch | GrantRejection::Expired => StatusCode::FORBIDDEN,
        }
    }
}

/// Storage manager over the configured opendal backend.
///
/// S3 bearer URLs are presigned by the operator. The local backend has no
/// presign support, so it seals an [`ObjectGrant`] into the URL instead and
/// the `/objects` route verifies it.
#[derive(Clone)]
pub struct StorageManager {
    operator: Operator,
    config: StorageConfig,
    keys: KeyRing,
    clock: Arc<dyn Clock>,
}

impl StorageManager {
    pub async fn new(config: StorageConfig, keys: KeyRing, clock: Arc<dyn Clock>) -> Result<Self> {
        let operator = match &config.backend {
            StorageBackend::Local => {
                let root = config.workspace.join(OBJECTS_DIR);
                tokio::fs::create_dir_all(&root).await?;
                build_fs_operator(&tokio::fs::canonicalize(&root).await?)?
            }
            StorageBackend::S3 {
                bucket,
                endpoint,
                region,
                access_key_id,
                secret_access_key,
            } => build_s3_operator(
                bucket,
                endpoint.as_deref(),
                region.as_deref(),
                access_key_id,
                secret_access_key,
            )?,
        };

        Ok(Self {
            operator,
            config,
            keys,
            clock,
        })
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.config.backend, StorageBackend::S3 { .. })
    }

    /// Check a sealed object grant presented for `storage_key`.
    pub fn verify_grant(&self, storage_key: &str, token: &str) -> Result<ObjectGrant, GrantRejection> {
        let grant = self.keys.open::<ObjectGrant>(token)?;
        if grant.storage_key != storage_key {
            return Err(GrantRejection::KeyMismatch);
        }
        if !grant.is_live_at(self.clock.now()) {
            return Err(GrantRejection::Expired);
        }
        Ok(grant)
    }

    async fn presign_s3(&self, storage_key: &str, ttl: Duration) -> Result<BearerUrl, StorageError> {
        // Presigned URLs carry whole seconds; round down so the URL never
        // outlives the requested window.
        let ttl = Duration::from_secs(ttl.as_secs());
        if ttl.is_zero() {
            return Err(StorageError::TtlTooShort(ttl));
        }

        let now = self.clock.now();
        let presigned = self
            .operator
            .presign_read(storage_key, ttl)
            .await
            .map_err(|error| StorageError::Unavailable(error.to_string()))?;

        Ok(BearerUrl {
            url: presigned.uri().to_string(),
            expires_at: now + chrono_ttl(ttl)?,
        })
    }

    fn sign_local(&self, storage_key: &str, ttl: Duration) -> Result<BearerUrl, StorageError> {
        let expires_at_ms = (self.clock.now() + chrono_ttl(ttl)?).timestamp_millis();
        let expires_at = DateTime::<Utc>::from_timestamp_millis(expires_at_ms)
            .ok_or_else(|| StorageError::Unavailable("Expiry out of range".to_string()))?;

        let token = self
            .keys
            .seal(&ObjectGrant {
                storage_key: storage_key.to_string(),
                expires_at_ms,
            })
            .map_err(|error| StorageError::Unavailable(error.to_string()))?;

        Ok(BearerUrl {
            url: format!(
                "{}/{OBJECTS_DIR}/{storage_key}?token={token}",
                self.config.public_base_url.trim_end_matches('/')
            ),
            expires_at,
        })
    }
}

#[async_trait]
impl ObjectStorage for StorageManager {
    async fn mint_bearer_url(
        &self,
        storage_key: &str,
        ttl: Duration,
    ) -> Result<BearerUrl, StorageError> {
        let result = if self.is_remote() {
            self.presign_s3(storage_key, ttl).await
        } else {
            self.sign_local(storage_key, ttl)
        };

        match &result {
            Ok(bearer) => {
                debug!(%storage_key, expires_at = %bearer.expires_at, "Minted bearer URL")
            }
            Err(error) => warn!(%storage_key, %error, "Failed to mint bearer URL"),
        }
        result
    }
}

fn chrono_ttl(ttl: Duration) -> Result<ChronoDuration, StorageError> {
    ChronoDuration::from_std(ttl)
        .map_err(|_| StorageError::Unavailable(format!("Lifetime out of range: {ttl:?}")))
}

fn build_fs_operator(root: &Path) -> Result<Operator> {
    info!(root = ?root, "Building filesystem operator");

    let mut builder = Fs::default();
    builder = builder.root(
        root.to_str()
            .ok_or_else(|| anyhow!("Invalid root path: {:?}", root))?,
    );

    Ok(Operator::new(builder)?.finish())
}

fn build_s3_operator(
    bucket: &str,
    endpoint: Option<&str>,
    region: Option<&str>,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    info!(
        bucket = %bucket,
        endpoint = ?endpoint,
        region = ?region,
        "Building S3 operator"
    );

    let mut builder = S3::default();
    builder = builder.bucket(bucket);
    builder = builder.access_key_id(access_key_id);
    builder = builder.secret_access_key(secret_access_key);

    if let Some(region) = region {
        builder = builder.region(region);
    }

    if let Some(endpoint) = endpoint {
        builder = builder.endpoint(endpoint);
    }

    // No retry layer: a failed issuance is surfaced, never papered over.
    Ok(Operator::new(builder)?.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    async fn local_manager(workspace: &Path) -> StorageManager {
        let config = StorageConfig {
            backend: StorageBackend::Local,
            workspace: workspace.to_path_buf(),
            public_base_url: "http://media.test/".to_string(),
        };
        StorageManager::new(config, KeyRing::new(), Arc::new(SystemClock))
            .await
            .unwrap()
    }

    fn token_of(url: &str) -> &str {
        url.split_once("?token=").unwrap().1
    }

    #[tokio::test]
    async fn test_local_bearer_url_verifies_for_its_key() {
        let workspace = std::env::temp_dir().join(format!("storage-{}", uuid::Uuid::new_v4()));
        let manager = local_manager(&workspace).await;

        let before = Utc::now();
        let bearer = manager
            .mint_bearer_url("films/a.mp4", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(bearer.url.starts_with("http://media.test/objects/films/a.mp4?token="));
        assert!(bearer.expires_at <= Utc::now() + ChronoDuration::seconds(60));
        assert!(bearer.expires_at >= before + ChronoDuration::seconds(59));

        let token = token_of(&bearer.url);
        assert!(manager.verify_grant("films/a.mp4", token).is_ok());
        assert_eq!(
            manager.verify_grant("films/b.mp4", token).unwrap_err(),
            GrantRejection::KeyMismatch
        );
        assert!(matches!(
            manager.verify_grant("films/a.mp4", "bogus"),
            Err(GrantRejection::Invalid(_))
        ));

        std::fs::remove_dir_all(workspace).ok();
    }

    #[tokio::test]
    async fn test_local_grant_expires() {
        let workspace = std::env::temp_dir().join(format!("storage-{}", uuid::Uuid::new_v4()));
        let manager = local_manager(&workspace).await;

        let bearer = manager
            .mint_bearer_url("films/a.mp4", Duration::ZERO)
            .await
            .unwrap();

        let rejection = manager
            .verify_grant("films/a.mp4", token_of(&bearer.url))
            .unwrap_err();
        assert_eq!(rejection, GrantRejection::Expired);
        assert_eq!(rejection.to_err_code(), StatusCode::FORBIDDEN);

        std::fs::remove_dir_all(workspace).ok();
    }
}
