use crate::clock::Clock;
use crate::entitlement::AssetId;
use crate::error::AccessError;
use crate::storage::{ObjectStorage, StorageError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Short-lived credential for retrieving one asset's bytes.
///
/// Held in memory for one playback interval and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHandle {
    pub asset_id: AssetId,
    pub url: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignedHandle {
    /// Validity window as issued; zero for a handle that was born expired.
    pub fn lifetime(&self) -> Duration {
        (self.expires_at - self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Mints signed handles through the object-storage collaborator.
///
/// The caller must already have verified a live entitlement; the issuer
/// only enforces the lifetime it was handed.
#[derive(Clone)]
pub struct HandleIssuer {
    storage: Arc<dyn ObjectStorage>,
    clock: Arc<dyn Clock>,
}

impl HandleIssuer {
    pub fn new(storage: Arc<dyn ObjectStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// One storage call, no retry.
    ///
    /// The URL lifetime is `max_ttl`, cut down to whatever is left before
    /// `not_after` at the moment of the storage call. The handle never
    /// expires after `not_after`.
    pub async fn issue(
        &self,
        asset_id: &AssetId,
        storage_key: &str,
        max_ttl: Duration,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<SignedHandle, AccessError> {
        let issued_at = self.clock.now();
        let ttl = match not_after {
            None => max_ttl,
            Some(deadline) => match (deadline - issued_at).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining.min(max_ttl),
                _ => {
                    debug!(%asset_id, %deadline, "Entitlement lapsed before issuance");
                    return Err(AccessError::Expired);
                }
            },
        };
        let requested_end = ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|ttl| issued_at.checked_add_signed(ttl))
            .ok_or_else(|| {
                AccessError::StorageUnavailable(format!("Lifetime out of range: {ttl:?}"))
            })?;

        let bearer = match self.storage.mint_bearer_url(storage_key, ttl).await {
            Ok(bearer) => bearer,
            Err(StorageError::TtlTooShort(ttl)) if not_after.is_some() => {
                debug!(%asset_id, ?ttl, "Remaining window below storage resolution");
                return Err(AccessError::Lapsing(ttl));
            }
            Err(error @ StorageError::TtlTooShort(_)) => {
                error!(%asset_id, %error, "Delivery ceiling below storage resolution");
                return Err(AccessError::StorageUnavailable(error.to_string()));
            }
            Err(StorageError::Unavailable(reason)) => {
                error!(%asset_id, %reason, "Object storage unavailable");
                return Err(AccessError::StorageUnavailable(reason));
            }
        };

        // The storage URL may round its own expiry; keep whichever ends first.
        let mut expires_at = requested_end.min(bearer.expires_at);
        if let Some(deadline) = not_after {
            expires_at = expires_at.min(deadline);
        }

        Ok(SignedHandle {
            asset_id: asset_id.clone(),
            url: bearer.url,
            issued_at,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::BearerUrl;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedStorage {
        calls: AtomicUsize,
        result: Result<(), StorageError>,
        // Seconds the storage shaves off the requested lifetime
        rounding: i64,
    }

    #[async_trait]
    impl ObjectStorage for FixedStorage {
        async fn mint_bearer_url(
            &self,
            storage_key: &str,
            ttl: Duration,
        ) -> Result<BearerUrl, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()?;
            Ok(BearerUrl {
                url: format!("https://cdn.test/{storage_key}"),
                expires_at: Utc::now() + ChronoDuration::from_std(ttl).unwrap()
                    - ChronoDuration::seconds(self.rounding),
            })
        }
    }

    fn issuer(result: Result<(), StorageError>, rounding: i64) -> (HandleIssuer, Arc<FixedStorage>) {
        let storage = Arc::new(FixedStorage {
            calls: AtomicUsize::new(0),
            result,
            rounding,
        });
        (HandleIssuer::new(storage.clone(), Arc::new(SystemClock)), storage)
    }

    #[tokio::test]
    async fn test_issue_respects_requested_window() {
        let (issuer, storage) = issuer(Ok(()), 0);
        let asset = AssetId::new("film");

        let handle = issuer
            .issue(&asset, "objects/film.mp4", Duration::from_secs(90), None)
            .await
            .unwrap();

        assert_eq!(handle.asset_id, asset);
        assert_eq!(handle.url, "https://cdn.test/objects/film.mp4");
        assert!(handle.lifetime() <= Duration::from_secs(90));
        assert_eq!(storage.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_issue_takes_earlier_storage_expiry() {
        let (issuer, _) = issuer(Ok(()), 30);

        let handle = issuer
            .issue(&AssetId::new("film"), "k", Duration::from_secs(90), None)
            .await
            .unwrap();

        assert!(handle.lifetime() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_storage_failure_is_not_retried() {
        let (issuer, storage) = issuer(Err(StorageError::Unavailable("503".into())), 0);

        let result = issuer
            .issue(&AssetId::new("film"), "k", Duration::from_secs(90), None)
            .await;

        assert_eq!(result, Err(AccessError::StorageUnavailable("503".into())));
        assert_eq!(storage.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sub_resolution_window_is_lapsing() {
        let short = Duration::from_millis(400);
        let (issuer, _) = issuer(Err(StorageError::TtlTooShort(short)), 0);
        let deadline = Utc::now() + ChronoDuration::seconds(5);

        let result = issuer
            .issue(&AssetId::new("film"), "k", short, Some(deadline))
            .await;
        assert_eq!(result, Err(AccessError::Lapsing(short)));

        let result = issuer.issue(&AssetId::new("film"), "k", short, None).await;
        assert!(matches!(result, Err(AccessError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_handle_ends_by_deadline() {
        let (issuer, _) = issuer(Ok(()), 0);
        let deadline = Utc::now() + ChronoDuration::seconds(30);

        let handle = issuer
            .issue(&AssetId::new("film"), "k", Duration::from_secs(90), Some(deadline))
            .await
            .unwrap();

        assert!(handle.expires_at <= deadline);
        assert!(handle.lifetime() <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_passed_deadline_is_expired() {
        let (issuer, storage) = issuer(Ok(()), 0);
        let deadline = Utc::now() - ChronoDuration::milliseconds(1);

        let result = issuer
            .issue(&AssetId::new("film"), "k", Duration::from_secs(90), Some(deadline))
            .await;

        assert_eq!(result, Err(AccessError::Expired));
        assert_eq!(storage.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lifetime_of_inverted_handle_is_zero() {
        let now = Utc::now();
        let handle = SignedHandle {
            asset_id: AssetId::new("film"),
            url: String::new(),
            issued_at: now,
            expires_at: now - ChronoDuration::seconds(1),
        };
        assert_eq!(handle.lifetime(), Duration::ZERO);
    }
}
