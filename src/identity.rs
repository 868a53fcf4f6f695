use crate::clock::Clock;
use crate::token::{KeyRing, SessionClaims, TokenError};
use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Canonical identity key for every access decision.
///
/// This is the opaque internal principal id issued by the identity
/// provider. E-mail addresses are never used as an identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity collaborator: resolves request credentials to a principal.
///
/// `Ok(None)` means the request carries no valid session. `Err` means the
/// provider itself failed; the gate treats both as unauthenticated.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_principal(
        &self,
        credentials: &HeaderMap,
    ) -> anyhow::Result<Option<PrincipalId>>;
}

/// Extract the bearer token from an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Longest session a token may be minted for.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Identity provider backed by sealed session tokens.
#[derive(Clone)]
pub struct SessionTokenResolver {
    keys: KeyRing,
    clock: Arc<dyn Clock>,
}

impl SessionTokenResolver {
    pub fn new(keys: KeyRing, clock: Arc<dyn Clock>) -> Self {
        Self { keys, clock }
    }

    /// Mint a session token for `principal_id` valid for `ttl`.
    ///
    /// Callers bound `ttl` by [`MAX_SESSION_TTL`]; lifetimes past the end of
    /// representable time are refused here.
    pub fn issue_session(
        &self,
        principal_id: &PrincipalId,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>), TokenError> {
        let expires_at = ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
            .ok_or_else(|| TokenError::InvalidPayload("Session lifetime too long".to_string()))?;

        let token = self.keys.seal(&SessionClaims {
            principal_id: principal_id.as_str().to_string(),
            expires_at_ms: expires_at.timestamp_millis(),
        })?;

        Ok((token, expires_at))
    }
}

#[async_trait]
impl IdentityResolver for SessionTokenResolver {
    async fn resolve_principal(
        &self,
        credentials: &HeaderMap,
    ) -> anyhow::Result<Option<PrincipalId>> {
        let Some(token) = bearer_token(credentials) else {
            return Ok(None);
        };

        let claims = match self.keys.open::<SessionClaims>(token) {
            Ok(claims) => claims,
            Err(error) => {
                debug!(%error, "Rejected session token");
                return Ok(None);
            }
        };

        if !claims.is_live_at(self.clock.now()) {
            debug!(principal_id = %claims.principal_id, "Session token expired");
            return Ok(None);
        }

        Ok(Some(PrincipalId::new(claims.principal_id)))
    }
}
