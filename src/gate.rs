//! The access gate: the single decision point between a request and a
//! signed handle.
//!
//! Every access path, initial load and every rotation alike, goes through
//! [`AccessGate::authorize`]. The gate keeps no state between requests and
//! its only side effect is the issuer's storage call on the granted path.

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::entitlement::{AssetId, EntitlementStore, Remaining, StoreError};
use crate::error::AccessError;
use crate::identity::IdentityResolver;
use crate::issuer::{HandleIssuer, SignedHandle};
use axum::http::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_DELIVERY_TTL_CEILING: Duration = Duration::from_secs(120);

/// Per-request decision states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Unauthenticated,
    AuthenticatedNoEntitlement,
    AuthenticatedEntitled,
    Granted,
    Expired,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateState::Unauthenticated => "unauthenticated",
            GateState::AuthenticatedNoEntitlement => "authenticated_no_entitlement",
            GateState::AuthenticatedEntitled => "authenticated_entitled",
            GateState::Granted => "granted",
            GateState::Expired => "expired",
        };
        f.write_str(name)
    }
}

pub struct AccessGate {
    identity: Arc<dyn IdentityResolver>,
    entitlements: Arc<dyn EntitlementStore>,
    catalog: Arc<dyn Catalog>,
    issuer: HandleIssuer,
    clock: Arc<dyn Clock>,
    ttl_ceiling: Duration,
}

impl AccessGate {
    pub fn new(
        identity: Arc<dyn IdentityResolver>,
        entitlements: Arc<dyn EntitlementStore>,
        catalog: Arc<dyn Catalog>,
        issuer: HandleIssuer,
        clock: Arc<dyn Clock>,
        ttl_ceiling: Duration,
    ) -> Self {
        Self {
            identity,
            entitlements,
            catalog,
            issuer,
            clock,
            ttl_ceiling,
        }
    }

    pub fn ttl_ceiling(&self) -> Duration {
        self.ttl_ceiling
    }

    /// Decide whether the caller behind `credentials` may watch `asset_id`
    /// right now and, if so, mint a handle for it.
    pub async fn authorize(
        &self,
        credentials: &HeaderMap,
        asset_id: &AssetId,
    ) -> Result<SignedHandle, AccessError> {
        // Unauthenticated: nothing about the asset is looked at before this.
        let principal_id = match self.identity.resolve_principal(credentials).await {
            Ok(Some(principal_id)) => principal_id,
            Ok(None) => {
                debug!(state = %GateState::Unauthenticated, "No session");
                return Err(AccessError::Unauthenticated);
            }
            Err(error) => {
                warn!(state = %GateState::Unauthenticated, ?error, "Identity provider failed");
                return Err(AccessError::Unauthenticated);
            }
        };

        let entitlement = match self
            .entitlements
            .find_live_entitlement(&principal_id, asset_id)
            .await
        {
            Ok(Some(entitlement)) => entitlement,
            Ok(None) => {
                info!(
                    state = %GateState::AuthenticatedNoEntitlement,
                    %principal_id,
                    %asset_id,
                    "Access denied"
                );
                return Err(AccessError::NotEntitled);
            }
            Err(StoreError::Unavailable(reason)) => {
                warn!(%principal_id, %asset_id, %reason, "Entitlement lookup failed, denying");
                return Err(AccessError::EntitlementUnavailable(reason));
            }
        };

        // Re-check against our own clock: the store may have answered just
        // before the row lapsed.
        let now = self.clock.now();
        let max_ttl = match entitlement.remaining_at(now) {
            Remaining::Unbounded => self.ttl_ceiling,
            Remaining::Bounded(remaining) => remaining.min(self.ttl_ceiling),
            Remaining::Lapsed => {
                info!(
                    state = %GateState::Expired,
                    %principal_id,
                    %asset_id,
                    entitlement_id = %entitlement.id,
                    "Entitlement lapsed during decision"
                );
                return Err(AccessError::Expired);
            }
        };

        debug!(
            state = %GateState::AuthenticatedEntitled,
            %principal_id,
            %asset_id,
            entitlement_id = %entitlement.id,
            ?max_ttl,
        );

        let Some(storage_key) = self.catalog.storage_key(asset_id).await else {
            warn!(%principal_id, %asset_id, "Entitled asset has no storage key");
            return Err(AccessError::AssetUnavailable);
        };

        // Time spent since `now` comes out of the handle, not the entitlement.
        let handle = match self
            .issuer
            .issue(asset_id, &storage_key, max_ttl, entitlement.expires_at)
            .await
        {
            Ok(handle) => handle,
            Err(AccessError::Expired) => {
                info!(
                    state = %GateState::Expired,
                    %principal_id,
                    %asset_id,
                    entitlement_id = %entitlement.id,
                    "Entitlement lapsed during issuance"
                );
                return Err(AccessError::Expired);
            }
            Err(error) => return Err(error),
        };

        info!(
            state = %GateState::Granted,
            %principal_id,
            %asset_id,
            expires_at = %handle.expires_at,
            "Access granted"
        );
        Ok(handle)
    }
}
