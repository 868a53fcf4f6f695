//! Entitlement records and the read-only store adapter the gate consults.
//!
//! The delivery path only ever sees [`EntitlementStore`], which can read but
//! never grant or extend. Rows are written exclusively by
//! [`EntitlementLedger::record_purchase`], the sink for purchase-completion
//! events.

use crate::clock::Clock;
use crate::identity::PrincipalId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Public catalog identifier of a media asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One principal's paid right to access one asset for a bounded time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Uuid,
    pub principal_id: PrincipalId,
    pub asset_id: AssetId,
    pub granted_at: DateTime<Utc>,
    /// `None` only for non-expiring administrative grants
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_ref: Option<String>,
}

/// Entitlement time left at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// Non-expiring grant
    Unbounded,
    Bounded(Duration),
    Lapsed,
}

impl Entitlement {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at > now,
        }
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Remaining {
        let Some(expires_at) = self.expires_at else {
            return Remaining::Unbounded;
        };

        match (expires_at - now).to_std() {
            Ok(remaining) if !remaining.is_zero() => Remaining::Bounded(remaining),
            _ => Remaining::Lapsed,
        }
    }
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("Entitlement store unavailable: {0}")]
    Unavailable(String),
}

/// Why a purchase-completion event was not recorded.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Invalid(&'static str),

    #[error("Failed to persist entitlement: {0:#}")]
    Persist(anyhow::Error),
}

impl LedgerError {
    pub fn to_err_code(&self) -> StatusCode {
        match self {
            LedgerError::Invalid(_) => StatusCode::BAD_REQUEST,
            LedgerError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Read-only entitlement access for the delivery path.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Return the live entitlement of `principal_id` for `asset_id`.
    ///
    /// Expired rows are `Ok(None)`, never an error.
    async fn find_live_entitlement(
        &self,
        principal_id: &PrincipalId,
        asset_id: &AssetId,
    ) -> Result<Option<Entitlement>, StoreError>;
}

/// Purchase-completion event emitted by the payment collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseCompleted {
    pub principal_id: PrincipalId,
    pub asset_id: AssetId,
    /// Paid-through instant; `None` records a non-expiring grant
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Idempotency key of the payment event
    #[serde(default)]
    pub purchase_ref: Option<String>,
}

type RowKey = (PrincipalId, AssetId);

/// In-memory entitlement table with an optional JSON snapshot on disk.
pub struct EntitlementLedger {
    rows: RwLock<HashMap<RowKey, Vec<Entitlement>>>,
    clock: Arc<dyn Clock>,
    snapshot: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl EntitlementLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            clock,
            snapshot: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a ledger backed by a JSON snapshot file, loading existing rows.
    pub async fn open(snapshot: PathBuf, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut ledger = Self::new(clock);

        match tokio::fs::read_to_string(&snapshot).await {
            Ok(json) if !json.trim().is_empty() => {
                let rows: Vec<Entitlement> = serde_json::from_str(&json)
                    .with_context(|| format!("parse {}", snapshot.display()))?;
                info!(count = rows.len(), path = ?snapshot, "Loaded entitlements");
                ledger.insert_rows(rows);
            }
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?snapshot, "No entitlements file, starting empty");
            }
            Err(error) => {
                return Err(error).with_context(|| format!("read {}", snapshot.display()));
            }
        }

        ledger.snapshot = Some(snapshot);
        Ok(ledger)
    }

    fn insert_rows(&mut self, rows: Vec<Entitlement>) {
        let map = self.rows.get_mut();
        for row in rows {
            map.entry((row.principal_id.clone(), row.asset_id.clone()))
                .or_default()
                .push(row);
        }
    }

    /// Persist a purchase-completion event as a new entitlement row.
    ///
    /// Existing rows are never modified; a renewal is a new row. Replays of
    /// an already recorded `purchase_ref` return the original row. A row
    /// becomes visible to the gate only after its snapshot is on disk.
    pub async fn record_purchase(
        &self,
        event: PurchaseCompleted,
    ) -> Result<Entitlement, LedgerError> {
        let now = self.clock.now();
        if let Some(expires_at) = event.expires_at
            && expires_at <= now
        {
            return Err(LedgerError::Invalid("expires_at must be in the future"));
        }

        // Held across the replay check, the snapshot write and the insert.
        let _guard = self.persist_lock.lock().await;

        if let Some(purchase_ref) = &event.purchase_ref
            && let Some(existing) = self
                .rows
                .read()
                .values()
                .flatten()
                .find(|row| row.purchase_ref.as_ref() == Some(purchase_ref))
        {
            debug!(%purchase_ref, entitlement_id = %existing.id, "Purchase already recorded");
            return Ok(existing.clone());
        }

        let entitlement = Entitlement {
            id: Uuid::new_v4(),
            principal_id: event.principal_id,
            asset_id: event.asset_id,
            granted_at: now,
            expires_at: event.expires_at,
            purchase_ref: event.purchase_ref,
        };

        if let Err(error) = self.write_snapshot(&entitlement).await {
            error!(entitlement_id = %entitlement.id, ?error, "Failed to persist entitlement");
            return Err(LedgerError::Persist(error));
        }

        self.rows
            .write()
            .entry((
                entitlement.principal_id.clone(),
                entitlement.asset_id.clone(),
            ))
            .or_default()
            .push(entitlement.clone());

        info!(
            entitlement_id = %entitlement.id,
            principal_id = %entitlement.principal_id,
            asset_id = %entitlement.asset_id,
            expires_at = ?entitlement.expires_at,
            "Entitlement recorded"
        );
        Ok(entitlement)
    }

    /// Write every recorded row plus `pending` to the snapshot file.
    async fn write_snapshot(&self, pending: &Entitlement) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let json = {
            let rows = self.rows.read();
            let all = rows
                .values()
                .flatten()
                .chain(std::iter::once(pending))
                .collect::<Vec<_>>();
            serde_json::to_string_pretty(&all)?
        };

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for EntitlementLedger {
    async fn find_live_entitlement(
        &self,
        principal_id: &PrincipalId,
        asset_id: &AssetId,
    ) -> Result<Option<Entitlement>, StoreError> {
        let now = self.clock.now();
        let rows = self.rows.read();
        let Some(candidates) = rows.get(&(principal_id.clone(), asset_id.clone())) else {
            return Ok(None);
        };

        // Non-expiring first, then the latest expiry.
        let live = candidates
            .iter()
            .filter(|row| row.is_live_at(now))
            .max_by_key(|row| (row.expires_at.is_none(), row.expires_at));

        if live.is_none() && !candidates.is_empty() {
            warn!(%principal_id, %asset_id, "Only lapsed entitlements found");
        }

        Ok(live.cloned())
    }
}
