use crate::entitlement::AssetId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Catalog collaborator: maps public asset ids to private storage keys.
///
/// Storage keys are never derivable from asset ids, so a handle can only
/// be minted for an object the catalog points at.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn storage_key(&self, asset_id: &AssetId) -> Option<String>;
}

/// Validate storage key with basic rules
pub fn is_valid_storage_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 512
        && !key.starts_with('/')
        && !key.contains('\\')
        && !key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
}

#[derive(Default)]
pub struct MemoryCatalog {
    entries: RwLock<HashMap<AssetId, String>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the storage key of an asset. Returns `false`
    /// when the key is rejected.
    pub fn register(&self, asset_id: AssetId, storage_key: String) -> bool {
        if !is_valid_storage_key(&storage_key) {
            return false;
        }
        self.entries.write().insert(asset_id, storage_key);
        true
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn storage_key(&self, asset_id: &AssetId) -> Option<String> {
        self.entries.read().get(asset_id).cloned()
    }
}
