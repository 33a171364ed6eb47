//! Asset Index
//!
//! Key-value lookup for asset descriptors. The catalog that feeds the index
//! is out of scope; the negotiation manager only needs to resolve the asset
//! referenced by an inbound offer.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::AssetId;

/// Immutable description of a data asset known to this connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub id: AssetId,
    /// Free-form properties (content type, labels, source address hints)
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl AssetDescriptor {
    pub fn new(id: impl Into<AssetId>) -> Self {
        Self {
            id: id.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Asset descriptor lookup
#[async_trait]
pub trait AssetIndex: Send + Sync {
    /// Resolve an asset id, `None` if the asset is unknown
    async fn lookup(&self, asset_id: &str) -> Option<AssetDescriptor>;
}

/// In-memory asset index backed by a concurrent map
#[derive(Default)]
pub struct InMemoryAssetIndex {
    entries: DashMap<AssetId, AssetDescriptor>,
}

impl InMemoryAssetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: AssetDescriptor) {
        self.entries.insert(descriptor.id.clone(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AssetIndex for InMemoryAssetIndex {
    async fn lookup(&self, asset_id: &str) -> Option<AssetDescriptor> {
        self.entries.get(asset_id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_known_asset() {
        let index = InMemoryAssetIndex::new();
        index.insert(AssetDescriptor::new("A-1").with_property("contentType", "text/csv"));

        let descriptor = index.lookup("A-1").await.unwrap();
        assert_eq!(descriptor.id, "A-1");
        assert_eq!(
            descriptor.properties.get("contentType").map(String::as_str),
            Some("text/csv")
        );
    }

    #[tokio::test]
    async fn test_lookup_unknown_asset() {
        let index = InMemoryAssetIndex::new();
        assert!(index.lookup("missing").await.is_none());
    }
}
