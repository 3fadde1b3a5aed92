//! Identity of an index instance.

use crate::storage::RecordStore;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Binds one index to an entity, its coordinate fields and a store.
///
/// Two requests with equal fields address the same index. The id is a
/// seedless hash of the fields, so it is stable across processes and can
/// key the index's persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRequest {
    pub entity_name: String,
    pub latitude_field: String,
    pub longitude_field: String,
    pub store_identity: String,
}

impl IndexRequest {
    pub fn new(
        entity_name: impl Into<String>,
        latitude_field: impl Into<String>,
        longitude_field: impl Into<String>,
        store_identity: impl Into<String>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            latitude_field: latitude_field.into(),
            longitude_field: longitude_field.into(),
            store_identity: store_identity.into(),
        }
    }

    /// A request against `store`, taking its identity.
    pub fn for_store(
        entity_name: impl Into<String>,
        latitude_field: impl Into<String>,
        longitude_field: impl Into<String>,
        store: &dyn RecordStore,
    ) -> Self {
        Self::new(entity_name, latitude_field, longitude_field, store.identity())
    }

    /// Stable identifier of the addressed index.
    pub fn id(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for IndexRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, {})@{}",
            self.entity_name, self.latitude_field, self.longitude_field, self.store_identity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_requests_share_an_id() {
        let a = IndexRequest::new("Venue", "lat", "lon", "main");
        let b = IndexRequest::new("Venue", "lat", "lon", "main");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_any_field_changes_the_id() {
        let base = IndexRequest::new("Venue", "lat", "lon", "main");
        let variants = [
            IndexRequest::new("Park", "lat", "lon", "main"),
            IndexRequest::new("Venue", "latitude", "lon", "main"),
            IndexRequest::new("Venue", "lat", "lng", "main"),
            IndexRequest::new("Venue", "lat", "lon", "other"),
            // Field boundaries matter, not just the concatenation.
            IndexRequest::new("Venu", "elat", "lon", "main"),
        ];
        for variant in &variants {
            assert_ne!(base.id(), variant.id(), "{}", variant);
        }
    }
}
