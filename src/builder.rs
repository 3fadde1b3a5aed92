//! Context builder for flexible configuration
//!
//! This module provides a builder pattern for creating an [`IndexContext`]
//! over an in-memory store, a snapshot-backed store or a caller-supplied
//! store.

use crate::config::Config;
use crate::context::IndexContext;
use crate::error::{GeoquadError, Result};
use crate::storage::{MemoryStore, RecordStore};
#[cfg(feature = "snapshot")]
use crate::storage::snapshot::SnapshotConfig;
#[cfg(feature = "snapshot")]
use std::path::PathBuf;
use std::sync::Arc;

/// Builder for an index context with custom storage and settings.
pub struct ContextBuilder {
    #[cfg(feature = "snapshot")]
    snapshot_path: Option<PathBuf>,
    #[cfg(feature = "snapshot")]
    snapshot_config: SnapshotConfig,
    store: Option<Arc<dyn RecordStore>>,
    store_name: String,
    config: Config,
}

impl ContextBuilder {
    /// Create a new builder with default in-memory configuration.
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "snapshot")]
            snapshot_path: None,
            #[cfg(feature = "snapshot")]
            snapshot_config: SnapshotConfig::default(),
            store: None,
            store_name: "memory".to_string(),
            config: Config::default(),
        }
    }

    /// Back the store with a snapshot file. The file is created if needed
    /// and loaded on startup.
    #[cfg(feature = "snapshot")]
    pub fn snapshot_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.snapshot_path = Some(path.into());
        self.store = None;
        self
    }

    /// Write snapshots only every `ops` store operations instead of on
    /// every commit.
    #[cfg(feature = "snapshot")]
    pub fn snapshot_every(mut self, ops: usize) -> Self {
        self.snapshot_config.auto_snapshot_ops = Some(ops);
        self
    }

    /// Use an in-memory store named `name`.
    pub fn in_memory(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self.store = None;
        #[cfg(feature = "snapshot")]
        {
            self.snapshot_path = None;
        }
        self
    }

    /// Index an existing store.
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        #[cfg(feature = "snapshot")]
        {
            self.snapshot_path = None;
        }
        self
    }

    /// Set the index configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn bucket_capacity(mut self, capacity: usize) -> Self {
        self.config = self.config.with_bucket_capacity(capacity);
        self
    }

    /// Build the context. Opens the snapshot file if configured.
    pub fn build(self) -> Result<IndexContext> {
        self.config.validate().map_err(GeoquadError::InvalidInput)?;

        let store: Arc<dyn RecordStore> = match self.store {
            Some(store) => store,
            None => {
                #[cfg(feature = "snapshot")]
                if let Some(path) = self.snapshot_path {
                    let store = MemoryStore::open(path, self.snapshot_config)?;
                    return Ok(IndexContext::new(Arc::new(store), self.config));
                }
                Arc::new(MemoryStore::new(self.store_name))
            }
        };
        Ok(IndexContext::new(store, self.config))
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Record;

    #[test]
    fn test_builder_default_is_in_memory() {
        let context = ContextBuilder::new().build().unwrap();
        assert_eq!(context.store().identity(), "memory");
    }

    #[test]
    fn test_builder_with_config() {
        let context = ContextBuilder::new()
            .in_memory("venues")
            .bucket_capacity(4)
            .build()
            .unwrap();
        assert_eq!(context.config().bucket_capacity, 4);
        assert_eq!(context.store().identity(), "venues");
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let config = Config::default().with_rebuild_threshold(-1.0);
        assert!(matches!(
            ContextBuilder::new().config(config).build(),
            Err(GeoquadError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_builder_existing_store() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new("shared"));
        store.put(&Record::new("Venue", 1)).unwrap();

        let context = ContextBuilder::new().store(store.clone()).build().unwrap();
        assert!(Arc::ptr_eq(context.store(), &store));
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn test_builder_snapshot_path_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("venues.snapshot");

        {
            let context = ContextBuilder::new().snapshot_path(&path).build().unwrap();
            context.store().put(&Record::new("Venue", 1)).unwrap();
            context.store().commit().unwrap();
        }

        let context = ContextBuilder::new().snapshot_path(&path).build().unwrap();
        assert!(
            context
                .store()
                .contains(&crate::RecordId::new("Venue", 1))
                .unwrap()
        );
    }
}
