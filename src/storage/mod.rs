//! Record store abstraction for geoquad
//!
//! The index never owns application data. It reads records from, and
//! persists its own state into, a store implementing [`RecordStore`]. The
//! store is expected to hand out live [`Record`] values bound to the thread
//! that read them and to call registered hooks after every commit.

mod memory;
#[cfg(feature = "snapshot")]
pub mod snapshot;

pub use memory::MemoryStore;

use crate::error::Result;
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::{FieldValue, PrimaryKey, RecordId};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// A live record read from a store.
///
/// Records are bound to the thread that obtained them and are neither
/// `Send` nor `Sync`. To hand a record to another thread, take a
/// [`SafeRecord`](crate::snapshot::SafeRecord) or a
/// [`DataSnapshot`] of it and resolve it again on the other side.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: RecordId,
    fields: BTreeMap<String, FieldValue>,
    _not_send_sync: PhantomData<*const ()>,
}

impl Record {
    /// Create an empty record of `entity_class` with the given primary key.
    pub fn new(entity_class: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self::from_parts(RecordId::new(entity_class, primary_key), BTreeMap::new())
    }

    pub(crate) fn from_parts(id: RecordId, fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            id,
            fields,
            _not_send_sync: PhantomData,
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field, returning the previous value.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Option<FieldValue> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn entity_class(&self) -> &str {
        &self.id.entity_class
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.id.primary_key
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Numeric value of a field, if present and numeric.
    pub fn f64_field(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(FieldValue::as_f64)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }
}

/// Store operation for batch processing
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Create or replace a record
    Put(Record),
    /// Delete a record by identity
    Delete(RecordId),
}

/// Callback run after every successful commit.
pub type CommitHook = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`RecordStore::add_commit_hook`].
pub type HookId = u64;

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of records
    pub record_count: usize,
    /// Number of persisted index blobs
    pub index_count: usize,
    /// Number of persisted index points across all indexes
    pub index_point_count: usize,
    /// Number of write operations performed
    pub operations_count: u64,
    /// Number of commits
    pub commit_count: u64,
}

/// Trait for record store implementations
///
/// Methods take `&self`; implementations synchronise internally so a single
/// store can be shared between the caller's thread and the index writers.
pub trait RecordStore: Send + Sync {
    /// Stable name of this store, part of every index identity.
    fn identity(&self) -> &str;

    /// Read a record by identity.
    fn get(&self, id: &RecordId) -> Result<Option<Record>>;

    /// Check if a record exists
    fn contains(&self, id: &RecordId) -> Result<bool>;

    /// Create or replace a record
    fn put(&self, record: &Record) -> Result<()>;

    /// Delete a record, returning whether it existed
    fn delete(&self, id: &RecordId) -> Result<bool>;

    /// Apply every operation or none of them.
    fn batch(&self, ops: &[StoreOp]) -> Result<()>;

    /// All records of one entity class.
    fn records(&self, entity_class: &str) -> Result<Vec<Record>>;

    /// Make pending writes durable and run commit hooks.
    fn commit(&self) -> Result<()>;

    /// Register a hook to run after each commit.
    fn add_commit_hook(&self, hook: CommitHook) -> HookId;

    /// Unregister a commit hook. Unknown ids are ignored.
    fn remove_commit_hook(&self, id: HookId);

    /// Persist the serialized state of index `index_id`.
    fn save_index(&self, index_id: u64, blob: &[u8]) -> Result<()>;

    /// Load the serialized state of index `index_id`.
    fn load_index(&self, index_id: u64) -> Result<Option<Vec<u8>>>;

    /// Drop the serialized state of index `index_id`.
    fn delete_index(&self, index_id: u64) -> Result<()>;

    /// Persist indexed points keyed by geohash for prefix lookups.
    fn put_index_points(&self, index_id: u64, points: &[(String, DataSnapshot)]) -> Result<()>;

    /// Remove indexed points by record identity.
    fn remove_index_points(&self, index_id: u64, ids: &[RecordId]) -> Result<()>;

    /// Indexed points whose geohash starts with `prefix`.
    fn index_points_with_prefix(&self, index_id: u64, prefix: &str) -> Result<Vec<DataSnapshot>>;

    /// Remove every indexed point of index `index_id`.
    fn clear_index_points(&self, index_id: u64) -> Result<()>;

    /// Make index writes durable without running commit hooks.
    fn sync_indexes(&self) -> Result<()> {
        Ok(())
    }

    /// Get store statistics
    fn stats(&self) -> Result<StoreStats>;
}
