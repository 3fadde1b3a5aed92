//! Thread-safe snapshots of live records.
//!
//! A [`Record`] is bound to the thread that read it. The types here copy
//! what the index needs out of a record so it can cross threads and outlive
//! the record:
//!
//! - [`SafeRecord`] keeps the identity and every scalar field
//! - [`DataSnapshot`] keeps the identity and one coordinate pair
//!
//! Taking a snapshot never fails. Going back to a live record can: the
//! record may have been deleted in the meantime, which callers treat as a
//! normal outcome.

use crate::error::{GeoquadError, Result};
use crate::storage::{Record, RecordStore};
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::{FieldValue, PrimaryKey, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Owned copy of a record's identity and scalar fields.
///
/// Equality and hashing use the identity only, so a stale copy and a fresh
/// copy of the same record collapse to one entry in a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeRecord {
    id: RecordId,
    fields: BTreeMap<String, FieldValue>,
}

impl SafeRecord {
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

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Project onto a point using the named coordinate fields.
    ///
    /// Returns `None` if either field is missing, not numeric or not finite.
    pub fn to_point(&self, latitude_field: &str, longitude_field: &str) -> Option<DataSnapshot> {
        let latitude = self.field(latitude_field)?.as_f64()?;
        let longitude = self.field(longitude_field)?.as_f64()?;
        let point = DataSnapshot::from_id(self.id.clone(), latitude, longitude);
        point.has_valid_coordinate().then_some(point)
    }

    /// Read the live record back from `store` on the calling thread.
    pub fn resolve(&self, store: &dyn RecordStore) -> Result<Record> {
        resolve_id(&self.id, store)
    }
}

impl From<&Record> for SafeRecord {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id().clone(),
            fields: record.fields().clone(),
        }
    }
}

impl PartialEq for SafeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SafeRecord {}

impl Hash for SafeRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Snapshot a live record as an indexable point.
///
/// Returns `None` when the record lacks usable coordinates; such records
/// cannot be placed in a spatial index.
///
/// # Examples
///
/// ```rust
/// use geoquad::snapshot::snapshot;
/// use geoquad::storage::Record;
///
/// let record = Record::new("Cafe", 1)
///     .with_field("lat", 40.7128)
///     .with_field("lon", -74.0060);
/// let point = snapshot(&record, "lat", "lon").unwrap();
/// assert_eq!(point.x(), -74.0060);
///
/// // The snapshot can move to another thread; the record cannot.
/// std::thread::spawn(move || assert_eq!(point.y(), 40.7128)).join().unwrap();
/// ```
pub fn snapshot(record: &Record, latitude_field: &str, longitude_field: &str) -> Option<DataSnapshot> {
    let latitude = record.f64_field(latitude_field)?;
    let longitude = record.f64_field(longitude_field)?;
    let point = DataSnapshot::from_id(record.id().clone(), latitude, longitude);
    point.has_valid_coordinate().then_some(point)
}

/// Look up the live record a snapshot mirrors.
///
/// # Errors
///
/// Returns `NotFound` if the record was deleted after the snapshot was
/// taken. Store failures propagate unchanged.
pub fn resolve(snapshot: &DataSnapshot, store: &dyn RecordStore) -> Result<Record> {
    resolve_id(snapshot.id(), store)
}

fn resolve_id(id: &RecordId, store: &dyn RecordStore) -> Result<Record> {
    store
        .get(id)?
        .ok_or_else(|| GeoquadError::NotFound(id.clone()))
}
