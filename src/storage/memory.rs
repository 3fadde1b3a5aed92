//! In-memory record store.

use super::{CommitHook, HookId, Record, RecordStore, StoreOp, StoreStats};
use crate::error::{GeoquadError, Result};
use bytes::Bytes;
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::{FieldValue, RecordId};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "snapshot")]
use super::snapshot::{SnapshotConfig, SnapshotFile, StoreImage};

#[derive(Default)]
struct StoreData {
    records: BTreeMap<RecordId, BTreeMap<String, FieldValue>>,
    indexes: BTreeMap<u64, Vec<u8>>,
    /// `"{index:016x}/{geohash}/{record}"` -> point
    index_points: BTreeMap<Bytes, DataSnapshot>,
    /// `(index, record)` -> key in `index_points`
    point_keys: FxHashMap<(u64, RecordId), Bytes>,
    stats: StoreStats,
}

impl StoreData {
    fn put_record(&mut self, record: &Record) {
        let old = self
            .records
            .insert(record.id().clone(), record.fields().clone());
        if old.is_none() {
            self.stats.record_count += 1;
        }
        self.stats.operations_count += 1;
    }

    fn delete_record(&mut self, id: &RecordId) -> bool {
        let existed = self.records.remove(id).is_some();
        if existed {
            self.stats.record_count = self.stats.record_count.saturating_sub(1);
        }
        self.stats.operations_count += 1;
        existed
    }

    fn insert_point(&mut self, index_id: u64, geohash: &str, point: &DataSnapshot) {
        self.remove_point(index_id, point.id());
        let key = point_key(index_id, geohash, point.id());
        self.index_points.insert(key.clone(), point.clone());
        self.point_keys.insert((index_id, point.id().clone()), key);
    }

    fn remove_point(&mut self, index_id: u64, id: &RecordId) {
        if let Some(key) = self.point_keys.remove(&(index_id, id.clone())) {
            self.index_points.remove(&key);
        }
    }

    #[cfg(feature = "snapshot")]
    fn image(&self) -> StoreImage {
        let index_points = self
            .point_keys
            .iter()
            .filter_map(|((index_id, _), key)| {
                let point = self.index_points.get(key)?;
                let geohash = geohash_from_key(key)?;
                Some((*index_id, geohash, point.clone()))
            })
            .collect();

        StoreImage {
            records: self.records.clone(),
            indexes: self.indexes.clone(),
            index_points,
        }
    }

    #[cfg(feature = "snapshot")]
    fn restore(image: StoreImage) -> Self {
        let mut data = StoreData {
            records: image.records,
            indexes: image.indexes,
            ..Default::default()
        };
        for (index_id, geohash, point) in &image.index_points {
            data.insert_point(*index_id, geohash, point);
        }
        data.stats.record_count = data.records.len();
        data
    }
}

fn index_prefix(index_id: u64, geohash_prefix: &str) -> Bytes {
    Bytes::from(format!("{:016x}/{}", index_id, geohash_prefix))
}

fn point_key(index_id: u64, geohash: &str, id: &RecordId) -> Bytes {
    Bytes::from(format!("{:016x}/{}/{}", index_id, geohash, id))
}

#[cfg(feature = "snapshot")]
fn geohash_from_key(key: &Bytes) -> Option<String> {
    let text = std::str::from_utf8(key).ok()?;
    text.split('/').nth(1).map(str::to_string)
}

/// In-memory record store using ordered maps.
///
/// Writes are visible immediately. [`commit`](RecordStore::commit) runs the
/// registered hooks and, when the store was opened on a file, writes a
/// snapshot of its full contents.
///
/// # Examples
///
/// ```rust
/// use geoquad::storage::{MemoryStore, Record, RecordStore};
///
/// let store = MemoryStore::new("places");
/// let cafe = Record::new("Cafe", 1).with_field("name", "Blue Bottle");
/// store.put(&cafe)?;
/// store.commit()?;
/// assert!(store.contains(cafe.id())?);
/// # Ok::<(), geoquad::GeoquadError>(())
/// ```
pub struct MemoryStore {
    identity: String,
    data: RwLock<StoreData>,
    hooks: Mutex<Vec<(HookId, CommitHook)>>,
    next_hook_id: AtomicU64,
    #[cfg(feature = "snapshot")]
    snapshot: Option<Mutex<SnapshotFile>>,
}

impl MemoryStore {
    /// Create an empty store named `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            data: RwLock::new(StoreData::default()),
            hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
            #[cfg(feature = "snapshot")]
            snapshot: None,
        }
    }

    /// Open a store backed by a snapshot file, loading its current contents.
    ///
    /// The store identity is the file path, so reopening the same file
    /// addresses the same persisted indexes.
    #[cfg(feature = "snapshot")]
    pub fn open<P: AsRef<std::path::Path>>(path: P, config: SnapshotConfig) -> Result<Self> {
        let file = SnapshotFile::new(path.as_ref(), config);
        let image = file.load()?;
        log::debug!(
            "Opened store {} with {} records",
            path.as_ref().display(),
            image.records.len()
        );

        let mut store = Self::new(path.as_ref().to_string_lossy().into_owned());
        store.data = RwLock::new(StoreData::restore(image));
        store.snapshot = Some(Mutex::new(file));
        Ok(store)
    }

    /// Write a snapshot now, regardless of the snapshot policy.
    #[cfg(feature = "snapshot")]
    pub fn snapshot_now(&self) -> Result<()> {
        if let Some(file) = &self.snapshot {
            let image = self.data.read().image();
            file.lock().save(&image)?;
        }
        Ok(())
    }

    fn record_operations(&self, _count: usize) {
        #[cfg(feature = "snapshot")]
        if let Some(file) = &self.snapshot {
            let mut file = file.lock();
            for _ in 0.._count {
                file.record_operation();
            }
        }
    }
}

impl RecordStore for MemoryStore {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let data = self.data.read();
        Ok(data
            .records
            .get(id)
            .map(|fields| Record::from_parts(id.clone(), fields.clone())))
    }

    fn contains(&self, id: &RecordId) -> Result<bool> {
        Ok(self.data.read().records.contains_key(id))
    }

    fn put(&self, record: &Record) -> Result<()> {
        self.data.write().put_record(record);
        self.record_operations(1);
        Ok(())
    }

    fn delete(&self, id: &RecordId) -> Result<bool> {
        let existed = self.data.write().delete_record(id);
        self.record_operations(1);
        Ok(existed)
    }

    fn batch(&self, ops: &[StoreOp]) -> Result<()> {
        // Validate first so a rejected batch leaves nothing behind.
        for op in ops {
            if let StoreOp::Put(record) = op
                && record.entity_class().is_empty()
            {
                return Err(GeoquadError::Storage(format!(
                    "record {} has no entity class",
                    record.id()
                )));
            }
        }

        let mut data = self.data.write();
        for op in ops {
            match op {
                StoreOp::Put(record) => data.put_record(record),
                StoreOp::Delete(id) => {
                    data.delete_record(id);
                }
            }
        }
        drop(data);

        self.record_operations(ops.len());
        Ok(())
    }

    fn records(&self, entity_class: &str) -> Result<Vec<Record>> {
        let data = self.data.read();
        Ok(data
            .records
            .iter()
            .filter(|(id, _)| id.entity_class == entity_class)
            .map(|(id, fields)| Record::from_parts(id.clone(), fields.clone()))
            .collect())
    }

    fn commit(&self) -> Result<()> {
        #[cfg(feature = "snapshot")]
        if let Some(file) = &self.snapshot {
            let mut file = file.lock();
            if file.should_snapshot() {
                let image = self.data.read().image();
                file.save(&image)?;
            }
        }

        self.data.write().stats.commit_count += 1;

        // Hooks may call back into the store, so run them unlocked.
        let hooks: Vec<CommitHook> = self.hooks.lock().iter().map(|(_, h)| h.clone()).collect();
        for hook in hooks {
            hook();
        }
        Ok(())
    }

    fn add_commit_hook(&self, hook: CommitHook) -> HookId {
        let id = self.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.hooks.lock().push((id, hook));
        id
    }

    fn remove_commit_hook(&self, id: HookId) {
        self.hooks.lock().retain(|(hook_id, _)| *hook_id != id);
    }

    fn save_index(&self, index_id: u64, blob: &[u8]) -> Result<()> {
        self.data.write().indexes.insert(index_id, blob.to_vec());
        self.record_operations(1);
        Ok(())
    }

    fn load_index(&self, index_id: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().indexes.get(&index_id).cloned())
    }

    fn delete_index(&self, index_id: u64) -> Result<()> {
        self.data.write().indexes.remove(&index_id);
        self.record_operations(1);
        Ok(())
    }

    fn put_index_points(&self, index_id: u64, points: &[(String, DataSnapshot)]) -> Result<()> {
        let mut data = self.data.write();
        for (geohash, point) in points {
            data.insert_point(index_id, geohash, point);
        }
        drop(data);
        self.record_operations(points.len());
        Ok(())
    }

    fn remove_index_points(&self, index_id: u64, ids: &[RecordId]) -> Result<()> {
        let mut data = self.data.write();
        for id in ids {
            data.remove_point(index_id, id);
        }
        drop(data);
        self.record_operations(ids.len());
        Ok(())
    }

    fn index_points_with_prefix(&self, index_id: u64, prefix: &str) -> Result<Vec<DataSnapshot>> {
        let start = index_prefix(index_id, prefix);
        let data = self.data.read();
        Ok(data
            .index_points
            .range(start.clone()..)
            .take_while(|(key, _)| key.starts_with(&start))
            .map(|(_, point)| point.clone())
            .collect())
    }

    fn clear_index_points(&self, index_id: u64) -> Result<()> {
        let mut data = self.data.write();
        let start = index_prefix(index_id, "");
        let keys: Vec<Bytes> = data
            .index_points
            .range(start.clone()..)
            .take_while(|(key, _)| key.starts_with(&start))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            data.index_points.remove(key);
        }
        data.point_keys.retain(|(id, _), _| *id != index_id);
        drop(data);
        self.record_operations(keys.len());
        Ok(())
    }

    fn sync_indexes(&self) -> Result<()> {
        #[cfg(feature = "snapshot")]
        self.snapshot_now()?;
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        let data = self.data.read();
        let mut stats = data.stats.clone();
        stats.record_count = data.records.len();
        stats.index_count = data.indexes.len();
        stats.index_point_count = data.index_points.len();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn cafe(id: i64, lat: f64, lon: f64) -> Record {
        Record::new("Cafe", id)
            .with_field("lat", lat)
            .with_field("lon", lon)
    }

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new("test");
        let record = cafe(1, 40.0, -74.0).with_field("name", "Joe");
        store.put(&record).unwrap();

        let loaded = store.get(record.id()).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.delete(record.id()).unwrap());
        assert!(!store.delete(record.id()).unwrap());
        assert!(store.get(record.id()).unwrap().is_none());
    }

    #[test]
    fn test_records_by_entity() {
        let store = MemoryStore::new("test");
        store
            .batch(&[
                StoreOp::Put(cafe(1, 1.0, 1.0)),
                StoreOp::Put(cafe(2, 2.0, 2.0)),
                StoreOp::Put(Record::new("Park", 1)),
            ])
            .unwrap();

        assert_eq!(store.records("Cafe").unwrap().len(), 2);
        assert_eq!(store.records("Park").unwrap().len(), 1);
        assert_eq!(store.stats().unwrap().record_count, 3);
    }

    #[test]
    fn test_rejected_batch_writes_nothing() {
        let store = MemoryStore::new("test");
        let result = store.batch(&[StoreOp::Put(cafe(1, 1.0, 1.0)), StoreOp::Put(Record::new("", 2))]);
        assert!(result.is_err());
        assert_eq!(store.stats().unwrap().record_count, 0);
    }

    #[test]
    fn test_commit_hooks() {
        let store = MemoryStore::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook = store.add_commit_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.commit().unwrap();
        store.commit().unwrap();
        store.remove_commit_hook(hook);
        store.commit().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.stats().unwrap().commit_count, 3);
    }

    #[test]
    fn test_index_point_prefix_scan() {
        let store = MemoryStore::new("test");
        let a = DataSnapshot::new("Cafe", 1, 40.7, -74.0);
        let b = DataSnapshot::new("Cafe", 2, 40.8, -73.9);
        let c = DataSnapshot::new("Cafe", 3, 48.8, 2.3);
        store
            .put_index_points(
                9,
                &[
                    ("dr5regw".to_string(), a.clone()),
                    ("dr5rsq1".to_string(), b.clone()),
                    ("u09tunq".to_string(), c.clone()),
                ],
            )
            .unwrap();
        store
            .put_index_points(10, &[("dr5regw".to_string(), a.clone())])
            .unwrap();

        assert_eq!(store.index_points_with_prefix(9, "dr5").unwrap().len(), 2);
        assert_eq!(store.index_points_with_prefix(9, "").unwrap().len(), 3);
        assert_eq!(store.index_points_with_prefix(10, "").unwrap().len(), 1);

        // Re-keying a point replaces the old entry.
        store
            .put_index_points(9, &[("u09tunr".to_string(), a.clone())])
            .unwrap();
        assert_eq!(store.index_points_with_prefix(9, "dr5").unwrap(), vec![b]);
        assert_eq!(store.index_points_with_prefix(9, "u09").unwrap().len(), 2);

        store.remove_index_points(9, &[c.id().clone()]).unwrap();
        assert_eq!(store.index_points_with_prefix(9, "u09").unwrap(), vec![a]);

        store.clear_index_points(9).unwrap();
        assert!(store.index_points_with_prefix(9, "").unwrap().is_empty());
        assert_eq!(store.index_points_with_prefix(10, "").unwrap().len(), 1);
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn test_reopen_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.snapshot");

        {
            let store = MemoryStore::open(&path, SnapshotConfig::default()).unwrap();
            store.put(&cafe(1, 40.0, -74.0)).unwrap();
            store.save_index(5, b"tree").unwrap();
            store
                .put_index_points(5, &[("dr5r".to_string(), DataSnapshot::new("Cafe", 1, 40.0, -74.0))])
                .unwrap();
            store.commit().unwrap();
        }

        let store = MemoryStore::open(&path, SnapshotConfig::default()).unwrap();
        assert!(store.contains(&RecordId::new("Cafe", 1)).unwrap());
        assert_eq!(store.load_index(5).unwrap(), Some(b"tree".to_vec()));
        assert_eq!(store.index_points_with_prefix(5, "dr").unwrap().len(), 1);
        assert_eq!(store.identity(), path.to_string_lossy());
    }
}
