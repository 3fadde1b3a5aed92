use geoquad::prelude::*;
use geoquad::storage::snapshot::SnapshotConfig;
use geoquad::{GeoquadError, QuadTreeIndex, StoreOp, StoreStats};
use geoquad::storage::{CommitHook, HookId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn venue(id: i64, lon: f64, lat: f64) -> Record {
    Record::new("Venue", id)
        .with_field("lat", lat)
        .with_field("lon", lon)
}

fn grid(n: i64) -> Vec<Record> {
    (0..n)
        .map(|i| venue(i, -10.0 + (i % 10) as f64, 40.0 + (i / 10) as f64))
        .collect()
}

fn everything() -> BoundingBox {
    BoundingBox::new(-180.0, -90.0, 360.0, 180.0)
}

#[test]
fn test_index_survives_reopen() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("venues.snapshot");

    {
        let context = ContextBuilder::new().snapshot_path(&path).build().unwrap();
        let manager = context.manager_for("Venue", "lat", "lon").unwrap();
        manager.insert_objects(&grid(30)).unwrap();
        manager.flush().unwrap();
        assert_eq!(manager.state(), IndexState::Ready);
    }

    let context = ContextBuilder::new().snapshot_path(&path).build().unwrap();
    let manager = context.manager_for("Venue", "lat", "lon").unwrap();

    // A settled index is reused as-is, no rebuild needed.
    assert_eq!(manager.state(), IndexState::Ready);
    assert_eq!(manager.query(&everything()).unwrap().len(), 30);
    assert_eq!(manager.query_by_coverage(&BoundingBox::new(-10.5, 39.5, 10.0, 3.0)).unwrap().len(), 30);
    manager.validate().unwrap();
}

#[test]
fn test_interrupted_index_is_rebuilt() {
    init_logging();
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new("main"));
    for record in grid(12) {
        store.put(&record).unwrap();
    }

    // Leave behind a half-built index, as if the process died mid-build.
    let config = Config::default();
    let request = IndexRequest::for_store("Venue", "lat", "lon", store.as_ref());
    let mut partial = QuadTreeIndex::new(request.id(), &config);
    partial
        .insert_and_index(DataSnapshot::new("Venue", 0, 40.0, -10.0))
        .unwrap();
    partial.set_state(IndexState::Indexing);
    store.save_index(request.id(), &partial.to_bytes().unwrap()).unwrap();

    let manager = IndexManager::new(request, store.clone(), NotificationManager::new(), config).unwrap();
    assert_eq!(manager.wait_until_ready(Duration::from_secs(10)), IndexState::Ready);
    assert_eq!(manager.len(), 12);

    let persisted = store.load_index(manager.id()).unwrap().unwrap();
    let reloaded = QuadTreeIndex::from_bytes(&persisted, manager.config()).unwrap();
    assert_eq!(reloaded.state(), IndexState::Ready);
    assert_eq!(reloaded.len(), 12);
}

#[test]
fn test_changed_tree_parameters_force_rebuild() {
    init_logging();
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new("main"));
    let notifications = NotificationManager::new();
    let request = IndexRequest::for_store("Venue", "lat", "lon", store.as_ref());

    {
        let manager = IndexManager::new(
            request.clone(),
            store.clone(),
            notifications.clone(),
            Config::default().with_bucket_capacity(4),
        )
        .unwrap();
        manager.insert_objects(&grid(20)).unwrap();
        manager.flush().unwrap();
        assert!(manager.stats().internal_count > 0);
    }

    let manager = IndexManager::new(
        request,
        store,
        notifications,
        Config::default().with_bucket_capacity(50),
    )
    .unwrap();
    manager.flush().unwrap();
    assert_eq!(manager.len(), 20);
    assert_eq!(manager.stats().internal_count, 0);
}

#[test]
fn test_reset_data_and_index() {
    init_logging();
    let context = ContextBuilder::new().build().unwrap();
    let manager = context.manager_for("Venue", "lat", "lon").unwrap();
    manager.insert_objects(&grid(10)).unwrap();
    manager.flush().unwrap();

    // Records leave the store behind the index's back.
    for record in grid(10).iter().take(4) {
        context.store().delete(record.id()).unwrap();
    }
    manager.reset_data_and_index().unwrap();
    manager.flush().unwrap();

    assert_eq!(manager.len(), 6);
    assert_eq!(
        context.store().index_points_with_prefix(manager.id(), "").unwrap().len(),
        6
    );
}

/// A store whose writes can be made to fail on demand.
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> geoquad::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GeoquadError::Storage("disk full".to_string()));
        }
        Ok(())
    }
}

impl RecordStore for FlakyStore {
    fn identity(&self) -> &str {
        self.inner.identity()
    }
    fn get(&self, id: &RecordId) -> geoquad::Result<Option<Record>> {
        self.inner.get(id)
    }
    fn contains(&self, id: &RecordId) -> geoquad::Result<bool> {
        self.inner.contains(id)
    }
    fn put(&self, record: &Record) -> geoquad::Result<()> {
        self.check()?;
        self.inner.put(record)
    }
    fn delete(&self, id: &RecordId) -> geoquad::Result<bool> {
        self.inner.delete(id)
    }
    fn batch(&self, ops: &[StoreOp]) -> geoquad::Result<()> {
        self.check()?;
        self.inner.batch(ops)
    }
    fn records(&self, entity_class: &str) -> geoquad::Result<Vec<Record>> {
        self.inner.records(entity_class)
    }
    fn commit(&self) -> geoquad::Result<()> {
        self.inner.commit()
    }
    fn add_commit_hook(&self, hook: CommitHook) -> HookId {
        self.inner.add_commit_hook(hook)
    }
    fn remove_commit_hook(&self, id: HookId) {
        self.inner.remove_commit_hook(id)
    }
    fn save_index(&self, index_id: u64, blob: &[u8]) -> geoquad::Result<()> {
        self.inner.save_index(index_id, blob)
    }
    fn load_index(&self, index_id: u64) -> geoquad::Result<Option<Vec<u8>>> {
        self.inner.load_index(index_id)
    }
    fn delete_index(&self, index_id: u64) -> geoquad::Result<()> {
        self.inner.delete_index(index_id)
    }
    fn put_index_points(&self, index_id: u64, points: &[(String, DataSnapshot)]) -> geoquad::Result<()> {
        self.inner.put_index_points(index_id, points)
    }
    fn remove_index_points(&self, index_id: u64, ids: &[RecordId]) -> geoquad::Result<()> {
        self.inner.remove_index_points(index_id, ids)
    }
    fn index_points_with_prefix(&self, index_id: u64, prefix: &str) -> geoquad::Result<Vec<DataSnapshot>> {
        self.inner.index_points_with_prefix(index_id, prefix)
    }
    fn clear_index_points(&self, index_id: u64) -> geoquad::Result<()> {
        self.inner.clear_index_points(index_id)
    }
    fn stats(&self) -> geoquad::Result<StoreStats> {
        self.inner.stats()
    }
}

#[test]
fn test_failed_persist_leaves_index_untouched() {
    init_logging();
    let flaky = Arc::new(FlakyStore {
        inner: MemoryStore::new("flaky"),
        failing: AtomicBool::new(false),
    });
    let store: Arc<dyn RecordStore> = flaky.clone();
    let context = ContextBuilder::new().store(store.clone()).build().unwrap();
    let manager = context.manager_for("Venue", "lat", "lon").unwrap();

    manager.insert_objects(&grid(3)).unwrap();
    manager.flush().unwrap();
    assert_eq!(manager.len(), 3);

    flaky.failing.store(true, Ordering::SeqCst);
    let more = vec![venue(100, 1.0, 1.0), venue(101, 2.0, 2.0)];
    assert!(matches!(
        manager.insert_objects(&more),
        Err(GeoquadError::Storage(_))
    ));
    manager.flush().unwrap();
    assert_eq!(manager.len(), 3);
    assert!(!store.contains(more[0].id()).unwrap());

    // Retrying once the store recovers indexes everything.
    flaky.failing.store(false, Ordering::SeqCst);
    assert_eq!(manager.insert_objects(&more).unwrap(), 2);
    manager.flush().unwrap();
    assert_eq!(manager.len(), 5);
}

#[test]
fn test_snapshot_every_n_operations() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batched.snapshot");
    let store = MemoryStore::open(
        &path,
        SnapshotConfig {
            auto_snapshot_ops: Some(100),
        },
    )
    .unwrap();

    store.put(&venue(1, 0.0, 0.0)).unwrap();
    store.commit().unwrap();
    assert!(!path.exists());

    store.snapshot_now().unwrap();
    let reopened = MemoryStore::open(&path, SnapshotConfig::default()).unwrap();
    assert!(reopened.contains(&RecordId::new("Venue", 1)).unwrap());
}
