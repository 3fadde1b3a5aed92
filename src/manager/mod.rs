//! Index manager: one index bound to one entity of one store.
//!
//! The manager owns a writer thread that applies every mutation in order,
//! listens for committed changes when on-demand indexing is on, and answers
//! range, radius, nearest and cluster queries from any thread.

mod observer;
mod request;
mod worker;

pub use observer::{IndexObserver, ObserverToken};
pub use request::IndexRequest;

use crate::compute::cluster::{Cluster, cluster_points};
use crate::compute::geohash::coverage;
use crate::config::Config;
use crate::error::{GeoquadError, Result};
use crate::notify::{NotificationManager, SubscriptionToken};
use crate::quadtree::{IndexState, QuadTreeIndex, TreeStats};
use crate::snapshot::snapshot;
use crate::storage::{Record, RecordStore, StoreOp};
use crossbeam_channel::Sender;
use geo::Point;
use geoquad_types::bbox::BoundingBox;
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::RecordId;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use worker::{ChangeBatch, Op, Shared};

/// Facade over one persisted quadtree index.
///
/// # Examples
///
/// ```rust
/// use geoquad::prelude::*;
/// use std::sync::Arc;
///
/// let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new("places"));
/// let notifications = NotificationManager::new();
/// let request = IndexRequest::for_store("Cafe", "lat", "lon", store.as_ref());
/// let manager = IndexManager::new(request, store, notifications, Config::default())?;
///
/// let cafes: Vec<Record> = (0..3)
///     .map(|i| {
///         Record::new("Cafe", i)
///             .with_field("lat", 40.7 + f64::from(i) * 0.01)
///             .with_field("lon", -74.0)
///     })
///     .collect();
/// manager.insert_objects(&cafes)?;
/// manager.flush()?;
///
/// let hits = manager.query(&BoundingBox::new(-74.1, 40.6, 0.2, 0.2))?;
/// assert_eq!(hits.len(), 3);
/// # Ok::<(), geoquad::GeoquadError>(())
/// ```
pub struct IndexManager {
    shared: Arc<Shared>,
    ops: Sender<Op>,
    notifications: Arc<NotificationManager>,
    subscription: Mutex<Option<SubscriptionToken>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndexManager {
    /// Open the index addressed by `request`.
    ///
    /// A persisted index is reused when it was left settled and was built
    /// with the same tree parameters. Otherwise, including when a previous
    /// build was interrupted, a full rebuild from the store is queued and
    /// queries report [`GeoquadError::NotReady`] until it completes.
    pub fn new(
        request: IndexRequest,
        store: Arc<dyn RecordStore>,
        notifications: Arc<NotificationManager>,
        config: Config,
    ) -> Result<Self> {
        config.validate().map_err(GeoquadError::InvalidInput)?;
        let id = request.id();

        let restored = match store.load_index(id)? {
            Some(bytes) => match QuadTreeIndex::from_bytes(&bytes, &config) {
                Ok(index) if !index.state().is_settled() => {
                    log::warn!("{}; discarding the partial tree", GeoquadError::InterruptedIndex(id));
                    None
                }
                Ok(index) if index.id() != id || !index.matches_config(&config) => {
                    log::info!("Index {:#018x}: configuration changed, rebuilding", id);
                    None
                }
                Ok(index) => Some(index),
                Err(e) => {
                    log::warn!("Index {:#018x}: unreadable persisted state ({}), rebuilding", id, e);
                    None
                }
            },
            None => None,
        };

        let needs_build = restored.is_none();
        let index = restored.unwrap_or_else(|| QuadTreeIndex::new(id, &config));
        let status = if needs_build {
            IndexState::Indexing
        } else {
            index.state()
        };
        log::debug!("Opening index {:#018x} for {} ({})", id, request, status);

        let shared = Arc::new(Shared::new(request, config, store, index, status));
        let (ops, queue) = crossbeam_channel::unbounded();
        let handle = worker::spawn(shared.clone(), queue)?;

        let manager = Self {
            shared,
            ops,
            notifications,
            subscription: Mutex::new(None),
            worker: Mutex::new(Some(handle)),
        };
        if needs_build {
            manager.send(Op::Rebuild)?;
        }
        Ok(manager)
    }

    pub fn request(&self) -> &IndexRequest {
        &self.shared.request
    }

    /// Identifier of the managed index.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> IndexState {
        self.shared.state()
    }

    /// Block until the index is queryable or `timeout` elapses.
    ///
    /// Returns the state reached. An index with nothing in it is settled in
    /// [`IndexState::NoData`], which also ends the wait.
    pub fn wait_until_ready(&self, timeout: Duration) -> IndexState {
        self.shared.wait_settled(timeout)
    }

    /// Block until every operation submitted so far has been applied.
    pub fn flush(&self) -> Result<()> {
        let (ack, done) = crossbeam_channel::bounded(1);
        self.send(Op::Flush(ack))?;
        done.recv().map_err(|_| GeoquadError::ManagerClosed)
    }

    fn send(&self, op: Op) -> Result<()> {
        self.ops.send(op).map_err(|_| GeoquadError::ManagerClosed)
    }

    /// Register a progress observer. It stays registered while the token lives.
    pub fn add_observer(&self, observer: Arc<dyn IndexObserver>) -> ObserverToken {
        self.shared.observers.register(observer)
    }

    /// Follow committed changes to the indexed entity.
    ///
    /// Each broadcast is queued for the writer as one batch. Calling this
    /// while already listening does nothing.
    pub fn start_on_demand_indexing(&self) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }

        let ops = self.ops.clone();
        let request = self.shared.request.clone();
        let entity = request.entity_name.clone();
        let token = self.notifications.subscribe_entity(entity, move |changes| {
            let batch = ChangeBatch::from_change_set(changes, &request);
            if ops.send(Op::Apply(batch)).is_err() {
                log::warn!("Dropping changes to {}: index writer has stopped", request.entity_name);
            }
        });
        log::debug!("Index {:#018x}: on-demand indexing started", self.id());
        *subscription = Some(token);
    }

    /// Stop following committed changes. Queued batches still apply.
    pub fn stop_on_demand_indexing(&self) {
        if let Some(token) = self.subscription.lock().take() {
            token.unsubscribe();
            log::debug!("Index {:#018x}: on-demand indexing stopped", self.id());
        }
    }

    pub fn is_indexing_on_demand(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Persist `records` and queue them for indexing.
    ///
    /// Records of another entity are ignored. The records are written and
    /// committed before this returns; indexing happens afterwards on the
    /// writer thread. Returns the number of records accepted.
    ///
    /// # Errors
    ///
    /// A failed store write leaves the index untouched; the caller should
    /// retry the insert.
    pub fn insert_objects(&self, records: &[Record]) -> Result<usize> {
        let entity = self.shared.request.entity_name.as_str();
        let lat = self.shared.request.latitude_field.as_str();
        let lon = self.shared.request.longitude_field.as_str();

        let mut ops = Vec::with_capacity(records.len());
        let mut points = Vec::with_capacity(records.len());
        let mut unplaced = Vec::new();
        for record in records {
            if record.entity_class() != entity {
                log::debug!("Ignoring {}: index is for {}", record.id(), entity);
                continue;
            }
            match snapshot(record, lat, lon) {
                Some(point) => points.push(point),
                None => {
                    log::warn!("Not indexing {}: no usable {}/{} fields", record.id(), lat, lon);
                    unplaced.push(record.id().clone());
                }
            }
            ops.push(StoreOp::Put(record.clone()));
        }
        if ops.is_empty() {
            return Ok(0);
        }

        self.shared.store.batch(&ops)?;
        self.shared.store.commit()?;
        let accepted = ops.len();
        if !points.is_empty() {
            self.send(Op::Insert(points))?;
        }
        // A record that lost its coordinates must not stay at its old position.
        if !unplaced.is_empty() {
            self.send(Op::Remove(unplaced))?;
        }
        Ok(accepted)
    }

    pub fn insert_object(&self, record: &Record) -> Result<usize> {
        self.insert_objects(std::slice::from_ref(record))
    }

    /// Queue `records` for removal from the index. The store is not touched.
    ///
    /// Returns the number of records accepted.
    pub fn remove_objects(&self, records: &[Record]) -> Result<usize> {
        let entity = self.shared.request.entity_name.as_str();
        let ids: Vec<RecordId> = records
            .iter()
            .filter(|record| {
                let ours = record.entity_class() == entity;
                if !ours {
                    log::debug!("Ignoring {}: index is for {}", record.id(), entity);
                }
                ours
            })
            .map(|record| record.id().clone())
            .collect();
        let accepted = ids.len();
        if accepted > 0 {
            self.send(Op::Remove(ids))?;
        }
        Ok(accepted)
    }

    pub fn remove_object(&self, record: &Record) -> Result<usize> {
        self.remove_objects(std::slice::from_ref(record))
    }

    /// Queue a full rebuild from the store.
    pub fn reindex(&self) -> Result<()> {
        self.send(Op::Rebuild)
    }

    /// Forget every indexed point and the persisted index, then rebuild
    /// from the store.
    pub fn reset_data_and_index(&self) -> Result<()> {
        {
            let mut index = self.shared.index.write();
            index.reset();
            self.shared.store.clear_index_points(self.shared.id)?;
            self.shared.store.delete_index(self.shared.id)?;
        }
        log::info!("Index {:#018x}: reset", self.id());
        self.reindex()
    }

    fn read_ready(&self) -> Result<parking_lot::RwLockReadGuard<'_, QuadTreeIndex>> {
        let state = self.state();
        if !state.is_settled() {
            return Err(GeoquadError::NotReady(state));
        }
        let index = self.shared.index.read();
        if !index.state().is_settled() {
            return Err(GeoquadError::NotReady(index.state()));
        }
        Ok(index)
    }

    /// Keep the points whose records still exist.
    fn live(&self, candidates: Vec<DataSnapshot>) -> Result<Vec<DataSnapshot>> {
        let mut out = Vec::with_capacity(candidates.len());
        for point in candidates {
            if self.shared.store.contains(point.id())? {
                out.push(point);
            } else {
                log::debug!("Skipping stale {}", point.id());
            }
        }
        Ok(out)
    }

    /// Points inside `view`.
    ///
    /// Points whose record was deleted from the store are skipped.
    ///
    /// # Errors
    ///
    /// `NotReady` while the index is being built; store read failures.
    pub fn query(&self, view: &BoundingBox) -> Result<Vec<DataSnapshot>> {
        let candidates = self.read_ready()?.query_collect(view);
        self.live(candidates)
    }

    /// Call `visit` for each live point inside `view`, returning the count.
    pub fn query_each<F>(&self, view: &BoundingBox, mut visit: F) -> Result<usize>
    where
        F: FnMut(&DataSnapshot),
    {
        let points = self.query(view)?;
        for point in &points {
            visit(point);
        }
        Ok(points.len())
    }

    /// Points inside `view`, found through the store's geohash prefix table
    /// rather than the tree.
    pub fn query_by_coverage(&self, view: &BoundingBox) -> Result<Vec<DataSnapshot>> {
        drop(self.read_ready()?);
        let cells = coverage(view, self.shared.config.max_coverage_cells)?;
        log::debug!(
            "Coverage of {} uses {} cells (ratio {:.2})",
            view,
            cells.len(),
            cells.ratio
        );

        let mut seen = FxHashSet::default();
        let mut candidates = Vec::new();
        for hash in cells.hashes() {
            for point in self.shared.store.index_points_with_prefix(self.shared.id, hash)? {
                if view.contains_point(point.x(), point.y()) && seen.insert(point.id().clone()) {
                    candidates.push(point);
                }
            }
        }
        self.live(candidates)
    }

    /// Points within `radius` of `center`, nearest first.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a non-finite centre or a negative or non-finite
    /// radius; `NotReady` while the index is being built.
    pub fn query_radius(&self, center: &Point<f64>, radius: f64) -> Result<Vec<DataSnapshot>> {
        let candidates = self.read_ready()?.within_radius(center, radius)?;
        self.live(candidates)
    }

    /// The `n` live points nearest to `center`, nearest first.
    pub fn nearest(&self, center: &Point<f64>, n: usize) -> Result<Vec<DataSnapshot>> {
        let index = self.read_ready()?;
        // Stale points may be filtered out, so widen the search until enough
        // survive or the index is exhausted.
        let mut want = n;
        loop {
            let candidates = index.nearest(center, want)?;
            let exhausted = candidates.len() < want;
            let mut live = self.live(candidates)?;
            if live.len() >= n || exhausted {
                live.truncate(n);
                return Ok(live);
            }
            want = want.saturating_mul(2);
        }
    }

    /// Cluster the points inside `view` for display at `zoom`.
    pub fn cluster(&self, view: &BoundingBox, zoom: u8) -> Result<Vec<Cluster>> {
        let cell_size = self.shared.config.cluster.cell_size_for_zoom(zoom);
        self.cluster_with_cell_size(view, cell_size)
    }

    /// Cluster the points inside `view` on a grid of `cell_size`.
    pub fn cluster_with_cell_size(&self, view: &BoundingBox, cell_size: f64) -> Result<Vec<Cluster>> {
        let points = self.query(view)?;
        let mut clusters = cluster_points(points, cell_size)?;

        let settings = &self.shared.config.cluster;
        for cluster in &mut clusters {
            let member = match cluster.members.as_slice() {
                [only] => self.shared.store.get(only.id())?,
                _ => None,
            };
            let text_of = |field: &str| {
                member
                    .as_ref()
                    .and_then(|record| record.field(field))
                    .map(ToString::to_string)
            };
            cluster.title = Some(cluster.title_with(&settings.plural_noun, |_| {
                text_of(&settings.title_field)
            }));
            cluster.subtitle = settings
                .subtitle_field
                .as_deref()
                .and_then(|field| text_of(field));
        }
        Ok(clusters)
    }

    /// Look up the indexed point for `id`.
    pub fn get(&self, id: &RecordId) -> Result<Option<DataSnapshot>> {
        Ok(self.read_ready()?.get(id).cloned())
    }

    /// Number of indexed points, including stale ones.
    pub fn len(&self) -> usize {
        self.shared.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TreeStats {
        self.shared.index.read().stats()
    }

    /// Check the tree invariants.
    pub fn validate(&self) -> Result<()> {
        self.shared.index.read().validate()
    }

    /// Rebuild threshold check against the current index.
    pub fn needs_full_rebuild(&self, pending_deletes: usize) -> bool {
        self.shared.index.read().needs_full_rebuild(pending_deletes)
    }

    /// Run `f` with read access to the index.
    pub fn with_index<R>(&self, f: impl FnOnce(&QuadTreeIndex) -> R) -> R {
        f(&self.shared.index.read())
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        self.stop_on_demand_indexing();
        let _ = self.ops.send(Op::Shutdown);
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            log::error!("Index {:#018x}: writer thread panicked", self.shared.id);
        }
    }
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("request", &self.shared.request)
            .field("id", &format_args!("{:#018x}", self.shared.id))
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(config: Config) -> (Arc<dyn RecordStore>, Arc<NotificationManager>, IndexManager) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new("test"));
        let notifications = NotificationManager::new();
        notifications.attach(&store);
        let request = IndexRequest::for_store("Venue", "lat", "lon", store.as_ref());
        let manager =
            IndexManager::new(request, store.clone(), notifications.clone(), config).unwrap();
        manager.flush().unwrap();
        (store, notifications, manager)
    }

    fn venue(id: i64, lon: f64, lat: f64) -> Record {
        Record::new("Venue", id)
            .with_field("lat", lat)
            .with_field("lon", lon)
            .with_field("name", format!("Venue {}", id))
    }

    #[test]
    fn test_empty_store_settles_with_no_data() {
        let (_store, _n, manager) = setup(Config::default());
        assert_eq!(manager.state(), IndexState::NoData);
        assert!(manager.query(&BoundingBox::world()).unwrap().is_empty());
    }

    #[test]
    fn test_insert_ignores_other_entities() {
        let (store, _n, manager) = setup(Config::default());
        let records = vec![venue(1, 1.0, 1.0), Record::new("Park", 1).with_field("lat", 1.0)];
        assert_eq!(manager.insert_objects(&records).unwrap(), 1);
        manager.flush().unwrap();

        assert_eq!(manager.len(), 1);
        assert!(!store.contains(&RecordId::new("Park", 1)).unwrap());
    }

    #[test]
    fn test_stale_points_are_skipped() {
        let (store, _n, manager) = setup(Config::default());
        manager
            .insert_objects(&[venue(1, 1.0, 1.0), venue(2, 2.0, 2.0)])
            .unwrap();
        manager.flush().unwrap();

        store.delete(&RecordId::new("Venue", 1)).unwrap();
        let hits = manager.query(&BoundingBox::world()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_on_demand_indexing_follows_commits() {
        let (store, notifications, manager) = setup(Config::default());
        manager.start_on_demand_indexing();
        assert!(manager.is_indexing_on_demand());

        let record = venue(1, 10.0, 10.0);
        notifications.register_added(&record);
        store.put(&record).unwrap();
        store.commit().unwrap();
        manager.flush().unwrap();
        assert_eq!(manager.len(), 1);

        let moved = venue(1, -20.0, -20.0);
        notifications.register_changed(&moved);
        store.put(&moved).unwrap();
        store.commit().unwrap();
        manager.flush().unwrap();
        let point = manager.get(moved.id()).unwrap().unwrap();
        assert_eq!((point.x(), point.y()), (-20.0, -20.0));

        manager.stop_on_demand_indexing();
        notifications.register_deleted(&moved);
        store.delete(moved.id()).unwrap();
        store.commit().unwrap();
        manager.flush().unwrap();
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_coverage_query_matches_tree_query() {
        let (_store, _n, manager) = setup(Config::default());
        let records: Vec<Record> = (0..40)
            .map(|i| venue(i, -74.0 + (i % 8) as f64 * 0.01, 40.7 + (i / 8) as f64 * 0.01))
            .collect();
        manager.insert_objects(&records).unwrap();
        manager.flush().unwrap();

        let view = BoundingBox::new(-74.0, 40.7, 0.035, 0.025);
        let mut by_tree: Vec<RecordId> = manager
            .query(&view)
            .unwrap()
            .iter()
            .map(|p| p.id().clone())
            .collect();
        let mut by_cells: Vec<RecordId> = manager
            .query_by_coverage(&view)
            .unwrap()
            .iter()
            .map(|p| p.id().clone())
            .collect();
        by_tree.sort();
        by_cells.sort();
        assert!(!by_tree.is_empty());
        assert_eq!(by_tree, by_cells);
    }

    #[test]
    fn test_cluster_titles() {
        let config = Config::default().with_cluster(
            crate::config::ClusterConfig::with_steps(vec![crate::config::ZoomStep {
                min_zoom: 0,
                cell_size: 10.0,
            }])
            .with_plural_noun("venues")
            .with_subtitle_field("name"),
        );
        let (_store, _n, manager) = setup(config);
        manager
            .insert_objects(&[venue(1, 1.0, 1.0), venue(2, 5.0, 5.0), venue(3, 25.0, 25.0)])
            .unwrap();
        manager.flush().unwrap();

        let clusters = manager
            .cluster(&BoundingBox::new(0.0, 0.0, 30.0, 30.0), 3)
            .unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].title.as_deref(), Some("2 venues"));
        assert_eq!(clusters[0].subtitle, None);
        assert_eq!(clusters[1].title.as_deref(), Some("Venue 3"));
        assert_eq!(clusters[1].subtitle.as_deref(), Some("Venue 3"));
    }

    struct Counter {
        begun: AtomicUsize,
        ended: AtomicUsize,
    }

    impl IndexObserver for Counter {
        fn will_begin_indexing(&self, _state: IndexState) {
            self.begun.fetch_add(1, Ordering::SeqCst);
        }

        fn did_end_indexing(&self, state: IndexState) {
            assert!(state.is_settled());
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_observer_sees_begin_and_end() {
        let (_store, _n, manager) = setup(Config::default());
        let counter = Arc::new(Counter {
            begun: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
        });
        let token = manager.add_observer(counter.clone());

        manager.insert_objects(&[venue(1, 1.0, 1.0)]).unwrap();
        manager.reindex().unwrap();
        manager.flush().unwrap();
        assert_eq!(counter.begun.load(Ordering::SeqCst), 2);
        assert_eq!(counter.ended.load(Ordering::SeqCst), 2);

        drop(token);
        manager.reindex().unwrap();
        manager.flush().unwrap();
        assert_eq!(counter.ended.load(Ordering::SeqCst), 2);
    }
}
