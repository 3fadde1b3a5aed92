//! Single writer for one index.
//!
//! Every structural change to an index goes through one queue drained by one
//! thread, so mutations apply in submission order and never overlap. Readers
//! take the index's read lock and only see settled states.

use super::observer::IndexObserver;
use super::request::IndexRequest;
use crate::compute::geohash::encode_point;
use crate::config::Config;
use crate::error::{GeoquadError, Result};
use crate::notify::{EntityChangeSet, Registry};
use crate::quadtree::{IndexState, QuadTreeIndex};
use crate::snapshot::snapshot;
use crate::storage::RecordStore;
use crossbeam_channel::{Receiver, Sender};
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::RecordId;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Work queued for the writer thread.
pub(crate) enum Op {
    /// A committed change set, already projected onto points
    Apply(ChangeBatch),
    /// Records persisted by the caller, to be indexed
    Insert(Vec<DataSnapshot>),
    /// Identities to unindex
    Remove(Vec<RecordId>),
    /// Discard the tree and rebuild it from the store
    Rebuild,
    /// Acknowledge once everything queued before it has been applied
    Flush(Sender<()>),
    Shutdown,
}

/// Point-level view of one entity change set.
#[derive(Debug, Default)]
pub(crate) struct ChangeBatch {
    pub deleted: Vec<RecordId>,
    pub added: Vec<DataSnapshot>,
    pub changed: Vec<DataSnapshot>,
}

impl ChangeBatch {
    /// Project `changes` onto the coordinate fields of `request`.
    ///
    /// A changed record that lost its coordinates can no longer be placed
    /// and is unindexed instead.
    pub fn from_change_set(changes: &EntityChangeSet, request: &IndexRequest) -> Self {
        let lat = request.latitude_field.as_str();
        let lon = request.longitude_field.as_str();
        let mut batch = ChangeBatch {
            deleted: changes.deleted.iter().map(|r| r.id().clone()).collect(),
            ..Default::default()
        };

        for record in &changes.added {
            match record.to_point(lat, lon) {
                Some(point) => batch.added.push(point),
                None => log::warn!("Not indexing {}: no usable {}/{} fields", record.id(), lat, lon),
            }
        }
        for record in &changes.changed {
            match record.to_point(lat, lon) {
                Some(point) => batch.changed.push(point),
                None => batch.deleted.push(record.id().clone()),
            }
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }
}

/// State shared between an index manager and its writer thread.
pub(crate) struct Shared {
    pub request: IndexRequest,
    pub id: u64,
    pub config: Config,
    pub store: Arc<dyn RecordStore>,
    pub index: RwLock<QuadTreeIndex>,
    pub observers: Registry<dyn IndexObserver>,
    status: Mutex<IndexState>,
    status_changed: Condvar,
}

impl Shared {
    pub fn new(
        request: IndexRequest,
        config: Config,
        store: Arc<dyn RecordStore>,
        index: QuadTreeIndex,
        status: IndexState,
    ) -> Self {
        Self {
            id: request.id(),
            request,
            config,
            store,
            index: RwLock::new(index),
            observers: Registry::new(),
            status: Mutex::new(status),
            status_changed: Condvar::new(),
        }
    }

    /// Current state, without waiting for the writer.
    pub fn state(&self) -> IndexState {
        *self.status.lock()
    }

    /// Block until the state is settled or `timeout` elapses.
    pub fn wait_settled(&self, timeout: Duration) -> IndexState {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while !status.is_settled() {
            if self
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        *status
    }

    fn publish(&self, state: IndexState) {
        *self.status.lock() = state;
        self.status_changed.notify_all();
    }

    fn persist(&self, index: &QuadTreeIndex) -> Result<()> {
        self.store.save_index(self.id, &index.to_bytes()?)?;
        self.store.sync_indexes()
    }

    /// Pair each point with its geohash for the store's prefix table.
    fn hashed<'a, I>(&self, points: I) -> Vec<(String, DataSnapshot)>
    where
        I: IntoIterator<Item = &'a DataSnapshot>,
    {
        points
            .into_iter()
            .filter_map(|point| match encode_point(&point.point(), self.config.geohash_precision) {
                Ok(hash) => Some((hash, point.clone())),
                Err(e) => {
                    log::debug!("{} has no geohash: {}", point.id(), e);
                    None
                }
            })
            .collect()
    }

    fn indexable(&self, point: &DataSnapshot) -> bool {
        point.has_valid_coordinate() && self.config.world.contains_point(point.x(), point.y())
    }

    /// Enter `state`, recording it durably so an interruption is detected
    /// on the next activation.
    ///
    /// Observers are called once the index lock is released, so they may
    /// query the manager.
    fn begin(&self, state: IndexState) -> Result<Vec<Arc<dyn IndexObserver>>> {
        {
            let mut index = self.index.write();
            index.set_state(state);
            self.persist(&index)?;
        }
        self.publish(state);

        let observers = self.observers.live();
        for observer in &observers {
            observer.will_begin_indexing(state);
        }
        Ok(observers)
    }

    fn finish(&self, observers: &[Arc<dyn IndexObserver>]) -> Result<()> {
        let state = {
            let mut index = self.index.write();
            let state = if index.is_empty() {
                IndexState::NoData
            } else {
                IndexState::Ready
            };
            index.set_state(state);
            self.persist(&index)?;
            state
        };
        self.publish(state);

        for observer in observers {
            observer.did_end_indexing(state);
        }
        Ok(())
    }

    /// Build a fresh index from `points` and swap it in, replacing the
    /// stored point table.
    ///
    /// Only the writer mutates the index, so the build runs without the
    /// lock. Readers keep seeing the old index in its `Indexing` state.
    fn build(&self, points: Vec<DataSnapshot>, observers: &[Arc<dyn IndexObserver>]) -> Result<usize> {
        let mut fresh = QuadTreeIndex::new(self.id, &self.config);
        let count = fresh.full_build(points, |percent| {
            for observer in observers {
                observer.percent_indexed(percent, IndexState::Indexing);
            }
        })?;
        fresh.set_state(IndexState::Indexing);

        self.store.clear_index_points(self.id)?;
        let table = self.hashed(fresh.points());
        self.store.put_index_points(self.id, &table)?;
        *self.index.write() = fresh;
        Ok(count)
    }

    /// Rebuild from every record of the indexed entity in the store.
    pub fn rebuild_from_store(&self) -> Result<usize> {
        let observers = self.begin(IndexState::Indexing)?;

        let lat = self.request.latitude_field.as_str();
        let lon = self.request.longitude_field.as_str();
        let records = self.store.records(&self.request.entity_name)?;
        let mut points = Vec::with_capacity(records.len());
        for record in &records {
            match snapshot(record, lat, lon) {
                Some(point) => points.push(point),
                None => log::warn!("Not indexing {}: no usable {}/{} fields", record.id(), lat, lon),
            }
        }

        let count = self.build(points, &observers)?;
        self.finish(&observers)?;
        Ok(count)
    }

    /// Apply one change batch: deletions first, then additions, then moves.
    ///
    /// When the deletions would push the index past its rebuild threshold
    /// the surviving points are rebuilt into a fresh tree instead.
    pub fn apply(&self, batch: ChangeBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.added.is_empty() && batch.changed.is_empty() {
            let index = self.index.read();
            if !batch.deleted.iter().any(|id| index.contains(id)) {
                return Ok(());
            }
        }
        let observers = self.begin(IndexState::Indexing)?;

        let survivors = {
            let index = self.index.read();
            let pending_deletes = batch.deleted.iter().filter(|id| index.contains(id)).count();
            if index.needs_full_rebuild(pending_deletes) {
                log::info!(
                    "Index {:#018x}: {} deletions exceed the rebuild threshold, rebuilding",
                    self.id,
                    index.deleted_since_build() + pending_deletes
                );
                let deleted: FxHashSet<&RecordId> = batch.deleted.iter().collect();
                let survivors: FxHashMap<RecordId, DataSnapshot> = index
                    .points()
                    .filter(|p| !deleted.contains(p.id()))
                    .map(|p| (p.id().clone(), p.clone()))
                    .collect();
                Some(survivors)
            } else {
                None
            }
        };

        if let Some(mut survivors) = survivors {
            for point in batch.added.into_iter().chain(batch.changed) {
                survivors.insert(point.id().clone(), point);
            }
            self.build(survivors.into_values().collect(), &observers)?;
        } else {
            let mut index = self.index.write();
            let mut removed: Vec<RecordId> = batch
                .deleted
                .into_iter()
                .filter(|id| index.remove(id))
                .collect();
            let deleted = removed.len();

            // A move to an unusable position unindexes the record.
            let mut placed = Vec::new();
            for point in batch.added.into_iter().chain(batch.changed) {
                let was_indexed = index.contains(point.id());
                if index.insert_and_index(point.clone())? {
                    placed.push(point);
                } else if was_indexed && !index.contains(point.id()) {
                    removed.push(point.id().clone());
                }
            }
            self.store.remove_index_points(self.id, &removed)?;
            let table = self.hashed(&placed);
            self.store.put_index_points(self.id, &table)?;
            log::debug!(
                "Index {:#018x}: removed {}, unplaced {}, placed {}",
                self.id,
                deleted,
                removed.len() - deleted,
                placed.len()
            );
        }

        self.finish(&observers)
    }

    /// Index points whose records the caller already persisted.
    ///
    /// An indexed record re-inserted at an unusable position is unindexed.
    pub fn insert(&self, points: Vec<DataSnapshot>) -> Result<()> {
        let has_work = {
            let index = self.index.read();
            points
                .iter()
                .any(|p| self.indexable(p) || index.contains(p.id()))
        };
        if !has_work {
            return Ok(());
        }
        let observers = self.begin(IndexState::PreparingData)?;

        {
            let mut index = self.index.write();
            let (placeable, unplaceable): (Vec<DataSnapshot>, Vec<DataSnapshot>) =
                points.into_iter().partition(|p| self.indexable(p));

            let evicted: Vec<RecordId> = unplaceable
                .iter()
                .filter(|p| index.remove(p.id()))
                .map(|p| p.id().clone())
                .collect();
            self.store.remove_index_points(self.id, &evicted)?;
            let table = self.hashed(&placeable);
            self.store.put_index_points(self.id, &table)?;

            index.set_state(IndexState::Indexing);
            self.publish(IndexState::Indexing);
            for point in placeable {
                index.insert_and_index(point)?;
            }
        }

        self.finish(&observers)
    }

    /// Bring the index back to a trustworthy state after a failed operation.
    fn recover(&self, error: &GeoquadError) {
        log::error!("Index {:#018x}: {}; rebuilding from store", self.id, error);
        if let Err(e) = self.rebuild_from_store() {
            log::error!("Index {:#018x}: rebuild failed: {}", self.id, e);
        }
    }
}

/// Start the writer thread for `shared`.
pub(crate) fn spawn(shared: Arc<Shared>, ops: Receiver<Op>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("geoquad-index-{:x}", shared.id))
        .spawn(move || run(&shared, ops))
}

fn run(shared: &Shared, ops: Receiver<Op>) {
    for op in ops.iter() {
        let result = match op {
            Op::Apply(batch) => shared.apply(batch),
            Op::Insert(points) => shared.insert(points),
            Op::Remove(ids) => shared.apply(ChangeBatch {
                deleted: ids,
                ..Default::default()
            }),
            Op::Rebuild => shared.rebuild_from_store().map(|_| ()),
            Op::Flush(ack) => {
                let _ = ack.send(());
                Ok(())
            }
            Op::Shutdown => break,
        };
        if let Err(e) = result {
            shared.recover(&e);
        }
    }
    log::debug!("Index {:#018x}: writer stopped", shared.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SafeRecord;
    use crate::storage::Record;

    #[test]
    fn test_change_batch_projection() {
        let request = IndexRequest::new("Venue", "lat", "lon", "test");
        let placed = Record::new("Venue", 1)
            .with_field("lat", 1.0)
            .with_field("lon", 2.0);
        let unplaced = Record::new("Venue", 2).with_field("name", "Nowhere");

        let mut changes = EntityChangeSet::new("Venue");
        changes.added.push(SafeRecord::from(&placed));
        changes.added.push(SafeRecord::from(&unplaced));
        changes.changed.push(SafeRecord::from(&unplaced));
        changes.deleted.push(SafeRecord::from(&Record::new("Venue", 3)));

        let batch = ChangeBatch::from_change_set(&changes, &request);
        assert_eq!(batch.added.len(), 1);
        assert_eq!(batch.added[0].longitude, 2.0);
        assert!(batch.changed.is_empty());
        assert_eq!(
            batch.deleted,
            vec![RecordId::new("Venue", 3), RecordId::new("Venue", 2)]
        );
    }
}
