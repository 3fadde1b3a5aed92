//! Index-wide bookkeeping around a [`QuadTree`].

use super::node::{QuadTree, TreeStats};
use crate::compute::geometry::{circle_bounds, planar_distance};
use crate::config::Config;
use crate::error::{GeoquadError, Result};
use geo::Point;
use geoquad_types::bbox::BoundingBox;
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::RecordId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

const PERSISTED_VERSION: u8 = 1;

/// Lifecycle of an index.
///
/// ```text
/// NoData ──build──▶ Indexing ──done──▶ Ready
///                      ▲                 │
///                      └──mutation batch─┘
/// ```
///
/// `PreparingData` is the part of `Indexing` during which new records are
/// being persisted before they enter the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexState {
    Ready,
    Indexing,
    PreparingData,
    NoData,
}

impl IndexState {
    /// Whether queries may run against the tree.
    pub fn is_queryable(self) -> bool {
        self == IndexState::Ready
    }

    /// Whether the state is a safe resting point. Any other state found on
    /// load means the last build never finished.
    pub fn is_settled(self) -> bool {
        matches!(self, IndexState::Ready | IndexState::NoData)
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexState::Ready => "ready",
            IndexState::Indexing => "indexing",
            IndexState::PreparingData => "preparing data",
            IndexState::NoData => "no data",
        };
        f.write_str(name)
    }
}

/// Serialized form of an index. Membership is rebuilt from the tree.
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version: u8,
    id: u64,
    state: IndexState,
    total_initial_points: usize,
    deleted_since_build: usize,
    tree: QuadTree,
}

/// A quadtree plus the registry of everything it holds.
///
/// `all_points` is authoritative: a point is indexed exactly when its
/// identity is a key there, and the stored snapshot carries the coordinates
/// it was placed with.
#[derive(Debug, Clone)]
pub struct QuadTreeIndex {
    id: u64,
    tree: QuadTree,
    state: IndexState,
    total_initial_points: usize,
    deleted_since_build: usize,
    all_points: FxHashMap<RecordId, DataSnapshot>,
    rebuild_threshold: f64,
    world: BoundingBox,
}

impl QuadTreeIndex {
    /// Create an empty index in the `NoData` state.
    pub fn new(id: u64, config: &Config) -> Self {
        Self {
            id,
            tree: QuadTree::new(config.world.clone(), config.bucket_capacity, config.max_depth),
            state: IndexState::NoData,
            total_initial_points: 0,
            deleted_since_build: 0,
            all_points: FxHashMap::default(),
            rebuild_threshold: config.rebuild_threshold,
            world: config.world.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn set_state(&mut self, state: IndexState) {
        if self.state != state {
            log::debug!("Index {:#018x}: {} -> {}", self.id, self.state, state);
        }
        self.state = state;
    }

    pub fn tree(&self) -> &QuadTree {
        &self.tree
    }

    pub fn total_initial_points(&self) -> usize {
        self.total_initial_points
    }

    pub fn deleted_since_build(&self) -> usize {
        self.deleted_since_build
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.all_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all_points.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.all_points.contains_key(id)
    }

    /// The indexed snapshot for `id`, with the coordinates it was placed at.
    pub fn get(&self, id: &RecordId) -> Option<&DataSnapshot> {
        self.all_points.get(id)
    }

    /// Every indexed snapshot, in no particular order.
    pub fn points(&self) -> impl Iterator<Item = &DataSnapshot> {
        self.all_points.values()
    }

    /// Replace the whole tree with one built from `snapshots`.
    ///
    /// `progress` receives the percentage complete, once per whole percent.
    /// Points outside the world box are skipped with a warning. Returns the
    /// number of points indexed.
    pub fn full_build<I, F>(&mut self, snapshots: I, mut progress: F) -> Result<usize>
    where
        I: IntoIterator<Item = DataSnapshot>,
        F: FnMut(f64),
    {
        self.set_state(IndexState::Indexing);
        self.tree = QuadTree::new(
            self.world.clone(),
            self.tree.bucket_capacity(),
            self.tree.max_depth(),
        );
        self.all_points.clear();
        self.deleted_since_build = 0;

        let snapshots: Vec<DataSnapshot> = snapshots.into_iter().collect();
        let total = snapshots.len();
        let mut last_percent = 0u32;
        log::info!("Index {:#018x}: building from {} points", self.id, total);

        for (i, snapshot) in snapshots.into_iter().enumerate() {
            self.insert_and_index(snapshot)?;

            let percent = ((i + 1) * 100 / total.max(1)) as u32;
            if percent > last_percent {
                last_percent = percent;
                progress(f64::from(percent));
            }
        }

        self.total_initial_points = self.all_points.len();
        self.set_state(if self.all_points.is_empty() {
            IndexState::NoData
        } else {
            IndexState::Ready
        });
        log::info!(
            "Index {:#018x}: built with {} points in {} nodes",
            self.id,
            self.total_initial_points,
            self.tree.node_count()
        );
        Ok(self.total_initial_points)
    }

    /// Add one point to the registry and the tree.
    ///
    /// Re-inserting an identity at a new position moves it. Returns `false`
    /// when the point was not placed: the identical point was already
    /// indexed, or the point is unusable (non-finite or outside the world
    /// box), which is logged. An indexed identity whose new position is
    /// unusable is unindexed.
    ///
    /// # Errors
    ///
    /// Only structural corruption of the tree is reported as an error.
    pub fn insert_and_index(&mut self, snapshot: DataSnapshot) -> Result<bool> {
        if !self.placeable(&snapshot) {
            if self.remove(snapshot.id()) {
                log::debug!("Index {:#018x}: unindexed {} at its old position", self.id, snapshot.id());
            }
            return Ok(false);
        }

        if let Some(existing) = self.all_points.get(snapshot.id()) {
            if existing.same_position(&snapshot) {
                return Ok(false);
            }
            let existing = existing.clone();
            self.tree.remove(existing.id(), existing.x(), existing.y());
        }

        match self.tree.insert(snapshot.clone()) {
            Ok(()) => {
                self.all_points.insert(snapshot.id().clone(), snapshot);
                Ok(true)
            }
            Err(GeoquadError::OutOfBounds { x, y }) => {
                log::warn!("Dropped {} at ({}, {}): outside index bounds", snapshot.id(), x, y);
                self.all_points.remove(snapshot.id());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn placeable(&self, snapshot: &DataSnapshot) -> bool {
        if !snapshot.has_valid_coordinate() {
            log::warn!("Skipping {} with non-finite coordinates", snapshot.id());
            return false;
        }
        if !self.world.contains_point(snapshot.x(), snapshot.y()) {
            log::warn!(
                "Skipping {} at ({}, {}): outside index bounds {}",
                snapshot.id(),
                snapshot.x(),
                snapshot.y(),
                self.world
            );
            return false;
        }
        true
    }

    /// Remove a point by identity. Missing identities are ignored.
    ///
    /// The registry's copy supplies the coordinates, so a stale snapshot of
    /// the record is enough to find it.
    pub fn remove(&mut self, id: &RecordId) -> bool {
        let Some(existing) = self.all_points.remove(id) else {
            return false;
        };
        if !self.tree.remove(existing.id(), existing.x(), existing.y()) {
            log::warn!("Index {:#018x}: {} was registered but not in the tree", self.id, id);
        }
        self.deleted_since_build += 1;
        true
    }

    /// Whether deleting `pending_deletes` more points would push the share of
    /// points deleted since the last full build over the rebuild threshold.
    ///
    /// An index built from nothing needs a rebuild as soon as anything is
    /// deleted from it.
    pub fn needs_full_rebuild(&self, pending_deletes: usize) -> bool {
        let deleted = self.deleted_since_build + pending_deletes;
        if self.total_initial_points == 0 {
            return deleted > 0;
        }
        deleted as f64 / self.total_initial_points as f64 > self.rebuild_threshold
    }

    /// Drop every point and return to `NoData`.
    pub fn reset(&mut self) {
        self.tree = QuadTree::new(
            self.world.clone(),
            self.tree.bucket_capacity(),
            self.tree.max_depth(),
        );
        self.all_points.clear();
        self.total_initial_points = 0;
        self.deleted_since_build = 0;
        self.set_state(IndexState::NoData);
    }

    /// Visit every indexed point inside `range`.
    pub fn query<F>(&self, range: &BoundingBox, visit: F)
    where
        F: FnMut(&DataSnapshot),
    {
        self.tree.query(range, visit);
    }

    /// Points inside `range`, collected.
    pub fn query_collect(&self, range: &BoundingBox) -> Vec<DataSnapshot> {
        let mut out = Vec::new();
        self.tree.query(range, |p| out.push(p.clone()));
        out
    }

    /// Points within `radius` of `center`, nearest first, with
    /// `transient_distance` set.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a non-finite centre or a negative or non-finite
    /// radius.
    pub fn within_radius(&self, center: &Point<f64>, radius: f64) -> Result<Vec<DataSnapshot>> {
        check_center(center)?;
        if !radius.is_finite() || radius < 0.0 {
            return Err(GeoquadError::InvalidInput(format!("invalid radius {}", radius)));
        }

        let mut out = Vec::new();
        self.tree.query(&circle_bounds(center, radius), |p| {
            let distance = planar_distance(center, &p.point());
            if distance <= radius {
                let mut hit = p.clone();
                hit.transient_distance = distance;
                out.push(hit);
            }
        });
        out.sort_by(|a, b| a.transient_distance.total_cmp(&b.transient_distance));
        Ok(out)
    }

    /// The `n` points closest to `center`, nearest first.
    ///
    /// The search radius doubles until it holds `n` points or spans the
    /// whole world box.
    pub fn nearest(&self, center: &Point<f64>, n: usize) -> Result<Vec<DataSnapshot>> {
        check_center(center)?;
        if n == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let span = self.world.width.max(self.world.height);
        let reach = span * 2.0;
        let mut radius = (span / 1024.0).max(f64::MIN_POSITIVE);
        loop {
            let mut hits = self.within_radius(center, radius)?;
            if hits.len() >= n || radius >= reach {
                hits.truncate(n);
                return Ok(hits);
            }
            radius *= 2.0;
        }
    }

    /// Shape summary of the tree.
    pub fn stats(&self) -> TreeStats {
        self.tree.stats()
    }

    /// Check the tree invariants and that tree and registry agree.
    pub fn validate(&self) -> Result<()> {
        self.tree.validate()?;
        if self.tree.len() != self.all_points.len() {
            return Err(GeoquadError::Other(format!(
                "index {:#018x}: tree holds {} points, registry {}",
                self.id,
                self.tree.len(),
                self.all_points.len()
            )));
        }
        for point in self.tree.points() {
            match self.all_points.get(point.id()) {
                Some(registered) if registered.same_position(&point) => {}
                _ => {
                    return Err(GeoquadError::Other(format!(
                        "index {:#018x}: {} is in the tree but not registered",
                        self.id,
                        point.id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether this index was built with the same tree shape parameters.
    pub fn matches_config(&self, config: &Config) -> bool {
        self.tree.bucket_capacity() == config.bucket_capacity.max(1)
            && self.tree.max_depth() == config.max_depth
            && self.world == config.world
    }

    /// Serialize the index for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let persisted = PersistedIndex {
            version: PERSISTED_VERSION,
            id: self.id,
            state: self.state,
            total_initial_points: self.total_initial_points,
            deleted_since_build: self.deleted_since_build,
            tree: self.tree.clone(),
        };
        bincode::serialize(&persisted).map_err(|e| {
            GeoquadError::SerializationErrorWithContext(format!(
                "Failed to serialize index {:#018x}: {}",
                self.id, e
            ))
        })
    }

    /// Restore an index saved with [`to_bytes`](Self::to_bytes).
    ///
    /// The state is restored as saved; callers decide what to do with an
    /// index that was not settled when it was written.
    pub fn from_bytes(bytes: &[u8], config: &Config) -> Result<Self> {
        let persisted: PersistedIndex = bincode::deserialize(bytes)?;
        if persisted.version != PERSISTED_VERSION {
            return Err(GeoquadError::InvalidFormat);
        }

        let world = persisted
            .tree
            .world()
            .cloned()
            .ok_or(GeoquadError::InvalidFormat)?
            .renamed(config.world.key.as_str());

        let mut all_points = FxHashMap::default();
        for point in persisted.tree.points() {
            all_points.insert(point.id().clone(), point);
        }

        Ok(Self {
            id: persisted.id,
            tree: persisted.tree,
            state: persisted.state,
            total_initial_points: persisted.total_initial_points,
            deleted_since_build: persisted.deleted_since_build,
            all_points,
            rebuild_threshold: config.rebuild_threshold,
            world,
        })
    }
}

fn check_center(center: &Point<f64>) -> Result<()> {
    if center.x().is_finite() && center.y().is_finite() {
        Ok(())
    } else {
        Err(GeoquadError::InvalidInput(format!(
            "invalid centre ({}, {})",
            center.x(),
            center.y()
        )))
    }
}
