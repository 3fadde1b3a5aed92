//! Quadtree nodes stored in a flat arena.
//!
//! Nodes are addressed by path keys rather than owned pointers. The root is
//! `"q"`; a child appends its quadrant digit to the parent key:
//!
//! ```text
//! q
//! ├─ q0 (NW)
//! │  ├─ q00 q01 q02 q03
//! ├─ q1 (NE)
//! ├─ q2 (SW)
//! └─ q3 (SE)
//! ```
//!
//! The parent of any non-root node is its key minus the last character, so
//! the arena serializes as-is and needs no back pointers.

use crate::error::{GeoquadError, Result};
use geoquad_types::bbox::BoundingBox;
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::RecordId;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Key of the root node.
pub const ROOT_KEY: &str = "q";

/// One of the four children of an internal node.
///
/// The declaration order is the routing precedence: a point on a shared
/// edge goes to the first quadrant that contains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quadrant {
    NorthWest,
    NorthEast,
    SouthWest,
    SouthEast,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::NorthWest,
        Quadrant::NorthEast,
        Quadrant::SouthWest,
        Quadrant::SouthEast,
    ];

    /// Digit appended to the parent key.
    pub fn digit(self) -> char {
        match self {
            Quadrant::NorthWest => '0',
            Quadrant::NorthEast => '1',
            Quadrant::SouthWest => '2',
            Quadrant::SouthEast => '3',
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A node of the tree: a box plus either a point bucket or four children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuadTreeNode {
    pub key: String,
    pub bounding_box: BoundingBox,
    pub bucket_capacity: usize,
    pub depth: usize,
    points: Vec<DataSnapshot>,
    children: Option<[String; 4]>,
}

impl QuadTreeNode {
    fn leaf(key: String, bounding_box: BoundingBox, bucket_capacity: usize, depth: usize) -> Self {
        Self {
            bounding_box: bounding_box.renamed(key.as_str()),
            key,
            bucket_capacity,
            depth,
            points: Vec::new(),
            children: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.key == ROOT_KEY
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Points held directly by this node. Always empty for internal nodes.
    pub fn points(&self) -> &[DataSnapshot] {
        &self.points
    }

    /// Child keys in quadrant order, if the node has subdivided.
    pub fn children(&self) -> Option<&[String; 4]> {
        self.children.as_ref()
    }

    pub fn child(&self, quadrant: Quadrant) -> Option<&str> {
        self.children
            .as_ref()
            .map(|children| children[quadrant.index()].as_str())
    }

    /// Key of the parent node, or `None` for the root.
    pub fn parent_key(&self) -> Option<&str> {
        parent_key(&self.key)
    }

    fn position_of(&self, id: &RecordId) -> Option<usize> {
        self.points.iter().position(|p| p.id() == id)
    }
}

/// Quadrant of `bbox` a position belongs to.
///
/// Positions on the vertical split go west and positions on the horizontal
/// split go north, which matches testing the quadrants in declaration order.
fn quadrant_for(bbox: &BoundingBox, x: f64, y: f64) -> Quadrant {
    let west = x <= bbox.x + bbox.width / 2.0;
    let north = y >= bbox.y + bbox.height / 2.0;
    match (north, west) {
        (true, true) => Quadrant::NorthWest,
        (true, false) => Quadrant::NorthEast,
        (false, true) => Quadrant::SouthWest,
        (false, false) => Quadrant::SouthEast,
    }
}

fn parent_key(key: &str) -> Option<&str> {
    if key.len() <= ROOT_KEY.len() {
        None
    } else {
        Some(&key[..key.len() - 1])
    }
}

/// Shape summary of a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub node_count: usize,
    pub leaf_count: usize,
    pub internal_count: usize,
    /// Depth of the deepest node (root is 0)
    pub max_depth: usize,
    pub point_count: usize,
    /// Leaves holding more than the bucket capacity (only at maximum depth)
    pub oversized_leaves: usize,
}

/// A capacity-bounded point quadtree over a fixed world box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuadTree {
    nodes: FxHashMap<String, QuadTreeNode>,
    bucket_capacity: usize,
    max_depth: usize,
    point_count: usize,
}

impl QuadTree {
    /// Create a tree with a single empty leaf covering `world`.
    pub fn new(world: BoundingBox, bucket_capacity: usize, max_depth: usize) -> Self {
        let bucket_capacity = bucket_capacity.max(1);
        let mut nodes = FxHashMap::default();
        nodes.insert(
            ROOT_KEY.to_string(),
            QuadTreeNode::leaf(ROOT_KEY.to_string(), world, bucket_capacity, 0),
        );
        Self {
            nodes,
            bucket_capacity,
            max_depth,
            point_count: 0,
        }
    }

    pub fn root(&self) -> Option<&QuadTreeNode> {
        self.nodes.get(ROOT_KEY)
    }

    pub fn node(&self, key: &str) -> Option<&QuadTreeNode> {
        self.nodes.get(key)
    }

    /// Box covered by the root.
    pub fn world(&self) -> Option<&BoundingBox> {
        self.root().map(|root| &root.bounding_box)
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of points held by the tree.
    pub fn len(&self) -> usize {
        self.point_count
    }

    pub fn is_empty(&self) -> bool {
        self.point_count == 0
    }

    fn node_ref(&self, key: &str) -> Result<&QuadTreeNode> {
        self.nodes
            .get(key)
            .ok_or_else(|| GeoquadError::CapacityInvariantViolation(key.to_string()))
    }

    fn node_mut(&mut self, key: &str) -> Result<&mut QuadTreeNode> {
        self.nodes
            .get_mut(key)
            .ok_or_else(|| GeoquadError::CapacityInvariantViolation(key.to_string()))
    }

    /// Insert a point, subdividing full leaves on the way.
    ///
    /// A point already held under the same identity is replaced in place if
    /// it routes to the same leaf; callers moving a point should remove it
    /// first.
    ///
    /// # Errors
    ///
    /// `OutOfBounds` if the root box does not contain the point, and
    /// `CapacityInvariantViolation` if the arena is inconsistent.
    pub fn insert(&mut self, point: DataSnapshot) -> Result<()> {
        let root = self.node_ref(ROOT_KEY)?;
        if !root.bounding_box.contains_point(point.x(), point.y()) {
            return Err(GeoquadError::OutOfBounds {
                x: point.x(),
                y: point.y(),
            });
        }
        self.insert_from(ROOT_KEY.to_string(), point)
    }

    fn insert_from(&mut self, start: String, point: DataSnapshot) -> Result<()> {
        let mut key = start;
        loop {
            let node = self.node_ref(&key)?;

            if let Some(children) = &node.children {
                if !node.points.is_empty() {
                    return Err(GeoquadError::CapacityInvariantViolation(key));
                }
                let quadrant = quadrant_for(&node.bounding_box, point.x(), point.y());
                key = children[quadrant.index()].clone();
                continue;
            }

            let depth = node.depth;
            let len = node.points.len();
            let existing = node.position_of(point.id());
            let capacity = self.bucket_capacity;
            let max_depth = self.max_depth;
            let node = self.node_mut(&key)?;

            if let Some(i) = existing {
                node.points[i] = point;
                return Ok(());
            }

            if len < capacity {
                node.points.push(point);
                self.point_count += 1;
                return Ok(());
            }

            if depth >= max_depth {
                log::warn!(
                    "Leaf {} at maximum depth {} holds {} points (capacity {})",
                    key,
                    depth,
                    len + 1,
                    capacity
                );
                node.points.push(point);
                self.point_count += 1;
                return Ok(());
            }

            self.subdivide(&key)?;
        }
    }

    /// Turn a full leaf into an internal node with four empty leaves and
    /// redistribute its points among them.
    fn subdivide(&mut self, key: &str) -> Result<()> {
        let node = self.node_mut(key)?;
        if node.children.is_some() {
            return Err(GeoquadError::CapacityInvariantViolation(key.to_string()));
        }

        let quadrants = node.bounding_box.quadrants();
        let depth = node.depth + 1;
        let capacity = node.bucket_capacity;
        let moved = std::mem::take(&mut node.points);

        let child_keys: [String; 4] = Quadrant::ALL.map(|q| {
            let mut child = String::with_capacity(key.len() + 1);
            child.push_str(key);
            child.push(q.digit());
            child
        });
        node.children = Some(child_keys.clone());

        for (child_key, bbox) in child_keys.iter().zip(quadrants) {
            self.nodes.insert(
                child_key.clone(),
                QuadTreeNode::leaf(child_key.clone(), bbox, capacity, depth),
            );
        }

        self.point_count -= moved.len();
        for point in moved {
            self.insert_from(key.to_string(), point)?;
        }
        Ok(())
    }

    /// Key of the leaf a position routes to.
    pub fn leaf_for(&self, x: f64, y: f64) -> Option<&str> {
        let mut node = self.root()?;
        if !node.bounding_box.contains_point(x, y) {
            return None;
        }
        while let Some(children) = &node.children {
            let quadrant = quadrant_for(&node.bounding_box, x, y);
            node = self.nodes.get(&children[quadrant.index()])?;
        }
        Some(node.key.as_str())
    }

    /// Remove the point with `id` located at `(x, y)`.
    ///
    /// The coordinates steer the descent, so they must be the ones the point
    /// was inserted with. Returns whether a point was removed; nodes are
    /// never merged back.
    pub fn remove(&mut self, id: &RecordId, x: f64, y: f64) -> bool {
        let Some(key) = self.leaf_for(x, y).map(str::to_string) else {
            return false;
        };
        let Some(leaf) = self.nodes.get_mut(&key) else {
            return false;
        };
        match leaf.position_of(id) {
            Some(i) => {
                leaf.points.swap_remove(i);
                self.point_count -= 1;
                true
            }
            None => false,
        }
    }

    /// Visit every point inside `range`.
    ///
    /// Subtrees whose box misses `range` are skipped. Emission order is
    /// unspecified.
    pub fn query<F>(&self, range: &BoundingBox, mut visit: F)
    where
        F: FnMut(&DataSnapshot),
    {
        let mut stack: SmallVec<[&QuadTreeNode; 32]> = SmallVec::new();
        if let Some(root) = self.root() {
            stack.push(root);
        }

        while let Some(node) = stack.pop() {
            if !node.bounding_box.intersects(range) {
                continue;
            }
            match &node.children {
                Some(children) => {
                    stack.extend(children.iter().filter_map(|k| self.nodes.get(k)));
                }
                None => node
                    .points
                    .iter()
                    .filter(|p| range.contains_point(p.x(), p.y()))
                    .for_each(&mut visit),
            }
        }
    }

    /// Visit every node in pre-order: a node, then its children in quadrant
    /// order.
    pub fn traverse<'a, F>(&'a self, mut visit: F)
    where
        F: FnMut(&'a QuadTreeNode),
    {
        let mut stack: SmallVec<[&QuadTreeNode; 32]> = SmallVec::new();
        if let Some(root) = self.root() {
            stack.push(root);
        }

        while let Some(node) = stack.pop() {
            visit(node);
            if let Some(children) = &node.children {
                stack.extend(children.iter().rev().filter_map(|k| self.nodes.get(k)));
            }
        }
    }

    /// Walk from the node `start` up to the root. Stops as soon as `visit`
    /// returns `false`.
    pub fn reverse_traverse<F>(&self, start: &str, mut visit: F)
    where
        F: FnMut(&QuadTreeNode) -> bool,
    {
        let mut key = Some(start);
        while let Some(k) = key {
            let Some(node) = self.nodes.get(k) else {
                return;
            };
            if !visit(node) {
                return;
            }
            key = parent_key(k);
        }
    }

    /// Every point held by the tree.
    pub fn points(&self) -> Vec<DataSnapshot> {
        let mut out = Vec::with_capacity(self.point_count);
        self.traverse(|node| out.extend(node.points.iter().cloned()));
        out
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        self.traverse(|node| {
            stats.node_count += 1;
            stats.max_depth = stats.max_depth.max(node.depth);
            if node.is_leaf() {
                stats.leaf_count += 1;
                stats.point_count += node.points.len();
                if node.points.len() > node.bucket_capacity {
                    stats.oversized_leaves += 1;
                }
            } else {
                stats.internal_count += 1;
            }
        });
        stats
    }

    /// Check the structural invariants of every node.
    ///
    /// - internal nodes hold no points and four children that split their
    ///   box into exact quadrants
    /// - leaves hold at most `bucket_capacity` points unless at maximum depth
    /// - every point lies inside its leaf and every ancestor of that leaf
    /// - no identity appears twice
    pub fn validate(&self) -> Result<()> {
        let mut seen: FxHashSet<&RecordId> = FxHashSet::default();
        let mut reachable = 0usize;
        let mut failure: Option<String> = None;

        self.traverse(|node| {
            if failure.is_some() {
                return;
            }
            reachable += 1;

            match &node.children {
                Some(children) => {
                    let expected = node.bounding_box.quadrants();
                    let ok = node.points.is_empty()
                        && children.iter().zip(expected.iter()).all(|(k, q)| {
                            self.nodes.get(k).is_some_and(|child| {
                                child.depth == node.depth + 1
                                    && child.bounding_box.x == q.x
                                    && child.bounding_box.y == q.y
                                    && child.bounding_box.width == q.width
                                    && child.bounding_box.height == q.height
                            })
                        });
                    if !ok {
                        failure = Some(node.key.clone());
                    }
                }
                None => {
                    let over = node.points.len() > node.bucket_capacity && node.depth < self.max_depth;
                    if over {
                        failure = Some(node.key.clone());
                        return;
                    }
                    for point in &node.points {
                        if !seen.insert(point.id()) {
                            failure = Some(node.key.clone());
                            return;
                        }
                        let mut inside = true;
                        self.reverse_traverse(&node.key, |ancestor| {
                            inside = ancestor.bounding_box.contains_point(point.x(), point.y());
                            inside
                        });
                        if !inside {
                            failure = Some(node.key.clone());
                            return;
                        }
                    }
                }
            }
        });

        if let Some(key) = failure {
            return Err(GeoquadError::CapacityInvariantViolation(key));
        }
        if reachable != self.nodes.len() || seen.len() != self.point_count {
            return Err(GeoquadError::CapacityInvariantViolation(ROOT_KEY.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(id: i64, x: f64, y: f64) -> DataSnapshot {
        DataSnapshot::new("Venue", id, y, x)
    }

    fn unit_tree(capacity: usize) -> QuadTree {
        QuadTree::new(BoundingBox::new(0.0, 0.0, 100.0, 100.0), capacity, 16)
    }

    fn collect(tree: &QuadTree, range: &BoundingBox) -> Vec<DataSnapshot> {
        let mut out = Vec::new();
        tree.query(range, |p| out.push(p.clone()));
        out
    }

    #[test]
    fn test_leaf_fills_then_subdivides() {
        let mut tree = unit_tree(4);
        for i in 0..4 {
            tree.insert(pt(i, 10.0 + i as f64, 10.0)).unwrap();
        }
        assert!(tree.root().unwrap().is_leaf());
        assert_eq!(tree.node_count(), 1);

        tree.insert(pt(4, 90.0, 90.0)).unwrap();
        let root = tree.root().unwrap();
        assert!(!root.is_leaf());
        assert!(root.points().is_empty());
        assert_eq!(
            root.children().unwrap(),
            &["q0".to_string(), "q1".to_string(), "q2".to_string(), "q3".to_string()]
        );

        assert_eq!(tree.node("q2").unwrap().points().len(), 4);
        assert_eq!(tree.node("q1").unwrap().points().len(), 1);
        assert_eq!(tree.len(), 5);
        tree.validate().unwrap();
    }

    #[test]
    fn test_subdivision_cascades_when_points_cluster() {
        let mut tree = unit_tree(2);
        tree.insert(pt(1, 1.0, 1.0)).unwrap();
        tree.insert(pt(2, 2.0, 2.0)).unwrap();
        tree.insert(pt(3, 3.0, 3.0)).unwrap();

        let stats = tree.stats();
        assert!(stats.max_depth >= 2);
        assert_eq!(stats.point_count, 3);
        assert_eq!(stats.internal_count * 4 + 1, stats.node_count);
        tree.validate().unwrap();
    }

    #[test]
    fn test_boundary_precedence() {
        let mut tree = unit_tree(1);
        tree.insert(pt(1, 10.0, 10.0)).unwrap();
        // Exactly on both split lines: NW wins.
        tree.insert(pt(2, 50.0, 50.0)).unwrap();
        assert_eq!(tree.leaf_for(50.0, 50.0), Some("q0"));
        assert_eq!(tree.node("q0").unwrap().points()[0].primary_key().to_string(), "2");

        // On the vertical split line below the middle: SW beats SE.
        tree.insert(pt(3, 50.0, 20.0)).unwrap();
        assert!(tree.leaf_for(50.0, 20.0).unwrap().starts_with("q2"));
        tree.validate().unwrap();
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut tree = unit_tree(4);
        let err = tree.insert(pt(1, 101.0, 5.0)).unwrap_err();
        assert!(matches!(err, GeoquadError::OutOfBounds { .. }));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_coincident_points_stop_at_max_depth() {
        let mut tree = QuadTree::new(BoundingBox::new(0.0, 0.0, 100.0, 100.0), 2, 5);
        for i in 0..6 {
            tree.insert(pt(i, 33.0, 33.0)).unwrap();
        }
        let stats = tree.stats();
        assert_eq!(stats.max_depth, 5);
        assert_eq!(stats.oversized_leaves, 1);
        assert_eq!(collect(&tree, &BoundingBox::new(0.0, 0.0, 100.0, 100.0)).len(), 6);
        tree.validate().unwrap();
    }

    #[test]
    fn test_reinsert_same_identity_does_not_duplicate() {
        let mut tree = unit_tree(4);
        tree.insert(pt(1, 5.0, 5.0)).unwrap();
        tree.insert(pt(1, 5.0, 5.0)).unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent_and_never_merges() {
        let mut tree = unit_tree(2);
        for i in 0..5 {
            tree.insert(pt(i, 10.0 * i as f64 + 1.0, 10.0 * i as f64 + 1.0)).unwrap();
        }
        let nodes_before = tree.node_count();

        let id = RecordId::new("Venue", 3);
        assert!(tree.remove(&id, 31.0, 31.0));
        assert!(!tree.remove(&id, 31.0, 31.0));
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.node_count(), nodes_before);

        // Wrong coordinates miss the leaf.
        let id = RecordId::new("Venue", 4);
        assert!(!tree.remove(&id, 99.0, 1.0));
        tree.validate().unwrap();
    }

    #[test]
    fn test_query_filters_by_range() {
        let mut tree = unit_tree(3);
        for i in 0..10 {
            for j in 0..10 {
                tree.insert(pt(i * 10 + j, i as f64 * 10.0 + 5.0, j as f64 * 10.0 + 5.0))
                    .unwrap();
            }
        }

        let all = collect(&tree, &BoundingBox::new(0.0, 0.0, 100.0, 100.0));
        assert_eq!(all.len(), 100);

        let corner = collect(&tree, &BoundingBox::new(0.0, 0.0, 25.0, 25.0));
        assert_eq!(corner.len(), 4);
        assert!(corner.iter().all(|p| p.x() <= 25.0 && p.y() <= 25.0));

        // Touching the edge of a point counts.
        let edge = collect(&tree, &BoundingBox::new(15.0, 15.0, 0.0, 0.0));
        assert_eq!(edge.len(), 1);

        assert!(collect(&tree, &BoundingBox::new(200.0, 200.0, 1.0, 1.0)).is_empty());
    }

    #[test]
    fn test_traverse_is_pre_order() {
        let mut tree = unit_tree(1);
        tree.insert(pt(1, 10.0, 90.0)).unwrap();
        tree.insert(pt(2, 90.0, 10.0)).unwrap();

        let mut keys = Vec::new();
        tree.traverse(|node| keys.push(node.key.clone()));
        assert_eq!(keys, vec!["q", "q0", "q1", "q2", "q3"]);
    }

    #[test]
    fn test_reverse_traverse_stops_early() {
        let mut tree = unit_tree(1);
        for i in 0..4 {
            tree.insert(pt(i, 1.0 + i as f64, 1.0 + i as f64)).unwrap();
        }
        let leaf = tree.leaf_for(1.0, 1.0).unwrap().to_string();
        assert!(leaf.len() > 3);

        let mut path = Vec::new();
        tree.reverse_traverse(&leaf, |node| {
            path.push(node.key.clone());
            true
        });
        assert_eq!(path.last().map(String::as_str), Some(ROOT_KEY));
        assert_eq!(path.len(), leaf.len());

        let mut visited = 0;
        tree.reverse_traverse(&leaf, |_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_serde_round_trip_keeps_shape() {
        let mut tree = unit_tree(2);
        for i in 0..20 {
            tree.insert(pt(i, (i * 7 % 100) as f64, (i * 13 % 100) as f64)).unwrap();
        }
        let bytes = bincode::serialize(&tree).unwrap();
        let restored: QuadTree = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.stats(), tree.stats());
        restored.validate().unwrap();
    }
}
