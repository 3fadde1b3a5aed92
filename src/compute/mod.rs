//! Compute layer for the index.
//!
//! Everything here is a pure function over plain data:
//! - Geometry predicates on bounding boxes and points
//! - Geohash coverage of query regions
//! - Grid clustering of query results
//! - GeoJSON export of snapshots and clusters
//!
//! Nothing in this module touches the record store or the tree.

pub mod cluster;
pub mod geohash;
pub mod geojson;
pub mod geometry;

pub use cluster::{Cluster, cluster_points};
pub use geohash::{CoverageSet, coverage, encode_point};
pub use geometry::{contains, intersects, planar_distance};
