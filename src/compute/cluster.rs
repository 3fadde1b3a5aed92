//! Grid clustering of query results.
//!
//! Points are bucketed by floor-dividing their coordinates by a cell size.
//! Every non-empty bucket becomes one cluster positioned at the centroid of
//! its members. The result depends only on the input set and the cell size,
//! so repeated calls for the same viewport and zoom are stable.

use super::geometry::centroid;
use crate::error::{GeoquadError, Result};
use geo::Point;
use geoquad_types::point::DataSnapshot;
use std::collections::BTreeMap;

/// A group of nearby points rendered as one map marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Centroid of the members (`x = longitude`, `y = latitude`)
    pub coordinate: Point<f64>,
    /// Number of members
    pub count: usize,
    /// Member snapshots, ordered by record identity
    pub members: Vec<DataSnapshot>,
    /// Grid cell (column, row) the cluster was built from
    pub cell: (i64, i64),
    /// Display title, filled in by the index manager
    pub title: Option<String>,
    /// Display subtitle, filled in by the index manager
    pub subtitle: Option<String>,
}

impl Cluster {
    /// Whether the cluster stands for exactly one record.
    pub fn is_single(&self) -> bool {
        self.count == 1
    }

    /// Summary title for a multi-member cluster, e.g. `"12 places"`.
    pub fn count_summary(&self, plural_noun: &str) -> String {
        format!("{} {}", self.count, plural_noun)
    }

    /// Build the display title.
    ///
    /// A single-member cluster is titled by `name_of` its member, falling
    /// back to the member's primary key. Larger clusters get a count summary.
    pub fn title_with<F>(&self, plural_noun: &str, name_of: F) -> String
    where
        F: FnOnce(&DataSnapshot) -> Option<String>,
    {
        match self.members.as_slice() {
            [only] if self.is_single() => {
                name_of(only).unwrap_or_else(|| only.primary_key().to_string())
            }
            _ => self.count_summary(plural_noun),
        }
    }
}

/// Group `points` into grid clusters of edge `cell_size`.
///
/// Clusters come back ordered by grid row, then column.
///
/// # Errors
///
/// Returns `InvalidInput` if `cell_size` is not a finite positive number.
///
/// # Examples
///
/// ```rust
/// use geoquad::compute::cluster_points;
/// use geoquad::DataSnapshot;
///
/// let points = vec![
///     DataSnapshot::new("Venue", 1, 0.0, 0.0),
///     DataSnapshot::new("Venue", 2, 5.0, 5.0),
///     DataSnapshot::new("Venue", 3, 20.0, 20.0),
/// ];
/// let clusters = cluster_points(points, 10.0).unwrap();
/// assert_eq!(clusters.len(), 2);
/// assert_eq!(clusters[0].count, 2);
/// ```
pub fn cluster_points<I>(points: I, cell_size: f64) -> Result<Vec<Cluster>>
where
    I: IntoIterator<Item = DataSnapshot>,
{
    if !cell_size.is_finite() || cell_size <= 0.0 {
        return Err(GeoquadError::InvalidInput(format!(
            "cluster cell size must be positive, got {}",
            cell_size
        )));
    }

    let mut cells: BTreeMap<(i64, i64), Vec<DataSnapshot>> = BTreeMap::new();
    for point in points {
        let column = (point.x() / cell_size).floor() as i64;
        let row = (point.y() / cell_size).floor() as i64;
        cells.entry((row, column)).or_default().push(point);
    }

    let clusters = cells
        .into_iter()
        .filter_map(|((row, column), mut members)| {
            members.sort_by(|a, b| a.id().cmp(b.id()));
            let positions: Vec<Point<f64>> = members.iter().map(DataSnapshot::point).collect();
            let coordinate = centroid(positions.iter())?;
            Some(Cluster {
                coordinate,
                count: members.len(),
                members,
                cell: (column, row),
                title: None,
                subtitle: None,
            })
        })
        .collect();

    Ok(clusters)
}
