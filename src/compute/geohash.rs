//! Geohash coverage of rectangular regions.
//!
//! A coverage set is a small collection of geohash prefixes whose cells
//! together cover a query box. Points persisted with a full-length geohash
//! can then be narrowed with plain prefix scans before the exact box test.
//!
//! The search starts from the empty prefix, which stands for the whole
//! world, and refines one level at a time:
//!
//! ```text
//! ""                       1 cell, partial
//! ├─ "d" "f"               2 cells, both partial
//! │  ├─ "dr" "dq"  ...     refine while the budget allows
//! ```
//!
//! Cells that lie entirely inside the box are final. Cells that straddle its
//! border are refined only if the total number of cells stays within budget;
//! otherwise the coarser cell stays in the set.

use crate::config::MAX_GEOHASH_LENGTH;
use crate::error::{GeoquadError, Result};
use geo::{Coord, Point};
use geoquad_types::bbox::BoundingBox;
use std::collections::BTreeSet;

/// Geohash alphabet in lexicographic order.
const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// A bounded set of geohash prefixes covering a region.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageSet {
    hashes: BTreeSet<String>,
    /// Total cell area divided by the area of the covered box
    pub ratio: f64,
}

impl CoverageSet {
    pub fn new(hashes: BTreeSet<String>, ratio: f64) -> Self {
        Self { hashes, ratio }
    }

    /// Prefixes in lexicographic order.
    pub fn hashes(&self) -> &BTreeSet<String> {
        &self.hashes
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Whether some prefix in the set is a prefix of `hash`.
    pub fn covers_hash(&self, hash: &str) -> bool {
        self.hashes.iter().any(|prefix| hash.starts_with(prefix.as_str()))
    }
}

/// Encode a point (`x = longitude`, `y = latitude`) as a geohash.
pub fn encode_point(point: &Point<f64>, precision: usize) -> Result<String> {
    let precision = precision.clamp(1, MAX_GEOHASH_LENGTH);
    Ok(geohash::encode(
        Coord {
            x: point.x(),
            y: point.y(),
        },
        precision,
    )?)
}

/// Bounding box of a geohash cell. The empty hash is the whole world.
pub fn cell_bounds(hash: &str) -> Result<BoundingBox> {
    if hash.is_empty() {
        return Ok(BoundingBox::world());
    }
    let rect = geohash::decode_bbox(hash)?;
    Ok(BoundingBox::from_rect(rect).renamed(hash))
}

/// Compute a coverage set of at most `max_cells` prefixes for `bbox`.
///
/// The box is clipped to the longitude/latitude range first. A budget of
/// zero is treated as one cell. When no refinement fits the budget the
/// result is the single empty prefix.
///
/// # Errors
///
/// Returns `InvalidInput` if the box has non-finite coordinates or lies
/// entirely outside the longitude/latitude range.
///
/// # Examples
///
/// ```rust
/// use geoquad::compute::geohash::coverage;
/// use geoquad::BoundingBox;
///
/// let manhattan = BoundingBox::new(-74.02, 40.70, 0.06, 0.10);
/// let set = coverage(&manhattan, 8).unwrap();
/// assert!(set.len() <= 8);
/// assert!(set.ratio >= 1.0);
/// ```
pub fn coverage(bbox: &BoundingBox, max_cells: usize) -> Result<CoverageSet> {
    if ![bbox.x, bbox.y, bbox.width, bbox.height]
        .iter()
        .all(|v| v.is_finite())
    {
        return Err(GeoquadError::InvalidInput(format!(
            "cannot cover non-finite box {}",
            bbox
        )));
    }

    let target = BoundingBox::world().intersection(bbox).ok_or_else(|| {
        GeoquadError::InvalidInput(format!("{} lies outside the geohash range", bbox))
    })?;
    let max_cells = max_cells.max(1);

    let mut cells: BTreeSet<String> = BTreeSet::new();
    cells.insert(String::new());

    loop {
        let mut refined = false;
        let frontier: Vec<String> = cells.iter().cloned().collect();

        for hash in frontier {
            if hash.len() >= MAX_GEOHASH_LENGTH {
                continue;
            }
            let bounds = cell_bounds(&hash)?;
            if target.contains_box(&bounds) {
                continue;
            }

            let children = overlapping_children(&hash, &target)?;
            if children.is_empty() || cells.len() - 1 + children.len() > max_cells {
                continue;
            }

            cells.remove(&hash);
            cells.extend(children);
            refined = true;
        }

        if !refined {
            break;
        }
    }

    let covered: f64 = cells
        .iter()
        .map(|hash| cell_bounds(hash).map(|b| b.area()))
        .sum::<Result<f64>>()?;
    let box_area = target.area();
    let ratio = if box_area > 0.0 {
        covered / box_area
    } else {
        f64::INFINITY
    };

    Ok(CoverageSet::new(cells, ratio))
}

/// Children of `hash` whose cells share area with `target`.
fn overlapping_children(hash: &str, target: &BoundingBox) -> Result<Vec<String>> {
    let mut children = Vec::new();
    for &c in BASE32.iter() {
        let mut child = String::with_capacity(hash.len() + 1);
        child.push_str(hash);
        child.push(c as char);
        let bounds = cell_bounds(&child)?;
        if overlaps(&bounds, target) {
            children.push(child);
        }
    }
    Ok(children)
}

/// Whether `cell` can hold a point of `target`.
///
/// Encoding puts a point on a cell edge into the cell above it, so a cell
/// is half-open: its lower edges belong to it, its upper edges do not.
fn overlaps(cell: &BoundingBox, target: &BoundingBox) -> bool {
    let along = |cell_min: f64, cell_max: f64, min: f64, max: f64| cell_min <= max && min < cell_max;
    along(cell.min_x(), cell.max_x(), target.min_x(), target.max_x())
        && along(cell.min_y(), cell.max_y(), target.min_y(), target.max_y())
}
