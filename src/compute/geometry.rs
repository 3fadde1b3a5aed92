//! Flat-plane geometry predicates.
//!
//! Points use `x = longitude`, `y = latitude`. All tests are inclusive on the
//! box boundary.

use geo::{Distance, Euclidean, Point};
use geoquad_types::bbox::BoundingBox;

/// Check whether `point` lies within `[x, x + width] x [y, y + height]`.
///
/// # Examples
///
/// ```rust
/// use geoquad::compute::geometry::contains;
/// use geoquad::{BoundingBox, Point};
///
/// let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
/// assert!(contains(&bbox, &Point::new(10.0, 0.0)));
/// assert!(!contains(&bbox, &Point::new(10.5, 0.0)));
/// ```
#[inline]
pub fn contains(bbox: &BoundingBox, point: &Point<f64>) -> bool {
    bbox.contains_point(point.x(), point.y())
}

/// Check whether two boxes overlap. Touching edges count as overlapping.
#[inline]
pub fn intersects(a: &BoundingBox, b: &BoundingBox) -> bool {
    a.intersects(b)
}

/// Straight-line distance between two points in index coordinates.
#[inline]
pub fn planar_distance(a: &Point<f64>, b: &Point<f64>) -> f64 {
    Euclidean.distance(*a, *b)
}

/// Smallest box covering a circle of `radius` around `center`.
pub fn circle_bounds(center: &Point<f64>, radius: f64) -> BoundingBox {
    let r = radius.abs();
    BoundingBox::from_corners(
        center.x() - r,
        center.y() - r,
        center.x() + r,
        center.y() + r,
    )
}

/// Arithmetic mean of a set of points, or `None` for an empty set.
pub fn centroid<'a, I>(points: I) -> Option<Point<f64>>
where
    I: IntoIterator<Item = &'a Point<f64>>,
{
    let mut count = 0usize;
    let (mut sx, mut sy) = (0.0, 0.0);
    for p in points {
        sx += p.x();
        sy += p.y();
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(Point::new(sx / count as f64, sy / count as f64))
}
