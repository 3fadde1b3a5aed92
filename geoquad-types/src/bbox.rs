use geo::{Point, Rect};
use serde::{Deserialize, Serialize};

/// An axis-aligned bounding box in a flat projected plane.
///
/// The box is described by its origin (`x`, `y`, the minimum corner) and its
/// extent (`width`, `height`). Boundaries are inclusive on every side. In the
/// default projection `x` is longitude and `y` is latitude, so "north" is the
/// side with the larger `y`.
///
/// The `key` names the box. Boxes that belong to a quadtree node share that
/// node's key; free-standing query boxes usually leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Name of the box (shared with the owning tree node, if any)
    pub key: String,
    /// Minimum x coordinate
    pub x: f64,
    /// Minimum y coordinate
    pub y: f64,
    /// Extent along x
    pub width: f64,
    /// Extent along y
    pub height: f64,
}

impl BoundingBox {
    /// Create an unnamed bounding box from its origin and extent.
    ///
    /// # Arguments
    ///
    /// * `x` - Minimum x (longitude) coordinate
    /// * `y` - Minimum y (latitude) coordinate
    /// * `width` - Extent along x
    /// * `height` - Extent along y
    ///
    /// # Panics
    ///
    /// Panics if `width` or `height` is negative or NaN.
    ///
    /// # Examples
    ///
    /// ```
    /// use geoquad_types::bbox::BoundingBox;
    ///
    /// let bbox = BoundingBox::new(-74.0, 40.7, 0.1, 0.1);
    /// assert_eq!(bbox.max_x(), -73.9);
    /// ```
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::with_key(String::new(), x, y, width, height)
    }

    /// Create a named bounding box.
    ///
    /// # Panics
    ///
    /// Panics if `width` or `height` is negative or NaN.
    pub fn with_key(key: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        assert!(
            width >= 0.0 && height >= 0.0,
            "Bounding box extent must be non-negative"
        );

        Self {
            key: key.into(),
            x,
            y,
            width,
            height,
        }
    }

    /// Create an unnamed bounding box from two opposite corners, in any order.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        let (min_x, max_x) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (min_y, max_y) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        Self::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    /// Create a bounding box from a `geo::Rect`.
    pub fn from_rect(rect: Rect<f64>) -> Self {
        Self::from_corners(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }

    /// The whole longitude/latitude plane: `x` in `[-180, 180]`, `y` in `[-90, 90]`.
    pub fn world() -> Self {
        Self::with_key("world", -180.0, -90.0, 360.0, 180.0)
    }

    /// Return a copy of this box carrying a different key.
    pub fn renamed(&self, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..self.clone()
        }
    }

    /// Get the minimum x coordinate.
    pub fn min_x(&self) -> f64 {
        self.x
    }

    /// Get the minimum y coordinate.
    pub fn min_y(&self) -> f64 {
        self.y
    }

    /// Get the maximum x coordinate.
    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    /// Get the maximum y coordinate.
    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    /// Area covered by the box.
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Get the center point of the bounding box.
    pub fn center(&self) -> Point<f64> {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Convert into a `geo::Rect`.
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            geo::coord! { x: self.min_x(), y: self.min_y() },
            geo::coord! { x: self.max_x(), y: self.max_y() },
        )
    }

    /// Check if a point lies inside the box, boundaries included.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x() && x <= self.max_x() && y >= self.min_y() && y <= self.max_y()
    }

    /// Check if `other` lies entirely inside this box, boundaries included.
    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        other.min_x() >= self.min_x()
            && other.max_x() <= self.max_x()
            && other.min_y() >= self.min_y()
            && other.max_y() <= self.max_y()
    }

    /// Check if this bounding box intersects with another. Touching edges count.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_x() < other.min_x()
            || self.min_x() > other.max_x()
            || self.max_y() < other.min_y()
            || self.min_y() > other.max_y())
    }

    /// Intersection of two boxes, or `None` when they do not overlap.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        if !self.intersects(other) {
            return None;
        }
        let min_x = self.min_x().max(other.min_x());
        let min_y = self.min_y().max(other.min_y());
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());
        Some(Self::new(min_x, min_y, max_x - min_x, max_y - min_y))
    }

    /// Split the box at the midpoint of both axes.
    ///
    /// The quadrants come back in the order north-west, north-east,
    /// south-west, south-east, unnamed. Together they cover the box exactly.
    pub fn quadrants(&self) -> [BoundingBox; 4] {
        let half_w = self.width / 2.0;
        let half_h = self.height / 2.0;
        let mid_x = self.x + half_w;
        let mid_y = self.y + half_h;

        [
            Self::new(self.x, mid_y, half_w, self.max_y() - mid_y),
            Self::new(mid_x, mid_y, self.max_x() - mid_x, self.max_y() - mid_y),
            Self::new(self.x, self.y, half_w, half_h),
            Self::new(mid_x, self.y, self.max_x() - mid_x, half_h),
        ]
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BoundingBox[{}]({}, {}, {} x {})",
            self.key, self.x, self.y, self.width, self.height
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_point_inclusive() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(bbox.contains_point(0.0, 0.0));
        assert!(bbox.contains_point(10.0, 10.0));
        assert!(bbox.contains_point(5.0, 10.0));
        assert!(!bbox.contains_point(10.000_001, 5.0));
        assert!(!bbox.contains_point(5.0, -0.000_001));
    }

    #[test]
    fn test_intersects_touching_edges() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(10.0, 0.0, 5.0, 5.0);
        let c = BoundingBox::new(10.5, 0.0, 5.0, 5.0);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_quadrants_partition_parent() {
        let parent = BoundingBox::new(-180.0, -90.0, 360.0, 180.0);
        let [nw, ne, sw, se] = parent.quadrants();

        assert_eq!((nw.x, nw.y), (-180.0, 0.0));
        assert_eq!((ne.x, ne.y), (0.0, 0.0));
        assert_eq!((sw.x, sw.y), (-180.0, -90.0));
        assert_eq!((se.x, se.y), (0.0, -90.0));

        let total: f64 = [&nw, &ne, &sw, &se].iter().map(|q| q.area()).sum();
        assert_eq!(total, parent.area());
        assert_eq!(ne.max_x(), parent.max_x());
        assert_eq!(nw.max_y(), parent.max_y());
    }

    #[test]
    fn test_from_corners_orders_coordinates() {
        let bbox = BoundingBox::from_corners(5.0, 8.0, -5.0, 2.0);
        assert_eq!(bbox.min_x(), -5.0);
        assert_eq!(bbox.min_y(), 2.0);
        assert_eq!(bbox.width, 10.0);
        assert_eq!(bbox.height, 6.0);
    }

    #[test]
    fn test_intersection() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 5.0, 10.0, 10.0);
        let i = a.intersection(&b).unwrap();
        assert_eq!((i.x, i.y, i.width, i.height), (5.0, 5.0, 5.0, 5.0));
        assert!(a.intersection(&BoundingBox::new(20.0, 20.0, 1.0, 1.0)).is_none());
    }

    #[test]
    #[should_panic]
    fn test_negative_extent_panics() {
        let _ = BoundingBox::new(0.0, 0.0, -1.0, 1.0);
    }
}
