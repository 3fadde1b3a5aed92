use crate::record::{PrimaryKey, PrimaryKeyKind, RecordId};
use geo::Point;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// An immutable snapshot of one indexed geographic point.
///
/// A `DataSnapshot` mirrors a persisted record without referencing it, so it
/// can be shared across threads and retained indefinitely. Two snapshots are
/// the same logical point when their entity class and primary key match; the
/// coordinates may differ if one of them is stale.
///
/// The point's planar position is `x = longitude`, `y = latitude`.
///
/// # Examples
///
/// ```
/// use geoquad_types::point::DataSnapshot;
/// use geoquad_types::record::PrimaryKey;
///
/// let a = DataSnapshot::new("Cafe", PrimaryKey::Int(1), 40.0, -74.0);
/// let b = DataSnapshot::new("Cafe", PrimaryKey::Int(1), 41.0, -73.0);
/// assert_eq!(a, b); // same record, different (stale) coordinates
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSnapshot {
    id: RecordId,
    /// Latitude of the point
    pub latitude: f64,
    /// Longitude of the point
    pub longitude: f64,
    /// Distance from the centre of the last distance-ordered search
    #[serde(skip)]
    pub transient_distance: f64,
}

impl DataSnapshot {
    /// Create a snapshot for a record of `entity_class` at the given coordinates.
    pub fn new(
        entity_class: impl Into<String>,
        primary_key: impl Into<PrimaryKey>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            id: RecordId::new(entity_class, primary_key),
            latitude,
            longitude,
            transient_distance: 0.0,
        }
    }

    /// Create a snapshot from an existing record identity.
    pub fn from_id(id: RecordId, latitude: f64, longitude: f64) -> Self {
        Self {
            id,
            latitude,
            longitude,
            transient_distance: 0.0,
        }
    }

    /// Identity of the mirrored record.
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Entity (class) name of the mirrored record.
    pub fn entity_class(&self) -> &str {
        &self.id.entity_class
    }

    /// Primary key of the mirrored record.
    pub fn primary_key(&self) -> &PrimaryKey {
        &self.id.primary_key
    }

    /// Declared kind of the primary key.
    pub fn primary_key_kind(&self) -> PrimaryKeyKind {
        self.id.primary_key.kind()
    }

    /// Planar x coordinate (longitude).
    pub fn x(&self) -> f64 {
        self.longitude
    }

    /// Planar y coordinate (latitude).
    pub fn y(&self) -> f64 {
        self.latitude
    }

    /// Position as a `geo::Point` (x = longitude, y = latitude).
    pub fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    /// Whether both coordinates are finite numbers.
    pub fn has_valid_coordinate(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }

    /// Whether `other` carries exactly the same position.
    pub fn same_position(&self, other: &DataSnapshot) -> bool {
        self.latitude == other.latitude && self.longitude == other.longitude
    }
}

impl PartialEq for DataSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DataSnapshot {}

impl Hash for DataSnapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
