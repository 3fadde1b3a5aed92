//! # geoquad-types
//!
//! Plain data types for the geoquad spatial index.
//!
//! - **Geometry**: `BoundingBox`, an axis-aligned box in a flat projected plane
//! - **Identity**: `PrimaryKey`, `PrimaryKeyKind`, `RecordId`
//! - **Values**: `FieldValue`, the typed scalar held by a record field
//! - **Points**: `DataSnapshot`, one immutable indexed point
//!
//! Every type here is `Send + Sync`, serializable with Serde and carries no
//! reference to the store it was read from.
//!
//! ## Examples
//!
//! ```rust
//! use geoquad_types::bbox::BoundingBox;
//! use geoquad_types::point::DataSnapshot;
//! use geoquad_types::record::PrimaryKey;
//!
//! let snapshot = DataSnapshot::new("Cafe", PrimaryKey::from("espresso-bar"), 40.7128, -74.0060);
//! let manhattan = BoundingBox::new(-74.05, 40.68, 0.15, 0.20);
//! assert!(manhattan.contains_point(snapshot.x(), snapshot.y()));
//! ```

pub mod bbox;
pub mod point;
pub mod record;
