//! Persistent quadtree index over geographic records, with viewport
//! clustering.
//!
//! ```rust
//! use geoquad::prelude::*;
//!
//! let context = ContextBuilder::new().build()?;
//! let cafes = context.manager_for("Cafe", "lat", "lon")?;
//!
//! let record = Record::new("Cafe", 1)
//!     .with_field("lat", 40.7128)
//!     .with_field("lon", -74.0060)
//!     .with_field("name", "Corner Cafe");
//! cafes.insert_objects(&[record])?;
//! cafes.flush()?;
//!
//! let view = BoundingBox::new(-74.1, 40.6, 0.2, 0.2);
//! let clusters = cafes.cluster(&view, 14)?;
//! assert_eq!(clusters[0].title.as_deref(), Some("Corner Cafe"));
//! # Ok::<(), geoquad::GeoquadError>(())
//! ```

pub mod builder;
pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod notify;
pub mod quadtree;
pub mod snapshot;
pub mod storage;

pub use builder::ContextBuilder;
pub use config::{ClusterConfig, Config, ZoomStep};
pub use context::IndexContext;
pub use error::{GeoquadError, Result};

pub use geo::Point;
pub use geoquad_types::bbox::BoundingBox;
pub use geoquad_types::point::DataSnapshot;
pub use geoquad_types::record::{FieldValue, PrimaryKey, PrimaryKeyKind, RecordId};

pub use compute::Cluster;
pub use manager::{IndexManager, IndexObserver, IndexRequest, ObserverToken};
pub use notify::{EntityChangeSet, NotificationManager, SubscriptionToken};
pub use quadtree::{IndexState, QuadTree, QuadTreeIndex, QuadTreeNode, TreeStats};
pub use snapshot::SafeRecord;
pub use storage::{MemoryStore, Record, RecordStore, StoreOp, StoreStats};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{ContextBuilder, GeoquadError, IndexContext, Result};

    pub use crate::{BoundingBox, DataSnapshot, Point, RecordId};

    pub use crate::{Cluster, Config, IndexManager, IndexObserver, IndexRequest, IndexState};

    pub use crate::{EntityChangeSet, NotificationManager, SafeRecord};

    pub use crate::{MemoryStore, Record, RecordStore};

    pub use std::time::Duration;
}
