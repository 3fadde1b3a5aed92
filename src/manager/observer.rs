//! Indexing progress callbacks.

use crate::notify::Subscription;
use crate::quadtree::IndexState;

/// Receives progress of builds and incremental batches.
///
/// Callbacks run on the index manager's writer thread and should return
/// quickly. Every method has an empty default so observers implement only
/// what they need.
pub trait IndexObserver: Send + Sync {
    /// A build or batch is about to start.
    fn will_begin_indexing(&self, _state: IndexState) {}

    /// Share of the current full build that is done, from 0 to 100.
    fn percent_indexed(&self, _percent: f64, _state: IndexState) {}

    /// The build or batch finished; `state` is the resulting state.
    fn did_end_indexing(&self, _state: IndexState) {}
}

/// Token keeping an observer registered.
pub type ObserverToken = Subscription<dyn IndexObserver>;
