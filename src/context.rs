//! Explicit owner of a store, its notification manager and its indexes.

use crate::config::Config;
use crate::error::Result;
use crate::manager::{IndexManager, IndexRequest};
use crate::notify::NotificationManager;
use crate::storage::{MemoryStore, RecordStore};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Weak};

/// Everything needed to index one store.
///
/// The context attaches a [`NotificationManager`] to the store's commits and
/// hands out one [`IndexManager`] per [`IndexRequest`]. Managers are held
/// weakly: asking twice while the first handle is alive returns the same
/// manager, and dropping every handle shuts it down.
///
/// # Examples
///
/// ```rust
/// use geoquad::prelude::*;
///
/// let context = ContextBuilder::new().build()?;
/// let first = context.manager_for("Cafe", "lat", "lon")?;
/// let second = context.manager_for("Cafe", "lat", "lon")?;
/// assert!(std::sync::Arc::ptr_eq(&first, &second));
/// # Ok::<(), geoquad::GeoquadError>(())
/// ```
pub struct IndexContext {
    store: Arc<dyn RecordStore>,
    notifications: Arc<NotificationManager>,
    config: Config,
    managers: Mutex<FxHashMap<u64, Weak<IndexManager>>>,
}

impl IndexContext {
    /// Build a context over `store`.
    pub fn new(store: Arc<dyn RecordStore>, config: Config) -> Self {
        let notifications = NotificationManager::new();
        notifications.attach(&store);
        log::debug!("Created index context for store {}", store.identity());
        Self {
            store,
            notifications,
            config,
            managers: Mutex::new(FxHashMap::default()),
        }
    }

    /// A context over a fresh in-memory store.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new("memory")), Config::default())
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.notifications
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The manager for `request`, opening it if no live handle exists.
    pub fn manager(&self, request: IndexRequest) -> Result<Arc<IndexManager>> {
        let id = request.id();
        let mut managers = self.managers.lock();
        if let Some(manager) = managers.get(&id).and_then(Weak::upgrade) {
            return Ok(manager);
        }

        let manager = Arc::new(IndexManager::new(
            request,
            self.store.clone(),
            self.notifications.clone(),
            self.config.clone(),
        )?);
        managers.retain(|_, weak| weak.strong_count() > 0);
        managers.insert(id, Arc::downgrade(&manager));
        Ok(manager)
    }

    /// The manager indexing `entity_name` by the given coordinate fields.
    pub fn manager_for(
        &self,
        entity_name: &str,
        latitude_field: &str,
        longitude_field: &str,
    ) -> Result<Arc<IndexManager>> {
        let request = IndexRequest::for_store(
            entity_name,
            latitude_field,
            longitude_field,
            self.store.as_ref(),
        );
        self.manager(request)
    }

    /// Turn on incremental indexing for `request`, returning its manager.
    ///
    /// The manager keeps indexing for as long as the returned handle, or
    /// any other handle to it, is alive.
    pub fn start_on_demand_indexing(&self, request: IndexRequest) -> Result<Arc<IndexManager>> {
        let manager = self.manager(request)?;
        manager.start_on_demand_indexing();
        Ok(manager)
    }

    /// Turn off incremental indexing for `request` if its manager is open.
    pub fn stop_on_demand_indexing(&self, request: &IndexRequest) {
        let manager = self
            .managers
            .lock()
            .get(&request.id())
            .and_then(Weak::upgrade);
        if let Some(manager) = manager {
            manager.stop_on_demand_indexing();
        }
    }

    /// Number of managers with a live handle.
    pub fn open_managers(&self) -> usize {
        self.managers
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for IndexContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexContext")
            .field("store", &self.store.identity())
            .field("open_managers", &self.open_managers())
            .finish()
    }
}
