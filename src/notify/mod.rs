//! Change notification for record stores.
//!
//! Producers report additions, changes and deletions as they make them. The
//! manager folds them into one pending diff per entity class and, when the
//! store commits, hands each diff to every subscriber exactly once.
//!
//! Reports are folded per record identity:
//!
//! | pending  | then reported | result                 |
//! |----------|---------------|------------------------|
//! | added    | changed       | added, latest values   |
//! | added    | deleted       | nothing                |
//! | changed  | deleted       | deleted                |
//! | deleted  | added         | changed                |
//! | deleted  | changed       | deleted                |

pub mod registry;

pub use registry::{Registry, Subscription};

use crate::snapshot::SafeRecord;
use crate::storage::{HookId, Record, RecordStore};
use geoquad_types::record::RecordId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// The committed changes to one entity class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityChangeSet {
    pub entity_class: String,
    pub added: Vec<SafeRecord>,
    pub deleted: Vec<SafeRecord>,
    pub changed: Vec<SafeRecord>,
}

impl EntityChangeSet {
    pub fn new(entity_class: impl Into<String>) -> Self {
        Self {
            entity_class: entity_class.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }

    /// Total number of affected records.
    pub fn len(&self) -> usize {
        self.added.len() + self.deleted.len() + self.changed.len()
    }
}

/// Handler receiving one change set per affected entity class.
pub type ChangeHandler = dyn Fn(&EntityChangeSet) + Send + Sync;

/// Token keeping a change handler subscribed.
pub type SubscriptionToken = Subscription<ChangeHandler>;

#[derive(Debug, Clone)]
enum Pending {
    Added(SafeRecord),
    Changed(SafeRecord),
    Deleted(SafeRecord),
}

#[derive(Default)]
struct PendingChanges {
    entities: FxHashMap<String, BTreeMap<RecordId, Pending>>,
}

impl PendingChanges {
    fn slot(&mut self, record: &SafeRecord) -> &mut BTreeMap<RecordId, Pending> {
        self.entities
            .entry(record.entity_class().to_string())
            .or_default()
    }

    fn added(&mut self, record: SafeRecord) {
        let slot = self.slot(&record);
        let next = match slot.remove(record.id()) {
            Some(Pending::Deleted(_)) | Some(Pending::Changed(_)) => Pending::Changed(record),
            Some(Pending::Added(_)) | None => Pending::Added(record),
        };
        slot.insert(next_id(&next), next);
    }

    fn changed(&mut self, record: SafeRecord) {
        let slot = self.slot(&record);
        let next = match slot.remove(record.id()) {
            Some(Pending::Added(_)) => Pending::Added(record),
            Some(deleted @ Pending::Deleted(_)) => deleted,
            Some(Pending::Changed(_)) | None => Pending::Changed(record),
        };
        slot.insert(next_id(&next), next);
    }

    fn deleted(&mut self, record: SafeRecord) {
        let slot = self.slot(&record);
        match slot.remove(record.id()) {
            Some(Pending::Added(_)) => {}
            Some(Pending::Changed(_)) | Some(Pending::Deleted(_)) | None => {
                slot.insert(record.id().clone(), Pending::Deleted(record));
            }
        }
    }

    fn into_change_sets(self) -> Vec<EntityChangeSet> {
        let mut sets: Vec<EntityChangeSet> = self
            .entities
            .into_iter()
            .filter_map(|(entity_class, ops)| {
                let mut set = EntityChangeSet::new(entity_class);
                for (_, op) in ops {
                    match op {
                        Pending::Added(r) => set.added.push(r),
                        Pending::Changed(r) => set.changed.push(r),
                        Pending::Deleted(r) => set.deleted.push(r),
                    }
                }
                (!set.is_empty()).then_some(set)
            })
            .collect();
        sets.sort_by(|a, b| a.entity_class.cmp(&b.entity_class));
        sets
    }
}

fn next_id(op: &Pending) -> RecordId {
    match op {
        Pending::Added(r) | Pending::Changed(r) | Pending::Deleted(r) => r.id().clone(),
    }
}

/// Collects record changes and broadcasts them when the store commits.
///
/// # Examples
///
/// ```rust
/// use geoquad::notify::NotificationManager;
/// use geoquad::storage::{MemoryStore, Record, RecordStore};
/// use std::sync::{Arc, Mutex};
///
/// let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new("places"));
/// let notifications = NotificationManager::new();
/// notifications.attach(&store);
///
/// let seen = Arc::new(Mutex::new(0));
/// let counter = seen.clone();
/// let _token = notifications.subscribe(move |changes| {
///     *counter.lock().unwrap() += changes.added.len();
/// });
///
/// let cafe = Record::new("Cafe", 1).with_field("lat", 1.0).with_field("lon", 2.0);
/// notifications.register_added(&cafe);
/// store.put(&cafe)?;
/// store.commit()?;
///
/// assert_eq!(*seen.lock().unwrap(), 1);
/// # Ok::<(), geoquad::GeoquadError>(())
/// ```
pub struct NotificationManager {
    pending: Mutex<PendingChanges>,
    subscribers: Registry<ChangeHandler>,
    hooks: Mutex<Vec<(Weak<dyn RecordStore>, HookId)>>,
}

impl NotificationManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(PendingChanges::default()),
            subscribers: Registry::new(),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Broadcast on every commit of `store`.
    ///
    /// The hook holds the manager weakly, so attaching does not keep the
    /// manager alive.
    pub fn attach(self: &Arc<Self>, store: &Arc<dyn RecordStore>) -> HookId {
        let manager = Arc::downgrade(self);
        let hook = store.add_commit_hook(Arc::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.did_commit();
            }
        }));
        self.hooks.lock().push((Arc::downgrade(store), hook));
        hook
    }

    /// Stop listening to every store this manager is attached to.
    pub fn detach(&self) {
        for (store, hook) in self.hooks.lock().drain(..) {
            if let Some(store) = store.upgrade() {
                store.remove_commit_hook(hook);
            }
        }
    }

    /// Report a record that was, or is about to be, created.
    pub fn register_added(&self, record: &Record) {
        self.pending.lock().added(SafeRecord::from(record));
    }

    /// Report a record whose fields changed.
    pub fn register_changed(&self, record: &Record) {
        self.pending.lock().changed(SafeRecord::from(record));
    }

    /// Report a record about to be deleted.
    ///
    /// Must be called before the deletion, while the record can still be
    /// read.
    pub fn register_deleted(&self, record: &Record) {
        self.pending.lock().deleted(SafeRecord::from(record));
    }

    pub fn register_added_all<'a, I>(&self, records: I)
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut pending = self.pending.lock();
        for record in records {
            pending.added(SafeRecord::from(record));
        }
    }

    pub fn register_changed_all<'a, I>(&self, records: I)
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut pending = self.pending.lock();
        for record in records {
            pending.changed(SafeRecord::from(record));
        }
    }

    pub fn register_deleted_all<'a, I>(&self, records: I)
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut pending = self.pending.lock();
        for record in records {
            pending.deleted(SafeRecord::from(record));
        }
    }

    /// The changes that the next commit would broadcast.
    pub fn pending(&self) -> Vec<EntityChangeSet> {
        let pending = self.pending.lock();
        let copy = PendingChanges {
            entities: pending.entities.clone(),
        };
        copy.into_change_sets()
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .entities
            .values()
            .any(|ops| !ops.is_empty())
    }

    /// Receive every committed change set.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&EntityChangeSet) + Send + Sync + 'static,
    {
        self.subscribers.register(Arc::new(handler))
    }

    /// Receive committed change sets for one entity class only.
    pub fn subscribe_entity<F>(&self, entity_class: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&EntityChangeSet) + Send + Sync + 'static,
    {
        let entity_class = entity_class.into();
        self.subscribe(move |changes| {
            if changes.entity_class == entity_class {
                handler(changes);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Swap out the pending diff and broadcast it.
    ///
    /// Called by the commit hook installed with [`attach`](Self::attach);
    /// stores without hooks can call it directly after committing.
    pub fn did_commit(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let change_sets = pending.into_change_sets();
        if change_sets.is_empty() {
            return;
        }

        let subscribers = self.subscribers.live();
        if subscribers.is_empty() {
            log::debug!("Discarding {} change sets with no subscribers", change_sets.len());
            return;
        }

        for changes in &change_sets {
            log::debug!(
                "Broadcasting {} changes to {} ({} added, {} changed, {} deleted) to {} subscribers",
                changes.len(),
                changes.entity_class,
                changes.added.len(),
                changes.changed.len(),
                changes.deleted.len(),
                subscribers.len()
            );
            for subscriber in &subscribers {
                subscriber(changes);
            }
        }
    }
}

impl Drop for NotificationManager {
    fn drop(&mut self) {
        self.detach();
    }
}
