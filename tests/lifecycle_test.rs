use crossbeam_channel::{Receiver, Sender};
use geoquad::prelude::*;
use std::sync::{Arc, Mutex, Weak};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Holds the writer inside its first build until released.
struct Gate {
    release: Mutex<Option<Receiver<()>>>,
    events: Mutex<Vec<String>>,
}

impl Gate {
    fn new() -> (Arc<Self>, Sender<()>) {
        let (open, release) = crossbeam_channel::bounded(1);
        let gate = Arc::new(Gate {
            release: Mutex::new(Some(release)),
            events: Mutex::new(Vec::new()),
        });
        (gate, open)
    }
}

impl IndexObserver for Gate {
    fn will_begin_indexing(&self, state: IndexState) {
        self.events.lock().unwrap().push(format!("begin {}", state));
        let release = self.release.lock().unwrap().take();
        if let Some(release) = release {
            release.recv().unwrap();
        }
    }

    fn percent_indexed(&self, percent: f64, _state: IndexState) {
        if percent == 100.0 {
            self.events.lock().unwrap().push("100%".to_string());
        }
    }

    fn did_end_indexing(&self, state: IndexState) {
        self.events.lock().unwrap().push(format!("end {}", state));
    }
}

/// Re-reads the index from its end-of-indexing callback, like a map
/// reloading its annotations.
struct Reloader {
    manager: Mutex<Weak<IndexManager>>,
    seen: Mutex<Vec<Option<usize>>>,
}

impl IndexObserver for Reloader {
    fn did_end_indexing(&self, _state: IndexState) {
        let Some(manager) = self.manager.lock().unwrap().upgrade() else {
            return;
        };

        let (done, answer) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let _ = done.send(manager.query(&BoundingBox::world()).map(|p| p.len()));
        });
        let queried = answer
            .recv_timeout(Duration::from_secs(5))
            .ok()
            .and_then(|r| r.ok());
        self.seen.lock().unwrap().push(queried);
    }
}

fn loaded_manager() -> (IndexContext, Arc<IndexManager>) {
    let context = ContextBuilder::new().build().unwrap();
    let manager = context.manager_for("Venue", "lat", "lon").unwrap();
    let records: Vec<Record> = (0..20)
        .map(|i| {
            Record::new("Venue", i)
                .with_field("lat", f64::from(i))
                .with_field("lon", f64::from(i))
        })
        .collect();
    manager.insert_objects(&records).unwrap();
    manager.flush().unwrap();
    (context, manager)
}

#[test]
fn test_queries_during_rebuild_are_rejected() {
    init_logging();
    let (_context, manager) = loaded_manager();
    let (gate, open) = Gate::new();
    let _token = manager.add_observer(gate.clone());

    manager.reindex().unwrap();
    while manager.state() != IndexState::Indexing {
        std::thread::yield_now();
    }

    let view = BoundingBox::new(-1.0, -1.0, 30.0, 30.0);
    assert!(matches!(
        manager.query(&view),
        Err(GeoquadError::NotReady(IndexState::Indexing))
    ));
    assert!(manager.cluster(&view, 10).is_err());

    open.send(()).unwrap();
    assert_eq!(manager.wait_until_ready(Duration::from_secs(10)), IndexState::Ready);
    assert_eq!(manager.query(&view).unwrap().len(), 20);

    let events = gate.events.lock().unwrap().clone();
    assert_eq!(events, vec!["begin indexing", "100%", "end ready"]);
}

#[test]
fn test_insert_reports_preparing_data() {
    init_logging();
    let (_context, manager) = loaded_manager();
    let (gate, open) = Gate::new();
    let _token = manager.add_observer(gate.clone());
    open.send(()).unwrap();

    manager
        .insert_objects(&[Record::new("Venue", 99)
            .with_field("lat", 5.5)
            .with_field("lon", 5.5)])
        .unwrap();
    manager.flush().unwrap();

    let events = gate.events.lock().unwrap().clone();
    assert_eq!(events, vec!["begin preparing data", "end ready"]);
    assert_eq!(manager.len(), 21);
}

#[test]
fn test_manager_outlives_its_context() {
    init_logging();
    let (context, manager) = loaded_manager();
    drop(context);

    assert_eq!(manager.query(&BoundingBox::world()).unwrap().len(), 20);
    manager.reindex().unwrap();
    manager.flush().unwrap();
    assert_eq!(manager.len(), 20);
}

#[test]
fn test_observer_can_query_when_indexing_ends() {
    init_logging();
    let (_context, manager) = loaded_manager();
    let reloader = Arc::new(Reloader {
        manager: Mutex::new(Arc::downgrade(&manager)),
        seen: Mutex::new(Vec::new()),
    });
    let _token = manager.add_observer(reloader.clone());

    manager
        .insert_objects(&[Record::new("Venue", 50)
            .with_field("lat", 1.5)
            .with_field("lon", 1.5)])
        .unwrap();
    manager.flush().unwrap();
    manager.reindex().unwrap();
    manager.flush().unwrap();

    assert_eq!(*reloader.seen.lock().unwrap(), vec![Some(21), Some(21)]);
}
