use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use genmeta::{
    CanonicalMetadata, ChunkLoader, ExtractionService, MetadataError, RawChunkSet,
    RequestStatus, Scheme, ServiceConfig,
};

const WAIT: Duration = Duration::from_secs(5);

/// Loader that reports each load start and then blocks until released.
struct GateLoader {
    started: Mutex<mpsc::Sender<PathBuf>>,
    release: Mutex<mpsc::Receiver<()>>,
    hold: Duration,
    loads: AtomicUsize,
}

struct Gate {
    loader: Arc<GateLoader>,
    started: mpsc::Receiver<PathBuf>,
    release: mpsc::Sender<()>,
}

impl Gate {
    fn wait_started(&self) -> PathBuf {
        self.started.recv_timeout(WAIT).expect("load never started")
    }

    fn open(&self, times: usize) {
        for _ in 0..times {
            self.release.send(()).unwrap();
        }
    }

    fn loads(&self) -> usize {
        self.loader.loads.load(Ordering::SeqCst)
    }
}

fn gate(hold: Duration) -> Gate {
    let (started_tx, started) = mpsc::channel();
    let (release, release_rx) = mpsc::channel();
    Gate {
        loader: Arc::new(GateLoader {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
            hold,
            loads: AtomicUsize::new(0),
        }),
        started,
        release,
    }
}

impl ChunkLoader for GateLoader {
    fn load(&self, path: &Path) -> Result<RawChunkSet, MetadataError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.lock().unwrap().send(path.to_path_buf());
        let _ = self.release.lock().unwrap().recv_timeout(self.hold);
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        Ok(RawChunkSet::new().with_text(
            "parameters",
            format!("{name}\nSteps: 20, Sampler: Euler, Seed: 7"),
        ))
    }

    fn modified(&self, _path: &Path) -> Result<Option<DateTime<Utc>>, MetadataError> {
        Ok(Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()))
    }
}

fn start(gate: &Gate) -> ExtractionService {
    ExtractionService::with_config(gate.loader.clone(), ServiceConfig::default()).unwrap()
}

type Delivery = (PathBuf, Arc<CanonicalMetadata>);

fn sink(tx: mpsc::Sender<Delivery>) -> impl FnOnce(&Path, Arc<CanonicalMetadata>) + Send + 'static {
    move |path, meta| {
        let _ = tx.send((path.to_path_buf(), meta));
    }
}

#[test]
fn duplicate_requests_share_one_computation() {
    let gate = gate(WAIT);
    let service = start(&gate);
    let (tx, rx) = mpsc::channel();

    let first = service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    gate.wait_started();
    assert_eq!(service.status("/virtual/cat.png"), RequestStatus::Running);

    let second = service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    assert_eq!(first, second);
    gate.open(1);

    let (path_a, meta_a) = rx.recv_timeout(WAIT).unwrap();
    let (path_b, meta_b) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(path_a, PathBuf::from("/virtual/cat.png"));
    assert_eq!(path_a, path_b);
    assert!(Arc::ptr_eq(&meta_a, &meta_b));
    assert_eq!(meta_a.scheme, Scheme::FreeText);
    assert_eq!(meta_a.prompts.positive, "cat");
    assert_eq!(gate.loads(), 1);
}

#[test]
fn equivalent_spellings_of_a_path_are_joined() {
    let gate = gate(WAIT);
    let service = start(&gate);
    let (tx, rx) = mpsc::channel();

    service.extract("/virtual/dir/cat.png", sink(tx.clone())).unwrap();
    gate.wait_started();
    service
        .extract("/virtual/dir/../dir/./cat.png", sink(tx.clone()))
        .unwrap();
    gate.open(1);

    rx.recv_timeout(WAIT).unwrap();
    rx.recv_timeout(WAIT).unwrap();
    assert_eq!(gate.loads(), 1);
}

#[test]
fn invalidation_forces_recompute_with_unchanged_mtime() {
    let gate = gate(WAIT);
    gate.open(2);
    let service = start(&gate);
    let (tx, rx) = mpsc::channel();

    service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    let (_, first) = rx.recv_timeout(WAIT).unwrap();

    service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    let (_, cached) = rx.recv_timeout(WAIT).unwrap();
    assert!(Arc::ptr_eq(&first, &cached));
    assert_eq!(gate.loads(), 1);

    assert!(service.invalidate("/virtual/cat.png"));
    assert_eq!(service.status("/virtual/cat.png"), RequestStatus::Idle);
    assert!(service.cached("/virtual/cat.png").is_none());
    assert!(!service.invalidate("/virtual/cat.png"));

    service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    let (_, recomputed) = rx.recv_timeout(WAIT).unwrap();
    assert!(!Arc::ptr_eq(&first, &recomputed));
    assert_eq!(*first, *recomputed);
    assert_eq!(gate.loads(), 2);

    let stats = service.stats();
    assert_eq!(stats.computed, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.failures, 0);
}

#[test]
fn invalidating_a_running_request_suppresses_delivery() {
    let gate = gate(WAIT);
    let service = start(&gate);
    let (tx, rx) = mpsc::channel();

    service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    gate.wait_started();
    assert!(service.invalidate("/virtual/cat.png"));
    assert_eq!(service.status("/virtual/cat.png"), RequestStatus::Idle);

    // A fresh request queues behind the suppressed one and must recompute.
    service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    assert_eq!(service.status("/virtual/cat.png"), RequestStatus::Pending);
    gate.open(2);

    let (_, meta) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(meta.generation.steps, Some(20));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(gate.loads(), 2);
    assert!(service.cached("/virtual/cat.png").is_some());
}

#[test]
fn cancelling_a_queued_request_drops_it() {
    let gate = gate(WAIT);
    let service = start(&gate);
    let (tx, rx) = mpsc::channel();
    let (queued_tx, queued_rx) = mpsc::channel();

    service.extract("/virtual/busy.png", sink(tx.clone())).unwrap();
    gate.wait_started();
    service
        .extract("/virtual/queued.png", sink(queued_tx.clone()))
        .unwrap();
    drop(queued_tx);
    assert_eq!(service.status("/virtual/queued.png"), RequestStatus::Pending);
    assert_eq!(service.queue_len(), 1);

    assert!(service.cancel("/virtual/queued.png"));
    assert!(!service.cancel("/virtual/queued.png"));
    assert_eq!(service.status("/virtual/queued.png"), RequestStatus::Cancelled);
    assert_eq!(service.queue_len(), 0);
    gate.open(1);

    let (path, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(path, PathBuf::from("/virtual/busy.png"));
    assert!(matches!(queued_rx.try_recv(), Err(TryRecvError::Disconnected)));
    assert_eq!(gate.loads(), 1);
}

#[test]
fn cancelling_a_running_request_suppresses_callback_but_keeps_result() {
    let gate = gate(WAIT);
    let service = start(&gate);
    let (tx, rx) = mpsc::channel();

    service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    gate.wait_started();
    assert!(service.cancel("/virtual/cat.png"));
    assert_eq!(service.status("/virtual/cat.png"), RequestStatus::Cancelled);
    gate.open(1);

    // Sync point: a second request is served after the cancelled one finished.
    service.extract("/virtual/cat.png", sink(tx.clone())).unwrap();
    let (_, meta) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(meta.prompts.positive, "cat");
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(gate.loads(), 1);
    assert_eq!(service.stats().cache_hits, 1);
    assert_eq!(service.status("/virtual/cat.png"), RequestStatus::Completed);
}

#[test]
fn queued_duplicates_share_one_computation() {
    let gate = gate(WAIT);
    let service = start(&gate);
    let (tx, rx) = mpsc::channel();
    let (queued_tx, queued_rx) = mpsc::channel();

    service.extract("/virtual/busy.png", sink(tx.clone())).unwrap();
    gate.wait_started();
    let first = service
        .extract("/virtual/queued.png", sink(queued_tx.clone()))
        .unwrap();
    assert_eq!(service.status("/virtual/queued.png"), RequestStatus::Pending);
    let second = service
        .extract("/virtual/queued.png", sink(queued_tx.clone()))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(service.queue_len(), 1);
    gate.open(2);

    rx.recv_timeout(WAIT).unwrap();
    let (path_a, meta_a) = queued_rx.recv_timeout(WAIT).unwrap();
    let (path_b, meta_b) = queued_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(path_a, PathBuf::from("/virtual/queued.png"));
    assert_eq!(path_a, path_b);
    assert!(Arc::ptr_eq(&meta_a, &meta_b));
    assert_eq!(meta_a.prompts.positive, "queued");
    assert_eq!(gate.loads(), 2);
    assert_eq!(service.stats().computed, 2);
}

/// Loader that panics on any path named `boom.png`.
struct PanickingLoader;

impl ChunkLoader for PanickingLoader {
    fn load(&self, path: &Path) -> Result<RawChunkSet, MetadataError> {
        if path.ends_with("boom.png") {
            panic!("loader exploded");
        }
        Ok(RawChunkSet::new().with_text("parameters", "ok\nSteps: 5, Sampler: Euler"))
    }

    fn modified(&self, _path: &Path) -> Result<Option<DateTime<Utc>>, MetadataError> {
        Ok(None)
    }
}

#[test]
fn panics_are_contained_and_the_worker_keeps_serving() {
    let service =
        ExtractionService::with_config(Arc::new(PanickingLoader), ServiceConfig::default())
            .unwrap();
    let (tx, rx) = mpsc::channel();

    service.extract("/virtual/boom.png", sink(tx.clone())).unwrap();
    let (path, meta) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(path, PathBuf::from("/virtual/boom.png"));
    assert!(meta.is_unknown());
    assert!(service.cached("/virtual/boom.png").is_none());
    assert_eq!(service.status("/virtual/boom.png"), RequestStatus::Idle);

    // A panicking callback must not stop delivery to later callers.
    service
        .extract("/virtual/ok.png", |_, _| panic!("callback exploded"))
        .unwrap();
    service.extract("/virtual/ok.png", sink(tx.clone())).unwrap();
    let (_, meta) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(meta.prompts.positive, "ok");

    service.extract("/virtual/ok.png", sink(tx.clone())).unwrap();
    let (_, cached) = rx.recv_timeout(WAIT).unwrap();
    assert!(Arc::ptr_eq(&meta, &cached));

    let stats = service.stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.computed, 1);
    assert!(stats.cache_hits >= 1);
}

#[test]
fn drop_finishes_current_unit_and_discards_queue() {
    let gate = gate(Duration::from_millis(300));
    let service = start(&gate);
    let (tx, rx) = mpsc::channel();
    let (queued_tx, queued_rx) = mpsc::channel();

    service.extract("/virtual/running.png", sink(tx.clone())).unwrap();
    gate.wait_started();
    service
        .extract("/virtual/queued.png", sink(queued_tx.clone()))
        .unwrap();
    drop(queued_tx);
    drop(service);

    let (path, _) = rx.try_recv().expect("running unit was not delivered");
    assert_eq!(path, PathBuf::from("/virtual/running.png"));
    assert!(matches!(queued_rx.try_recv(), Err(TryRecvError::Disconnected)));
    assert_eq!(gate.loads(), 1);
}
