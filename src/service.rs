//! Background extraction service with single-flight de-duplication,
//! cancellation and a modification-time validated result cache.
//!
//! One worker thread drains a FIFO queue of requests. All bookkeeping lives in
//! one `Mutex<ServiceState>`; loading and normalization run outside the lock
//! and callbacks are invoked after it is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::{env, fs, thread};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::config::{ExtractionConfig, ServiceConfig};
use crate::data::CanonicalMetadata;
use crate::errors::MetadataError;
use crate::normalize::detect_and_normalize_with;
use crate::png::ChunkLoader;
use crate::types::RequestId;

/// Callback invoked with the canonical path and the shared result.
pub type ExtractionCallback = Box<dyn FnOnce(&Path, Arc<CanonicalMetadata>) + Send + 'static>;

/// Per-path request state as seen by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Nothing queued, running or cached.
    Idle,
    /// Queued and waiting for the worker.
    Pending,
    /// Currently being extracted.
    Running,
    /// A cached result is available.
    Completed,
    /// The last request for the path was cancelled.
    Cancelled,
}

/// Snapshot of the service counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Results computed from freshly loaded chunks.
    pub computed: u64,
    /// Results served from the cache.
    pub cache_hits: u64,
    /// Loader failures and panics delivered as `Unknown` records.
    pub failures: u64,
}

/// Cached result plus the file modification time it was computed against.
#[derive(Clone, Debug)]
pub struct ExtractionCacheEntry {
    /// Shared canonical record.
    pub metadata: Arc<CanonicalMetadata>,
    /// Modification time observed before loading.
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
}

/// Why a running request must not deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Suppression {
    Cancelled,
    /// Also keeps the result out of the cache.
    Invalidated,
}

struct Request {
    path: PathBuf,
    callbacks: Vec<ExtractionCallback>,
    phase: Phase,
    suppressed: Option<Suppression>,
}

#[derive(Default)]
struct ServiceState {
    queue: VecDeque<RequestId>,
    requests: HashMap<RequestId, Request>,
    /// Path → live request; joined by duplicate `extract` calls.
    active: HashMap<PathBuf, RequestId>,
    cache: HashMap<PathBuf, ExtractionCacheEntry>,
    /// Paths whose last request was cancelled; cleared by `extract`/`invalidate`.
    cancelled: HashSet<PathBuf>,
    next_id: RequestId,
    /// Set by `shutdown` and by the worker when it exits.
    shutdown: bool,
}

#[derive(Default)]
struct ServiceCounters {
    computed: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
}

struct Shared {
    state: Mutex<ServiceState>,
    wake: Condvar,
    counters: ServiceCounters,
    loader: Arc<dyn ChunkLoader>,
    config: ExtractionConfig,
}

enum Outcome {
    CacheHit(Arc<CanonicalMetadata>),
    Computed(ExtractionCacheEntry),
    Failed(Arc<CanonicalMetadata>),
}

impl Outcome {
    fn metadata(&self) -> &Arc<CanonicalMetadata> {
        match self {
            Self::CacheHit(metadata) | Self::Failed(metadata) => metadata,
            Self::Computed(entry) => &entry.metadata,
        }
    }
}

/// Asynchronous metadata extraction over a `ChunkLoader`.
pub struct ExtractionService {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for ExtractionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionService")
            .field("stats", &self.stats())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl ExtractionService {
    /// Start a service with the default configuration.
    pub fn new<L: ChunkLoader + 'static>(loader: L) -> Result<Self, MetadataError> {
        Self::with_config(Arc::new(loader), ServiceConfig::default())
    }

    /// Start a service with an explicit configuration.
    pub fn with_config(
        loader: Arc<dyn ChunkLoader>,
        config: ServiceConfig,
    ) -> Result<Self, MetadataError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ServiceState::default()),
            wake: Condvar::new(),
            counters: ServiceCounters::default(),
            loader,
            config: config.extraction,
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(config.worker_thread_name)
            .spawn(move || run_worker(worker))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Queue extraction of `path`, or join the live request for the same path.
    ///
    /// Every joined callback receives the same `Arc` result.
    pub fn extract<F>(&self, path: impl AsRef<Path>, callback: F) -> Result<RequestId, MetadataError>
    where
        F: FnOnce(&Path, Arc<CanonicalMetadata>) + Send + 'static,
    {
        let key = cache_key(path.as_ref());
        let mut state = self.lock();
        if state.shutdown {
            return Err(MetadataError::ServiceStopped);
        }
        state.cancelled.remove(&key);
        if let Some(&id) = state.active.get(&key) {
            if let Some(request) = state.requests.get_mut(&id) {
                request.callbacks.push(Box::new(callback));
                debug!(request = id, path = %key.display(), "joined in-flight extraction");
                return Ok(id);
            }
        }

        state.next_id = state.next_id.wrapping_add(1);
        let id = state.next_id;
        state.requests.insert(
            id,
            Request {
                path: key.clone(),
                callbacks: vec![Box::new(callback)],
                phase: Phase::Queued,
                suppressed: None,
            },
        );
        state.active.insert(key, id);
        state.queue.push_back(id);
        drop(state);
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Drop a queued request, or suppress delivery of a running one.
    ///
    /// Returns `false` when nothing was queued or running for `path`.
    pub fn cancel(&self, path: impl AsRef<Path>) -> bool {
        let key = cache_key(path.as_ref());
        let mut state = self.lock();
        let Some(id) = state.active.remove(&key) else {
            return false;
        };
        let phase = state.requests.get(&id).map(|request| request.phase);
        match phase {
            Some(Phase::Queued) => {
                state.requests.remove(&id);
                state.queue.retain(|queued| *queued != id);
            }
            Some(Phase::Running) => suppress(&mut state, id, Suppression::Cancelled),
            None => return false,
        }
        debug!(request = id, path = %key.display(), "extraction cancelled");
        state.cancelled.insert(key);
        true
    }

    /// Forget the cached result for `path` and suppress any running delivery.
    ///
    /// A queued request stays queued and recomputes. Returns `true` when a
    /// cached entry or running request was affected.
    pub fn invalidate(&self, path: impl AsRef<Path>) -> bool {
        let key = cache_key(path.as_ref());
        let mut state = self.lock();
        let mut affected = state.cache.remove(&key).is_some();
        state.cancelled.remove(&key);
        let running = state
            .active
            .get(&key)
            .copied()
            .filter(|id| state.requests.get(id).map(|r| r.phase) == Some(Phase::Running));
        if let Some(id) = running {
            state.active.remove(&key);
            suppress(&mut state, id, Suppression::Invalidated);
            affected = true;
        }
        if affected {
            debug!(path = %key.display(), "extraction cache invalidated");
        }
        affected
    }

    /// Current state of `path`.
    pub fn status(&self, path: impl AsRef<Path>) -> RequestStatus {
        let key = cache_key(path.as_ref());
        let state = self.lock();
        let phase = state
            .active
            .get(&key)
            .and_then(|id| state.requests.get(id))
            .map(|request| request.phase);
        match phase {
            Some(Phase::Queued) => RequestStatus::Pending,
            Some(Phase::Running) => RequestStatus::Running,
            None if state.cancelled.contains(&key) => RequestStatus::Cancelled,
            None if state.cache.contains_key(&key) => RequestStatus::Completed,
            None => RequestStatus::Idle,
        }
    }

    /// Cached result for `path`, without touching the file.
    pub fn cached(&self, path: impl AsRef<Path>) -> Option<Arc<CanonicalMetadata>> {
        let key = cache_key(path.as_ref());
        self.lock()
            .cache
            .get(&key)
            .map(|entry| Arc::clone(&entry.metadata))
    }

    /// Number of requests waiting for the worker.
    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ServiceStats {
        let counters = &self.shared.counters;
        ServiceStats {
            computed: counters.computed.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker after its current request; queued requests are dropped.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.lock();
            state.shutdown = true;
            let dropped = state.queue.len();
            state.queue.clear();
            state
                .requests
                .retain(|_, request| request.phase == Phase::Running);
            let ServiceState {
                active, requests, ..
            } = &mut *state;
            active.retain(|_, id| requests.contains_key(id));
            if dropped > 0 {
                debug!(dropped, "queued extractions dropped on shutdown");
            }
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("extraction worker terminated by panic");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.shared.state.lock().expect("extraction state poisoned")
    }
}

impl Drop for ExtractionService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn suppress(state: &mut ServiceState, id: RequestId, reason: Suppression) {
    if let Some(request) = state.requests.get_mut(&id) {
        request.callbacks.clear();
        // Invalidation outranks cancellation: both suppress, only it skips the cache.
        if request.suppressed != Some(Suppression::Invalidated) {
            request.suppressed = Some(reason);
        }
    }
}

/// Marks the service stopped when the worker exits, however it exits.
struct WorkerExit<'a>(&'a Shared);

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut state = match self.0.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.shutdown = true;
        state.queue.clear();
        state.requests.clear();
        state.active.clear();
    }
}

fn run_worker(shared: Arc<Shared>) {
    let _exit = WorkerExit(&shared);
    while let Some((id, path, cached)) = next_request(&shared) {
        debug!(request = id, path = %path.display(), "extraction started");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| resolve(&shared, &path, cached)))
            .unwrap_or_else(|_| {
                error!(request = id, path = %path.display(), "chunk loader panicked");
                Outcome::Failed(Arc::new(CanonicalMetadata::unknown()))
            });
        let metadata = Arc::clone(outcome.metadata());
        let counter = match &outcome {
            Outcome::CacheHit(_) => &shared.counters.cache_hits,
            Outcome::Computed(_) => &shared.counters.computed,
            Outcome::Failed(_) => &shared.counters.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let callbacks = finish_request(&shared, id, &path, outcome);
        for callback in callbacks {
            let delivered = Arc::clone(&metadata);
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&path, delivered))).is_err() {
                error!(request = id, path = %path.display(), "extraction callback panicked");
            }
        }
    }
    debug!("extraction worker stopped");
}

/// Block until a request is queued; `None` once the service shuts down.
fn next_request(
    shared: &Shared,
) -> Option<(RequestId, PathBuf, Option<ExtractionCacheEntry>)> {
    let mut state = shared.state.lock().expect("extraction state poisoned");
    loop {
        if state.shutdown {
            return None;
        }
        if let Some(id) = state.queue.pop_front() {
            let Some(request) = state.requests.get_mut(&id) else {
                continue;
            };
            request.phase = Phase::Running;
            let path = request.path.clone();
            let cached = state.cache.get(&path).cloned();
            return Some((id, path, cached));
        }
        state = shared.wake.wait(state).expect("extraction state poisoned");
    }
}

/// Reuse the cache when the modification time is unchanged, else load and normalize.
fn resolve(shared: &Shared, path: &Path, cached: Option<ExtractionCacheEntry>) -> Outcome {
    let modified = match shared.loader.modified(path) {
        Ok(modified) => modified,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "modification time unavailable");
            return Outcome::Failed(Arc::new(CanonicalMetadata::unknown()));
        }
    };
    if let Some(entry) = cached {
        if entry.modified == modified {
            return Outcome::CacheHit(entry.metadata);
        }
        debug!(path = %path.display(), "cached extraction is stale");
    }
    match shared.loader.load(path) {
        Ok(chunks) => Outcome::Computed(ExtractionCacheEntry {
            metadata: Arc::new(detect_and_normalize_with(&chunks, &shared.config)),
            modified,
        }),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "chunk loading failed");
            Outcome::Failed(Arc::new(CanonicalMetadata::unknown()))
        }
    }
}

/// Retire request `id`, update the cache and hand back the callbacks to run.
fn finish_request(
    shared: &Shared,
    id: RequestId,
    path: &Path,
    outcome: Outcome,
) -> Vec<ExtractionCallback> {
    let mut state = shared.state.lock().expect("extraction state poisoned");
    if state.active.get(path) == Some(&id) {
        state.active.remove(path);
    }
    let Some(request) = state.requests.remove(&id) else {
        return Vec::new();
    };
    if let Outcome::Computed(entry) = outcome {
        if request.suppressed != Some(Suppression::Invalidated) {
            state.cache.insert(path.to_path_buf(), entry);
        }
    }
    match request.suppressed {
        Some(reason) => {
            debug!(request = id, ?reason, "extraction delivery suppressed");
            Vec::new()
        }
        None => request.callbacks,
    }
}

/// Canonical cache key; falls back to a lexical absolute path for missing files.
pub fn cache_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
