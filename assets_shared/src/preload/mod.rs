//! Background preloading.
//!
//! `PreloadManager` keeps a priority queue of paths and loads up to
//! `max_tasks` of them at a time through the loader. Each successful preload
//! holds one reference on its handle until `release` gives it back.
//!
//! Memory pressure gates the queue: nothing starts while the monitor reads
//! critical, and only `High` or `Critical` requests start under a warning.

mod memory;
mod predictor;

pub use memory::{MemoryMonitor, MemoryState, MemoryThresholds};
pub use predictor::AccessPredictor;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::loader::AssetLoader;
use crate::lock;

/// Upper bound on how long a queued request waits for a free slot to be
/// noticed when nothing wakes the scheduler.
const SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// How often a monitor started by `from_config` re-measures.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for PreloadPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => anyhow::bail!("unknown preload priority {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PreloadStats {
    pub pending: usize,
    pub active: usize,
    pub preloaded: usize,
    pub failed: u64,
}

/// Heap entry. Higher priority first, then earlier requests first.
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: PreloadPriority,
    seq: u64,
    path: String,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Request {
    seq: u64,
    cancel: CancellationToken,
    started: bool,
}

/// A path is in `requests` while queued or running. Heap entries whose
/// request was cancelled or replaced are skipped when they surface.
#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<Queued>,
    requests: HashMap<String, Request>,
    preloaded: HashSet<String>,
    active: usize,
    failed: u64,
    next_seq: u64,
}

impl QueueState {
    /// Pops the next request allowed under `memory`, marking it started.
    fn next_ready(&mut self, memory: MemoryState) -> Option<(String, u64, CancellationToken)> {
        loop {
            let (live, priority) = {
                let top = self.queue.peek()?;
                let live = self
                    .requests
                    .get(&top.path)
                    .is_some_and(|r| r.seq == top.seq && !r.started);
                (live, top.priority)
            };
            if live && memory == MemoryState::Warning && priority < PreloadPriority::High {
                return None;
            }
            let top = self.queue.pop()?;
            if !live {
                continue;
            }
            let request = self.requests.get_mut(&top.path)?;
            request.started = true;
            return Some((top.path, top.seq, request.cancel.clone()));
        }
    }
}

struct PreloadInner {
    loader: AssetLoader,
    monitor: Arc<MemoryMonitor>,
    max_tasks: usize,
    enabled: bool,
    paused: AtomicBool,
    state: Mutex<QueueState>,
    predictor: Mutex<AccessPredictor>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl PreloadInner {
    fn dispatch(self: &Arc<Self>) {
        let memory = self.monitor.state();
        if memory == MemoryState::Critical {
            return;
        }
        let mut state = lock(&self.state);
        while state.active < self.max_tasks {
            let Some((path, seq, cancel)) = state.next_ready(memory) else {
                break;
            };
            state.active += 1;
            debug!(path = %path, ?memory, "Preload started");
            tokio::spawn(Arc::clone(self).preload(path, seq, cancel));
        }
    }

    async fn preload(self: Arc<Self>, path: String, seq: u64, cancel: CancellationToken) {
        let raw = self.loader.manifest().is_some_and(|m| m.is_raw_file(&path));
        let loaded = if raw {
            self.loader.load_raw_file(&path, &cancel).await.is_some()
        } else {
            self.loader.load_asset(&path, &cancel).await.is_some()
        };

        {
            let mut state = lock(&self.state);
            state.active -= 1;
            let current = state.requests.get(&path).is_some_and(|r| r.seq == seq);
            if current {
                state.requests.remove(&path);
            }
            match (loaded, current) {
                (true, true) => {
                    debug!(path = %path, "Preloaded");
                    state.preloaded.insert(path);
                }
                (true, false) => {
                    debug!(path = %path, "Preload finished after cancel, reference returned");
                    self.loader.release(&path);
                }
                (false, true) => {
                    state.failed += 1;
                    warn!(path = %path, "Preload failed");
                }
                (false, false) => debug!(path = %path, "Preload cancelled"),
            }
        }
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        loop {
            if !self.paused.load(Ordering::Acquire) {
                self.dispatch();
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(SCHEDULER_TICK) => {}
            }
        }
        debug!("Preload scheduler stopped");
    }
}

/// Priority-ordered background loader with memory-pressure gating.
pub struct PreloadManager {
    inner: Arc<PreloadInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PreloadManager {
    fn build(loader: AssetLoader, monitor: Arc<MemoryMonitor>, max_tasks: usize, enabled: bool) -> Self {
        Self {
            inner: Arc::new(PreloadInner {
                loader,
                monitor,
                max_tasks: max_tasks.max(1),
                enabled,
                paused: AtomicBool::new(false),
                state: Mutex::new(QueueState::default()),
                predictor: Mutex::new(AccessPredictor::new()),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts the scheduler. Must be called inside a tokio runtime. The
    /// monitor is only read; polling it is the caller's job.
    pub fn spawn(loader: AssetLoader, monitor: Arc<MemoryMonitor>, max_tasks: usize) -> Self {
        let manager = Self::build(loader, monitor, max_tasks, true);
        let scheduler = tokio::spawn(Arc::clone(&manager.inner).run());
        lock(&manager.tasks).push(scheduler);
        info!(max_tasks = manager.inner.max_tasks, "Preload scheduler started");
        manager
    }

    /// A manager that accepts no requests and runs nothing.
    pub fn disabled(loader: AssetLoader, monitor: Arc<MemoryMonitor>) -> Self {
        Self::build(loader, monitor, 1, false)
    }

    /// Builds the monitor and the manager from `config`. When preloading is
    /// enabled the monitor polls every `MONITOR_INTERVAL` until shutdown.
    pub fn from_config(loader: AssetLoader, config: &LoaderConfig) -> Self {
        let monitor = Arc::new(MemoryMonitor::from_config(loader.clone(), config));
        if !config.enable_preload {
            info!("Preloading disabled");
            return Self::disabled(loader, monitor);
        }
        let manager = Self::spawn(loader, Arc::clone(&monitor), config.max_preload_tasks);
        let poller = monitor.spawn(MONITOR_INTERVAL, manager.inner.shutdown.child_token());
        lock(&manager.tasks).push(poller);
        manager
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.inner.monitor
    }

    /// Queues `path`. Returns false when preloading is off or shut down, or
    /// when the path is already queued, running or preloaded.
    pub fn request(&self, path: &str, priority: PreloadPriority) -> bool {
        if !self.inner.enabled || self.inner.shutdown.is_cancelled() || path.is_empty() {
            return false;
        }
        {
            let mut state = lock(&self.inner.state);
            if state.requests.contains_key(path) {
                return false;
            }
            if state.preloaded.contains(path) {
                let live = self.inner.loader.handle(path).is_some_and(|h| h.is_live());
                if live {
                    return false;
                }
                state.preloaded.remove(path);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.requests.insert(
                path.to_string(),
                Request {
                    seq,
                    cancel: self.inner.shutdown.child_token(),
                    started: false,
                },
            );
            state.queue.push(Queued {
                priority,
                seq,
                path: path.to_string(),
            });
        }
        self.inner.wake.notify_one();
        true
    }

    /// Queues every path, returning how many were accepted.
    pub fn request_many<S: AsRef<str>>(&self, paths: &[S], priority: PreloadPriority) -> usize {
        paths
            .iter()
            .filter(|p| self.request(p.as_ref(), priority))
            .count()
    }

    /// Drops a queued request or cancels a running one.
    pub fn cancel(&self, path: &str) -> bool {
        let removed = lock(&self.inner.state).requests.remove(path);
        match removed {
            Some(request) => {
                request.cancel.cancel();
                debug!(path = %path, "Preload cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every queued and running request. Preloaded content stays.
    pub fn cancel_all(&self) -> usize {
        let mut state = lock(&self.inner.state);
        let count = state.requests.len();
        for (_, request) in state.requests.drain() {
            request.cancel.cancel();
        }
        state.queue.clear();
        if count > 0 {
            info!(count, "Cancelled all preloads");
        }
        count
    }

    /// Stops starting new preloads. Running ones finish.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn is_preloaded(&self, path: &str) -> bool {
        lock(&self.inner.state).preloaded.contains(path)
    }

    pub fn stats(&self) -> PreloadStats {
        let state = lock(&self.inner.state);
        PreloadStats {
            pending: state.requests.values().filter(|r| !r.started).count(),
            active: state.active,
            preloaded: state.preloaded.len(),
            failed: state.failed,
        }
    }

    /// Gives back the reference a finished preload of `path` holds.
    pub fn release(&self, path: &str) -> bool {
        let removed = lock(&self.inner.state).preloaded.remove(path);
        if removed {
            self.inner.loader.release(path);
        }
        removed
    }

    pub fn release_all(&self) -> usize {
        let paths: Vec<String> = lock(&self.inner.state).preloaded.drain().collect();
        for path in &paths {
            self.inner.loader.release(path);
        }
        paths.len()
    }

    pub fn record_access(&self, path: &str) {
        lock(&self.inner.predictor).record(path);
    }

    pub fn predicted(&self, current: &str, max: usize) -> Vec<String> {
        lock(&self.inner.predictor).predict(current, max)
    }

    /// Queues the likely successors of `current` that the manifest knows.
    pub fn preload_predicted(&self, current: &str, max: usize, priority: PreloadPriority) -> usize {
        let Some(manifest) = self.inner.loader.manifest() else {
            return 0;
        };
        let known: Vec<String> = self
            .predicted(current, max)
            .into_iter()
            .filter(|p| manifest.contains_asset(p))
            .collect();
        self.request_many(&known, priority)
    }

    /// Cancels everything and stops the scheduler and any monitor it
    /// started. Preloaded references are kept; use `release_all` first to
    /// give them back.
    pub async fn shutdown(&self) {
        self.cancel_all();
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Preload task ended abnormally");
            }
        }
        info!("Preload manager shut down");
    }
}

impl Drop for PreloadManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(priority: PreloadPriority, seq: u64) -> Queued {
        Queued {
            priority,
            seq,
            path: format!("p{seq}"),
        }
    }

    #[test]
    fn queue_orders_by_priority_then_arrival() {
        let mut heap = BinaryHeap::new();
        heap.push(queued(PreloadPriority::Low, 0));
        heap.push(queued(PreloadPriority::Normal, 1));
        heap.push(queued(PreloadPriority::Critical, 2));
        heap.push(queued(PreloadPriority::Normal, 3));
        heap.push(queued(PreloadPriority::High, 4));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|q| q.seq)).collect();
        assert_eq!(order, vec![2, 4, 1, 3, 0]);
    }

    fn state_with(entries: &[(PreloadPriority, &str)]) -> QueueState {
        let mut state = QueueState::default();
        for (priority, path) in entries {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.requests.insert(
                path.to_string(),
                Request {
                    seq,
                    cancel: CancellationToken::new(),
                    started: false,
                },
            );
            state.queue.push(Queued {
                priority: *priority,
                seq,
                path: path.to_string(),
            });
        }
        state
    }

    #[test]
    fn warning_admits_only_high_and_above() {
        let mut state = state_with(&[(PreloadPriority::Normal, "n"), (PreloadPriority::High, "h")]);

        let (path, _, _) = state.next_ready(MemoryState::Warning).expect("high");
        assert_eq!(path, "h");
        assert!(state.next_ready(MemoryState::Warning).is_none());
        assert_eq!(state.queue.len(), 1);

        let (path, _, _) = state.next_ready(MemoryState::Normal).expect("normal");
        assert_eq!(path, "n");
        assert!(state.requests["n"].started);
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut state = state_with(&[(PreloadPriority::Critical, "gone"), (PreloadPriority::High, "kept")]);
        state.requests.remove("gone");

        let (path, _, _) = state.next_ready(MemoryState::Warning).expect("kept");
        assert_eq!(path, "kept");
        assert!(state.queue.is_empty());
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<PreloadPriority>().unwrap(), PreloadPriority::High);
        assert_eq!("low".parse::<PreloadPriority>().unwrap(), PreloadPriority::Low);
        assert!("urgent".parse::<PreloadPriority>().is_err());
    }
}
