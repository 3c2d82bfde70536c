//! Memory pressure tracking.
//!
//! `MemoryMonitor` classifies `AssetLoader::memory_in_use` against a warning
//! and a critical threshold. Entering the critical state can trigger a sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::loader::AssetLoader;

/// How the memory in use compares to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryState {
    #[default]
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryThresholds {
    pub warning_bytes: u64,
    pub critical_bytes: u64,
}

impl MemoryThresholds {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            warning_bytes: config.memory_warning_bytes,
            critical_bytes: config.memory_critical_bytes,
        }
    }

    /// A zero threshold never trips.
    pub fn classify(&self, used: u64) -> MemoryState {
        if self.critical_bytes > 0 && used >= self.critical_bytes {
            MemoryState::Critical
        } else if self.warning_bytes > 0 && used >= self.warning_bytes {
            MemoryState::Warning
        } else {
            MemoryState::Normal
        }
    }
}

pub struct MemoryMonitor {
    loader: AssetLoader,
    thresholds: MemoryThresholds,
    auto_unload: bool,
    state: watch::Sender<MemoryState>,
    used: AtomicU64,
}

impl MemoryMonitor {
    pub fn new(loader: AssetLoader, thresholds: MemoryThresholds, auto_unload: bool) -> Self {
        let (state, _) = watch::channel(MemoryState::Normal);
        Self {
            loader,
            thresholds,
            auto_unload,
            state,
            used: AtomicU64::new(0),
        }
    }

    pub fn from_config(loader: AssetLoader, config: &LoaderConfig) -> Self {
        Self::new(loader, MemoryThresholds::from_config(config), config.auto_unload)
    }

    pub fn state(&self) -> MemoryState {
        *self.state.borrow()
    }

    /// Bytes in use at the last measurement.
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn thresholds(&self) -> MemoryThresholds {
        self.thresholds
    }

    /// Sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<MemoryState> {
        self.state.subscribe()
    }

    /// Measures and reclassifies, returning (previous, current).
    fn measure(&self) -> (MemoryState, MemoryState) {
        let used = self.loader.memory_in_use();
        self.used.store(used, Ordering::Relaxed);
        let current = self.thresholds.classify(used);
        let mut previous = current;
        self.state.send_if_modified(|state| {
            previous = std::mem::replace(state, current);
            previous != current
        });
        if previous != current {
            match current {
                MemoryState::Normal => info!(used_bytes = used, "Memory back to normal"),
                MemoryState::Warning => warn!(used_bytes = used, "Memory warning"),
                MemoryState::Critical => warn!(used_bytes = used, "Memory critical"),
            }
        }
        (previous, current)
    }

    /// Measures and reclassifies without side effects.
    pub fn check(&self) -> MemoryState {
        self.measure().1
    }

    /// Measures, and sweeps unused content when the state has just become
    /// critical and auto unload is on.
    pub async fn poll(&self) -> MemoryState {
        let (previous, current) = self.measure();
        if current == MemoryState::Critical && previous != MemoryState::Critical && self.auto_unload {
            let report = self.loader.unload_unused().await;
            info!(assets = report.assets, bundles = report.bundles, "Swept under memory pressure");
        }
        current
    }

    /// Polls every `interval` until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                monitor.poll().await;
            }
            debug!("Memory monitor stopped");
        })
    }
}
