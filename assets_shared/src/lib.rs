//! `assets_shared`
//!
//! Runtime content loading for bundle-packaged assets.
//!
//! Design goals:
//! - One coordinator (`loader::AssetLoader`) owns every cache behind a single lock.
//! - Reference counts are explicit; memory is reclaimed only by an explicit sweep.
//! - Concurrent requests for the same bundle share one physical load.
//! - Transports and the host runtime are traits, picked by configuration.
//! - Preloading is optional and backs off under memory pressure.
//! - No `unsafe`.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod archive;
pub mod bundle;
pub mod config;
pub mod handle;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod preload;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::bundle::BundleHandle;
    pub use crate::config::*;
    pub use crate::handle::{Asset, AssetHandle, CachedHandle, HandleKind, RawFileHandle, SceneHandle};
    pub use crate::host::{HeadlessHost, HostRuntime, LoadSceneMode, SceneId};
    pub use crate::loader::{AssetLoader, CacheSnapshot, Instance, SweepReport};
    pub use crate::manifest::{BundleInfo, BundleManifest};
    pub use crate::preload::{MemoryMonitor, MemoryState, PreloadManager, PreloadPriority};
    pub use crate::transport::{BundleContent, Cancelled, Transport};
    pub use tokio_util::sync::CancellationToken;
}

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
