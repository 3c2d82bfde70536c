//! Reference-counted handles for loaded content.
//!
//! - `HandleCore` carries identity, the reference count and load statistics.
//! - `AssetHandle`, `SceneHandle` and `RawFileHandle` add the loaded payload.
//! - `CachedHandle` is what the loader stores per asset path.
//!
//! A count never goes below zero and disposal happens once. Reaching zero does
//! not free anything; the loader's sweep does.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::host::{OpenedScene, SceneId};
use crate::lock;

/// A loaded host object. Downcast with `AssetHandle::get`.
pub type Asset = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
struct LoadStats {
    file_size_bytes: u64,
    last_load_time_ms: f64,
    total_load_time_ms: f64,
    loaded_at: Option<DateTime<Utc>>,
}

/// Shared state of every handle.
#[derive(Debug)]
pub struct HandleCore {
    path: String,
    bundle_name: String,
    ref_count: AtomicUsize,
    disposed: AtomicBool,
    stats: Mutex<LoadStats>,
}

impl HandleCore {
    pub fn new(path: impl Into<String>, bundle_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bundle_name: bundle_name.into(),
            ref_count: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            stats: Mutex::new(LoadStats::default()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Owning bundle. Empty in bypass mode.
    pub fn bundle_name(&self) -> &str {
        &self.bundle_name
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Adds one reference and returns the new count. No-op once disposed.
    pub fn retain(&self) -> usize {
        if self.is_disposed() {
            warn!(path = %self.path, "Retain on disposed handle ignored");
            return self.ref_count();
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference and returns the new count, floored at zero.
    pub fn release(&self) -> usize {
        if self.is_disposed() {
            return self.ref_count();
        }
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => {
                warn!(path = %self.path, "Release below zero ignored");
                0
            }
        }
    }

    /// Sets the count to zero and returns what it was.
    pub(crate) fn drain(&self) -> usize {
        self.ref_count.swap(0, Ordering::AcqRel)
    }

    /// Marks the handle disposed. True only for the first call.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Records one completed load.
    pub fn set_load_info(&self, file_size_bytes: u64, load_time_ms: f64) {
        let mut stats = lock(&self.stats);
        stats.file_size_bytes = file_size_bytes;
        stats.last_load_time_ms = load_time_ms;
        stats.total_load_time_ms += load_time_ms;
        stats.loaded_at = Some(Utc::now());
    }

    pub fn file_size_bytes(&self) -> u64 {
        lock(&self.stats).file_size_bytes
    }

    pub fn last_load_time_ms(&self) -> f64 {
        lock(&self.stats).last_load_time_ms
    }

    pub fn total_load_time_ms(&self) -> f64 {
        lock(&self.stats).total_load_time_ms
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.stats).loaded_at
    }
}

/// A loaded asset object.
#[derive(Debug)]
pub struct AssetHandle {
    core: HandleCore,
    asset: Mutex<Option<Asset>>,
}

impl AssetHandle {
    pub fn new(path: impl Into<String>, bundle_name: impl Into<String>, asset: Asset) -> Self {
        Self {
            core: HandleCore::new(path, bundle_name),
            asset: Mutex::new(Some(asset)),
        }
    }

    pub fn core(&self) -> &HandleCore {
        &self.core
    }

    pub fn path(&self) -> &str {
        self.core.path()
    }

    pub fn ref_count(&self) -> usize {
        self.core.ref_count()
    }

    pub fn asset(&self) -> Option<Asset> {
        lock(&self.asset).clone()
    }

    /// The asset as a concrete type, if it is one.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.asset().and_then(|a| a.downcast::<T>().ok())
    }

    pub fn is_valid(&self) -> bool {
        !self.core.is_disposed() && lock(&self.asset).is_some()
    }

    /// Whether this handle holds exactly `asset`.
    pub fn holds(&self, asset: &Asset) -> bool {
        lock(&self.asset)
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(held, asset))
    }

    /// Drops the payload. Idempotent.
    pub fn dispose(&self) {
        if self.core.mark_disposed() {
            lock(&self.asset).take();
        }
    }
}

/// Raw bytes of a raw-file bundle.
#[derive(Debug)]
pub struct RawFileHandle {
    core: HandleCore,
    data: Mutex<Option<Bytes>>,
}

impl RawFileHandle {
    pub fn new(path: impl Into<String>, bundle_name: impl Into<String>, data: Bytes) -> Self {
        Self {
            core: HandleCore::new(path, bundle_name),
            data: Mutex::new(Some(data)),
        }
    }

    pub fn core(&self) -> &HandleCore {
        &self.core
    }

    pub fn data(&self) -> Option<Bytes> {
        lock(&self.data).clone()
    }

    /// The bytes decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> Option<String> {
        self.data()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    pub fn is_valid(&self) -> bool {
        !self.core.is_disposed() && lock(&self.data).is_some()
    }

    pub fn dispose(&self) {
        if self.core.mark_disposed() {
            lock(&self.data).take();
        }
    }
}

#[derive(Debug, Default)]
struct SceneState {
    scene: Option<SceneId>,
    activated: bool,
    done: bool,
    error: Option<Arc<anyhow::Error>>,
}

/// An opened scene, or the error that prevented opening it.
#[derive(Debug)]
pub struct SceneHandle {
    core: HandleCore,
    progress: AtomicU32,
    state: Mutex<SceneState>,
}

impl SceneHandle {
    pub fn new(path: impl Into<String>, bundle_name: impl Into<String>) -> Self {
        Self {
            core: HandleCore::new(path, bundle_name),
            progress: AtomicU32::new(0f32.to_bits()),
            state: Mutex::new(SceneState::default()),
        }
    }

    /// A finished handle carrying `error`. Never cached.
    pub fn failed(path: impl Into<String>, error: anyhow::Error) -> Self {
        let handle = Self::new(path, "");
        handle.set_error(error);
        handle
    }

    pub fn core(&self) -> &HandleCore {
        &self.core
    }

    pub fn path(&self) -> &str {
        self.core.path()
    }

    pub fn ref_count(&self) -> usize {
        self.core.ref_count()
    }

    /// Load progress in `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Acquire))
    }

    pub(crate) fn set_progress(&self, progress: f32) {
        self.progress
            .store(progress.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).done
    }

    pub fn is_activated(&self) -> bool {
        lock(&self.state).activated
    }

    pub fn scene_id(&self) -> Option<SceneId> {
        lock(&self.state).scene
    }

    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        lock(&self.state).error.clone()
    }

    pub fn has_error(&self) -> bool {
        lock(&self.state).error.is_some()
    }

    pub fn is_valid(&self) -> bool {
        let state = lock(&self.state);
        !self.core.is_disposed() && state.scene.is_some() && state.error.is_none()
    }

    pub(crate) fn set_opened(&self, opened: &OpenedScene) {
        let mut state = lock(&self.state);
        state.scene = Some(opened.id);
        state.activated = opened.activated;
        state.done = true;
        drop(state);
        self.set_progress(1.0);
    }

    pub(crate) fn set_error(&self, error: anyhow::Error) {
        let mut state = lock(&self.state);
        state.error = Some(Arc::new(error));
        state.done = true;
    }

    pub(crate) fn mark_activated(&self) {
        lock(&self.state).activated = true;
    }

    /// The host closed the scene on its own. The handle turns invalid and
    /// the sweep will not close it again.
    pub(crate) fn mark_replaced(&self) -> bool {
        let mut state = lock(&self.state);
        state.activated = false;
        state.scene.take().is_some()
    }

    /// Marks the handle disposed and hands back the scene for the host to close.
    pub fn dispose(&self) -> Option<SceneId> {
        if !self.core.mark_disposed() {
            return None;
        }
        let mut state = lock(&self.state);
        state.activated = false;
        state.scene.take()
    }
}

/// What kind of content a cached handle holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Asset,
    Scene,
    RawFile,
}

/// One entry of the loader's asset cache.
#[derive(Debug, Clone)]
pub enum CachedHandle {
    Asset(Arc<AssetHandle>),
    Scene(Arc<SceneHandle>),
    RawFile(Arc<RawFileHandle>),
}

impl CachedHandle {
    pub fn core(&self) -> &HandleCore {
        match self {
            CachedHandle::Asset(h) => h.core(),
            CachedHandle::Scene(h) => h.core(),
            CachedHandle::RawFile(h) => h.core(),
        }
    }

    pub fn kind(&self) -> HandleKind {
        match self {
            CachedHandle::Asset(_) => HandleKind::Asset,
            CachedHandle::Scene(_) => HandleKind::Scene,
            CachedHandle::RawFile(_) => HandleKind::RawFile,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            CachedHandle::Asset(h) => h.is_valid(),
            CachedHandle::Scene(h) => h.is_valid(),
            CachedHandle::RawFile(h) => h.is_valid(),
        }
    }

    /// Valid and still referenced.
    pub fn is_live(&self) -> bool {
        self.core().ref_count() > 0 && !self.core().is_disposed() && self.is_valid()
    }

    /// Disposes the handle, returning an opened scene that must be closed.
    pub fn dispose(&self) -> Option<SceneId> {
        match self {
            CachedHandle::Asset(h) => {
                h.dispose();
                None
            }
            CachedHandle::Scene(h) => h.dispose(),
            CachedHandle::RawFile(h) => {
                h.dispose();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Reference counting
    // ========================================================================

    #[test]
    fn release_floors_at_zero() {
        let core = HandleCore::new("ui/icon.png", "ui.bundle");
        assert_eq!(core.retain(), 1);
        assert_eq!(core.retain(), 2);
        assert_eq!(core.release(), 1);
        assert_eq!(core.release(), 0);
        assert_eq!(core.release(), 0);
        assert_eq!(core.ref_count(), 0);
    }

    #[test]
    fn disposed_handle_ignores_retain_and_release() {
        let handle = AssetHandle::new("a", "b", Arc::new(1u32));
        handle.core().retain();
        handle.dispose();
        handle.dispose();
        assert_eq!(handle.core().retain(), 1);
        assert_eq!(handle.core().release(), 1);
        assert!(!handle.is_valid());
        assert!(handle.asset().is_none());
    }

    #[test]
    fn drain_returns_previous_count() {
        let core = HandleCore::new("a", "b");
        core.retain();
        core.retain();
        assert_eq!(core.drain(), 2);
        assert_eq!(core.ref_count(), 0);
    }

    // ========================================================================
    // Payloads
    // ========================================================================

    #[test]
    fn asset_downcasts_to_concrete_type() {
        let handle = AssetHandle::new("cfg/level.json", "cfg", Arc::new(String::from("lvl")));
        assert_eq!(handle.get::<String>().as_deref().map(String::as_str), Some("lvl"));
        assert!(handle.get::<u32>().is_none());

        let asset = handle.asset().unwrap();
        assert!(handle.holds(&asset));
        let other: Asset = Arc::new(String::from("lvl"));
        assert!(!handle.holds(&other));
    }

    #[test]
    fn raw_text_is_lossy() {
        let handle = RawFileHandle::new("t.txt", "t", Bytes::from_static(b"ok \xff"));
        assert_eq!(handle.text().unwrap(), "ok \u{fffd}");
        handle.dispose();
        assert!(handle.text().is_none());
    }

    #[test]
    fn scene_dispose_returns_scene_once() {
        let handle = SceneHandle::new("levels/a.scene", "levels");
        assert!(!handle.is_valid());
        handle.set_progress(3.0);
        assert_eq!(handle.progress(), 1.0);
        handle.set_opened(&OpenedScene {
            id: SceneId(7),
            activated: false,
            replaced: Vec::new(),
        });
        assert!(handle.is_valid() && handle.is_done());
        assert_eq!(handle.dispose(), Some(SceneId(7)));
        assert_eq!(handle.dispose(), None);
        assert!(!handle.is_valid());
    }

    #[test]
    fn replaced_scene_is_invalid_and_not_closed_again() {
        let handle = SceneHandle::new("levels/a.scene", "levels");
        handle.set_opened(&OpenedScene {
            id: SceneId(3),
            activated: true,
            replaced: Vec::new(),
        });
        assert!(handle.mark_replaced());
        assert!(!handle.mark_replaced());
        assert!(!handle.is_valid() && !handle.is_activated());
        assert_eq!(handle.dispose(), None);
    }

    #[test]
    fn failed_scene_carries_error() {
        let handle = SceneHandle::failed("levels/x.scene", anyhow::anyhow!("missing"));
        assert!(handle.is_done() && handle.has_error());
        assert!(!handle.is_valid());
        assert_eq!(handle.error().unwrap().to_string(), "missing");
    }
}
