//! Asset loader.
//!
//! `AssetLoader` is the single coordinator for runtime content:
//! - resolves asset paths to bundles through the manifest
//! - loads each bundle once, dependencies first, sharing in-flight loads
//! - tracks asset, scene and raw-file handles by path with reference counts
//! - frees memory only on an explicit sweep (`unload_unused`) or forced teardown
//!
//! Locking: the three caches (handles, bundles, in-flight loads) live in
//! `LoaderState` behind one mutex. It is never held across an await, and
//! every bundle count change happens under it.
//!
//! Failures are logged and surface as `None` (scene loads carry the error in
//! the returned handle). Cancellation only abandons the caller's own wait.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
    },
    time::Instant,
};

use anyhow::{bail, Context};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bundle::BundleHandle,
    config::{LoaderConfig, PlayMode},
    handle::{Asset, AssetHandle, CachedHandle, HandleKind, RawFileHandle, SceneHandle},
    host::{scene_name, HostRuntime, LoadSceneMode, SceneId, SceneRequest},
    manifest::BundleManifest,
    transport::{self, is_cancelled, BundleContent, Cancelled, Transport},
};

// ============================================================================
// Shared state
// ============================================================================

/// How a bundle load counts against the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    /// An asset, scene or raw-file request.
    Direct,
    /// Another bundle's dependency.
    Dependency,
}

#[derive(Clone)]
enum LoadState {
    Pending,
    Done(Option<Arc<BundleHandle>>),
}

impl LoadState {
    fn is_done(&self) -> bool {
        matches!(self, LoadState::Done(_))
    }

    fn bundle(&self) -> Option<Arc<BundleHandle>> {
        match self {
            LoadState::Done(bundle) => bundle.clone(),
            LoadState::Pending => None,
        }
    }
}

struct Waiter {
    acquire: Acquire,
    /// Set when the acquisition was applied at publication.
    applied: Arc<AtomicBool>,
}

/// One bundle load shared by every caller that asked while it ran.
struct InFlight {
    load_id: u64,
    result: watch::Receiver<LoadState>,
    waiters: HashMap<u64, Waiter>,
}

#[derive(Default)]
struct LoaderState {
    handles: HashMap<String, CachedHandle>,
    bundles: HashMap<String, Arc<BundleHandle>>,
    in_flight: HashMap<String, InFlight>,
    /// Direct acquisitions not yet turned into a tracked handle, per bundle.
    pending_direct: HashMap<String, usize>,
    next_id: u64,
}

impl LoaderState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn acquire(&mut self, bundle: &Arc<BundleHandle>, acquire: Acquire) {
        match acquire {
            Acquire::Dependency => Self::retain_bundle(bundle),
            Acquire::Direct => {
                Self::hold_direct(bundle);
                *self.pending_direct.entry(bundle.name().to_string()).or_default() += 1;
            }
        }
    }

    /// Promotes a bundle to directly held. One reference covers every handle.
    fn hold_direct(bundle: &Arc<BundleHandle>) {
        if bundle.is_dependency_only() {
            bundle.set_dependency_only(false);
            Self::retain_bundle(bundle);
        }
    }

    fn retain_bundle(bundle: &Arc<BundleHandle>) {
        if bundle.is_disposed() {
            return;
        }
        bundle.retain();
        if !bundle.holds_dependencies() {
            bundle.set_holds_dependencies(true);
            for dep in bundle.dependencies() {
                Self::retain_bundle(&dep);
            }
        }
    }

    fn release_bundle(bundle: &Arc<BundleHandle>, force: bool) {
        if force {
            bundle.drain();
        } else {
            bundle.release();
        }
        if bundle.ref_count() == 0 {
            bundle.set_dependency_only(true);
            Self::release_dependencies(bundle);
        }
    }

    /// Gives back the references a bundle holds on its dependencies, once.
    fn release_dependencies(bundle: &Arc<BundleHandle>) {
        if bundle.holds_dependencies() {
            bundle.set_holds_dependencies(false);
            for dep in bundle.dependencies() {
                Self::release_bundle(&dep, false);
            }
        }
    }

    fn has_live_handles(&self, bundle_name: &str) -> bool {
        self.pending_direct.get(bundle_name).is_some_and(|n| *n > 0)
            || self
                .handles
                .values()
                .any(|h| h.core().bundle_name() == bundle_name && h.is_live())
    }

    fn drop_direct_hold_if_orphaned(&self, bundle_name: &str) {
        if bundle_name.is_empty() {
            return;
        }
        let Some(bundle) = self.bundles.get(bundle_name).cloned() else {
            return;
        };
        if bundle.is_dependency_only() || self.has_live_handles(bundle_name) {
            return;
        }
        bundle.set_dependency_only(true);
        Self::release_bundle(&bundle, false);
        debug!(bundle = %bundle_name, ref_count = bundle.ref_count(), "Dropped direct bundle hold");
    }

    /// Ends a pending direct acquisition, dropping the hold if nothing took it over.
    fn finish_direct(&mut self, bundle_name: &str, tracked: bool) {
        if let Some(n) = self.pending_direct.get_mut(bundle_name) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.pending_direct.remove(bundle_name);
            }
        }
        if !tracked {
            self.drop_direct_hold_if_orphaned(bundle_name);
        }
    }

    fn take_waiters(&mut self, name: &str, load_id: u64) -> HashMap<u64, Waiter> {
        match self.in_flight.get(name) {
            Some(entry) if entry.load_id == load_id => self
                .in_flight
                .remove(name)
                .map(|e| e.waiters)
                .unwrap_or_default(),
            _ => HashMap::new(),
        }
    }

    /// Cache hit: retain the handle and make sure its bundle is held.
    fn retain_cached(&self, path: &str, kind: HandleKind) -> Option<CachedHandle> {
        let handle = self.handles.get(path)?.clone();
        if handle.kind() != kind || !handle.is_valid() {
            return None;
        }
        let bundle_name = handle.core().bundle_name();
        if bundle_name.is_empty() {
            handle.core().retain();
            return Some(handle);
        }
        let bundle = self.bundles.get(bundle_name).filter(|b| b.is_valid())?.clone();
        handle.core().retain();
        Self::hold_direct(&bundle);
        Some(handle)
    }

    /// Retains the valid handle at `path`, or caches the one `make` builds.
    fn track(
        &mut self,
        path: &str,
        bundle_name: &str,
        kind: HandleKind,
        make: impl FnOnce() -> CachedHandle,
    ) -> anyhow::Result<CachedHandle> {
        let bundle = if bundle_name.is_empty() {
            None
        } else {
            let bundle = self
                .bundles
                .get(bundle_name)
                .filter(|b| b.is_valid())
                .cloned()
                .with_context(|| format!("bundle {bundle_name} was unloaded while loading {path}"))?;
            Some(bundle)
        };

        let handle = match self.handles.get(path) {
            Some(existing) if existing.is_valid() => {
                if existing.kind() != kind {
                    bail!("{path} is already loaded as {:?}", existing.kind());
                }
                existing.clone()
            }
            _ => {
                let handle = make();
                self.handles.insert(path.to_string(), handle.clone());
                handle
            }
        };
        handle.core().retain();
        if let Some(bundle) = &bundle {
            Self::hold_direct(bundle);
        }
        Ok(handle)
    }

    /// Drops one reference (or all of them) on `path`. False if unknown.
    fn release_handle(&mut self, path: &str, force: bool) -> bool {
        let Some(handle) = self.handles.get(path).cloned() else {
            return false;
        };
        let core = handle.core();
        if force {
            core.drain();
        } else {
            core.release();
        }
        if !handle.is_live() {
            self.drop_direct_hold_if_orphaned(core.bundle_name());
        }
        true
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Unregisters a waiter whose wait was abandoned, or undoes its acquisition
/// if the load had already been published.
struct WaiterGuard {
    inner: Arc<LoaderInner>,
    bundle: String,
    id: u64,
    acquire: Acquire,
    applied: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state();
        if let Some(entry) = state.in_flight.get_mut(&self.bundle) {
            if entry.waiters.remove(&self.id).is_some() {
                return;
            }
        }
        if !self.applied.load(Ordering::Acquire) {
            return;
        }
        match self.acquire {
            Acquire::Direct => state.finish_direct(&self.bundle, false),
            Acquire::Dependency => {
                if let Some(bundle) = state.bundles.get(&self.bundle).cloned() {
                    LoaderState::release_bundle(&bundle, false);
                }
            }
        }
    }
}

/// A direct acquisition between `load_bundle` and handle tracking.
struct DirectHold {
    inner: Arc<LoaderInner>,
    bundle: String,
    armed: bool,
}

impl DirectHold {
    /// Ends the acquisition while the caller holds the state lock.
    fn settle(mut self, state: &mut LoaderState, tracked: bool) {
        self.armed = false;
        state.finish_direct(&self.bundle, tracked);
    }
}

impl Drop for DirectHold {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state().finish_direct(&self.bundle, false);
        }
    }
}

/// Removes an in-flight entry if its load task dies before publishing.
struct InFlightCleanup {
    inner: Arc<LoaderInner>,
    bundle: String,
    load_id: u64,
    armed: bool,
}

impl Drop for InFlightCleanup {
    fn drop(&mut self) {
        if self.armed {
            warn!(bundle = %self.bundle, "Bundle load task ended without publishing");
            let mut state = self.inner.state();
            state.take_waiters(&self.bundle, self.load_id);
        }
    }
}

// ============================================================================
// Coordinator internals
// ============================================================================

type BundleFuture = Pin<Box<dyn Future<Output = Option<Arc<BundleHandle>>> + Send>>;

enum Payload {
    Asset(Asset),
    Raw(Bytes),
}

/// Content a request reads from, plus the direct hold it took on the bundle.
struct Source {
    bundle_name: String,
    content: Arc<dyn BundleContent>,
    file_size: u64,
    hold: Option<DirectHold>,
}

struct LoaderInner {
    transport: Arc<dyn Transport>,
    host: Arc<dyn HostRuntime>,
    manifest: RwLock<Option<Arc<BundleManifest>>>,
    state: Mutex<LoaderState>,
    detail_log: AtomicBool,
}

fn report(what: &str, path: &str, err: &anyhow::Error) {
    if is_cancelled(err) {
        debug!(path = %path, "{what} cancelled");
    } else {
        error!(path = %path, error = %format!("{err:#}"), "{what} failed");
    }
}

async fn extract(
    content: &dyn BundleContent,
    path: &str,
    kind: HandleKind,
) -> anyhow::Result<Option<Payload>> {
    Ok(match kind {
        HandleKind::RawFile => content.read_raw(path).await?.map(Payload::Raw),
        HandleKind::Asset | HandleKind::Scene => content.load_asset(path).await?.map(Payload::Asset),
    })
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

impl LoaderInner {
    fn state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn manifest(&self) -> anyhow::Result<Arc<BundleManifest>> {
        self.manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("loader is not initialized")
    }

    fn log_loaded(&self, what: &str, path: &str, bundle: &str, ms: f64) {
        if self.detail_log.load(Ordering::Relaxed) {
            info!(path = %path, bundle = %bundle, elapsed_ms = ms, "Loaded {what}");
        } else {
            debug!(path = %path, bundle = %bundle, elapsed_ms = ms, "Loaded {what}");
        }
    }

    /// Loads `name` once and applies `acquire` to it, sharing any load
    /// already running. `chain` is the dependency path that led here.
    fn load_bundle(
        self: &Arc<Self>,
        name: String,
        acquire: Acquire,
        chain: Vec<String>,
        cancel: CancellationToken,
    ) -> BundleFuture {
        let inner = Arc::clone(self);
        Box::pin(async move {
            if chain.contains(&name) {
                error!(bundle = %name, chain = %format!("{} -> {name}", chain.join(" -> ")), "Bundle dependency cycle");
                return None;
            }

            let (mut result, id, applied, spawn) = {
                let mut state = inner.state();
                if let Some(cached) = state.bundles.get(&name).cloned() {
                    if cached.is_valid() {
                        state.acquire(&cached, acquire);
                        return Some(cached);
                    }
                    state.bundles.remove(&name);
                }

                let id = state.next_id();
                let applied = Arc::new(AtomicBool::new(false));
                let waiter = Waiter {
                    acquire,
                    applied: Arc::clone(&applied),
                };
                if let Some(entry) = state.in_flight.get_mut(&name) {
                    entry.waiters.insert(id, waiter);
                    (entry.result.clone(), id, applied, None)
                } else {
                    let load_id = state.next_id();
                    let (tx, rx) = watch::channel(LoadState::Pending);
                    state.in_flight.insert(
                        name.clone(),
                        InFlight {
                            load_id,
                            result: rx.clone(),
                            waiters: HashMap::from([(id, waiter)]),
                        },
                    );
                    (rx, id, applied, Some((tx, load_id)))
                }
            };

            if let Some((tx, load_id)) = spawn {
                let mut dep_chain = chain;
                dep_chain.push(name.clone());
                tokio::spawn(Arc::clone(&inner).run_bundle_load(name.clone(), load_id, dep_chain, tx));
            }

            let mut guard = WaiterGuard {
                inner: Arc::clone(&inner),
                bundle: name.clone(),
                id,
                acquire,
                applied,
                armed: true,
            };
            let wait = async { result.wait_for(LoadState::is_done).await.map(|s| s.bundle()) };
            let outcome = tokio::select! {
                outcome = wait => outcome,
                _ = cancel.cancelled() => {
                    debug!(bundle = %name, "Bundle wait cancelled");
                    return None;
                }
            };
            guard.armed = false;
            match outcome {
                Ok(bundle) => bundle,
                Err(_) => {
                    warn!(bundle = %name, "Bundle load dropped its result");
                    None
                }
            }
        })
    }

    /// The shared task behind one in-flight entry. Publishes the bundle and
    /// applies every registered waiter's acquisition under one lock.
    async fn run_bundle_load(
        self: Arc<Self>,
        name: String,
        load_id: u64,
        chain: Vec<String>,
        tx: watch::Sender<LoadState>,
    ) {
        let mut cleanup = InFlightCleanup {
            inner: Arc::clone(&self),
            bundle: name.clone(),
            load_id,
            armed: true,
        };
        let outcome = self.build_bundle(&name, chain).await;
        {
            let mut state = self.state();
            let waiters = state.take_waiters(&name, load_id);
            if let Some(bundle) = &outcome {
                state.bundles.insert(name.clone(), Arc::clone(bundle));
                for waiter in waiters.into_values() {
                    state.acquire(bundle, waiter.acquire);
                    waiter.applied.store(true, Ordering::Release);
                }
                if bundle.ref_count() == 0 {
                    LoaderState::release_dependencies(bundle);
                }
            }
            tx.send_replace(LoadState::Done(outcome));
        }
        cleanup.armed = false;
    }

    /// Loads dependencies, fetches content and builds the handle. Each
    /// dependency comes back holding one reference for the new bundle.
    async fn build_bundle(self: &Arc<Self>, name: &str, chain: Vec<String>) -> Option<Arc<BundleHandle>> {
        let info = match self.manifest().and_then(|m| {
            m.bundle_info(name)
                .cloned()
                .with_context(|| format!("bundle {name} is not in the manifest"))
        }) {
            Ok(info) => info,
            Err(err) => {
                error!(bundle = %name, error = %format!("{err:#}"), "Bundle load failed");
                return None;
            }
        };

        let started = Instant::now();
        // The shared load outlives any single caller, so nothing cancels it.
        let detached = CancellationToken::new();
        let mut seen = HashSet::new();
        let mut deps: Vec<Arc<BundleHandle>> = Vec::with_capacity(info.dependencies.len());
        for dep in &info.dependencies {
            if !seen.insert(dep.as_str()) {
                continue;
            }
            let loaded = self
                .load_bundle(dep.clone(), Acquire::Dependency, chain.clone(), detached.clone())
                .await;
            match loaded {
                Some(handle) => deps.push(handle),
                None => {
                    error!(bundle = %name, dependency = %dep, "Dependency failed to load");
                    self.release_dependency_refs(&deps);
                    return None;
                }
            }
        }

        let content = match self.transport.fetch_bundle(&info, &detached).await {
            Ok(content) => content,
            Err(err) => {
                error!(bundle = %name, transport = self.transport.name(), error = %format!("{err:#}"), "Bundle fetch failed");
                self.release_dependency_refs(&deps);
                return None;
            }
        };

        let ms = elapsed_ms(started);
        let bundle = Arc::new(BundleHandle::new(&info.name, content, info.size, ms));
        for dep in deps {
            bundle.add_dependency(dep);
        }
        self.log_loaded("bundle", name, name, ms);
        Some(bundle)
    }

    fn release_dependency_refs(&self, deps: &[Arc<BundleHandle>]) {
        let _state = self.state();
        for dep in deps {
            LoaderState::release_bundle(dep, false);
        }
    }

    /// Resolves `path` to readable content. Outside bypass mode this loads
    /// the owning bundle and takes a direct hold on it.
    async fn open_source(
        self: &Arc<Self>,
        path: &str,
        require_raw: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Source> {
        if let Some(content) = self.transport.direct_source() {
            return Ok(Source {
                bundle_name: String::new(),
                content,
                file_size: 0,
                hold: None,
            });
        }

        let manifest = self.manifest()?;
        let info = manifest
            .bundle_by_asset(path)
            .with_context(|| format!("{path} is not in the manifest"))?;
        if require_raw && !info.is_raw_file {
            bail!("{path} is not a raw file (bundle {})", info.name);
        }
        let bundle_name = info.name.clone();
        let file_size = info.size;

        let loaded = self
            .load_bundle(bundle_name.clone(), Acquire::Direct, Vec::new(), cancel.clone())
            .await;
        let Some(bundle) = loaded else {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            bail!("bundle {bundle_name} failed to load");
        };
        let hold = DirectHold {
            inner: Arc::clone(self),
            bundle: bundle_name.clone(),
            armed: true,
        };
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let content = bundle
            .content()
            .with_context(|| format!("bundle {bundle_name} was unloaded"))?;
        Ok(Source {
            bundle_name,
            content,
            file_size,
            hold: Some(hold),
        })
    }

    /// Caches `make`'s handle (or retains the existing one) and settles the
    /// source's direct hold, all under one lock.
    fn track_source(
        &self,
        path: &str,
        source: &mut Source,
        kind: HandleKind,
        make: impl FnOnce() -> CachedHandle,
    ) -> anyhow::Result<CachedHandle> {
        let mut state = self.state();
        let tracked = state.track(path, &source.bundle_name, kind, make);
        if let Some(hold) = source.hold.take() {
            hold.settle(&mut state, tracked.is_ok());
        }
        tracked
    }

    async fn load_payload(
        self: &Arc<Self>,
        path: &str,
        kind: HandleKind,
        cancel: &CancellationToken,
    ) -> anyhow::Result<CachedHandle> {
        if path.is_empty() {
            bail!("empty asset path");
        }
        let hit = self.state().retain_cached(path, kind);
        if let Some(handle) = hit {
            debug!(path = %path, ref_count = handle.core().ref_count(), "Cache hit");
            return Ok(handle);
        }

        let started = Instant::now();
        let mut source = self.open_source(path, kind == HandleKind::RawFile, cancel).await?;
        let content = Arc::clone(&source.content);
        let payload = tokio::select! {
            payload = extract(content.as_ref(), path, kind) => payload?,
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        };
        let payload = payload.with_context(|| {
            format!("{path} not found in bundle {}", source.bundle_name)
        })?;

        let ms = elapsed_ms(started);
        let file_size = source.file_size;
        let bundle_name = source.bundle_name.clone();
        let handle = self.track_source(path, &mut source, kind, || {
            let handle = match payload {
                Payload::Asset(asset) => CachedHandle::Asset(Arc::new(AssetHandle::new(path, &bundle_name, asset))),
                Payload::Raw(data) => CachedHandle::RawFile(Arc::new(RawFileHandle::new(path, &bundle_name, data))),
            };
            handle.core().set_load_info(file_size, ms);
            handle
        })?;
        self.log_loaded("asset", path, &bundle_name, ms);
        Ok(handle)
    }

    async fn load_scene(
        self: &Arc<Self>,
        path: &str,
        mode: LoadSceneMode,
        activate: bool,
        cancel: &CancellationToken,
    ) -> Arc<SceneHandle> {
        let hit = self.state().retain_cached(path, HandleKind::Scene);
        if let Some(CachedHandle::Scene(handle)) = hit {
            return handle;
        }

        let started = Instant::now();
        let mut source = match self.open_source(path, false, cancel).await {
            Ok(source) => source,
            Err(err) => {
                report("Scene load", path, &err);
                return Arc::new(SceneHandle::failed(path, err));
            }
        };

        let handle = Arc::new(SceneHandle::new(path, &source.bundle_name));
        let progress = {
            let handle = Arc::clone(&handle);
            move |p: f32| handle.set_progress(p)
        };
        let request = SceneRequest {
            path,
            name: scene_name(path),
            content: Arc::clone(&source.content),
            mode,
            activate,
        };
        let opened = tokio::select! {
            opened = self.host.open_scene(request, &progress) => opened,
            _ = cancel.cancelled() => Err(Cancelled.into()),
        };
        let opened = match opened {
            Ok(opened) => opened,
            Err(err) => {
                report("Scene load", path, &err);
                handle.set_error(err);
                return handle;
            }
        };

        let ms = elapsed_ms(started);
        handle.set_opened(&opened);
        self.forget_replaced_scenes(&opened.replaced);
        handle.core().set_load_info(source.file_size, ms);
        let ours = CachedHandle::Scene(Arc::clone(&handle));
        match self.track_source(path, &mut source, HandleKind::Scene, || ours) {
            Ok(CachedHandle::Scene(tracked)) => {
                if !Arc::ptr_eq(&tracked, &handle) {
                    // Lost a race with a concurrent load of the same scene.
                    self.close_scene_quietly(opened.id).await;
                }
                self.log_loaded("scene", path, &source.bundle_name, ms);
                tracked
            }
            Ok(_) => handle,
            Err(err) => {
                report("Scene load", path, &err);
                self.close_scene_quietly(opened.id).await;
                handle.set_error(err);
                handle
            }
        }
    }

    /// Invalidates cached scenes the host closed while opening another one.
    fn forget_replaced_scenes(&self, replaced: &[SceneId]) {
        if replaced.is_empty() {
            return;
        }
        let state = self.state();
        let mut owners = HashSet::new();
        for handle in state.handles.values() {
            let CachedHandle::Scene(scene) = handle else {
                continue;
            };
            if scene.scene_id().is_some_and(|id| replaced.contains(&id)) && scene.mark_replaced() {
                debug!(path = %scene.path(), "Scene replaced by host");
                owners.insert(scene.core().bundle_name().to_string());
            }
        }
        for owner in &owners {
            state.drop_direct_hold_if_orphaned(owner);
        }
    }

    async fn close_scene_quietly(&self, id: SceneId) {
        if let Err(err) = self.host.close_scene(id).await {
            warn!(scene = id.0, error = %format!("{err:#}"), "Failed to close scene");
        }
    }
}

// ============================================================================
// Public surface
// ============================================================================

/// Diagnostics for one cached handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleSnapshot {
    pub path: String,
    pub bundle: String,
    pub kind: HandleKind,
    pub ref_count: usize,
    pub valid: bool,
    pub file_size_bytes: u64,
    pub load_time_ms: f64,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Diagnostics for one cached bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleSnapshot {
    pub name: String,
    pub ref_count: usize,
    pub dependency_only: bool,
    pub valid: bool,
    pub dependencies: Vec<String>,
    pub size_bytes: u64,
    pub load_time_ms: f64,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// A bundle load in flight and how many callers wait on it.
#[derive(Debug, Clone, Serialize)]
pub struct LoadingSnapshot {
    pub bundle: String,
    pub waiters: usize,
}

/// Point-in-time view of every cache, sorted by key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheSnapshot {
    pub handles: Vec<HandleSnapshot>,
    pub bundles: Vec<BundleSnapshot>,
    pub loading: Vec<LoadingSnapshot>,
}

impl CacheSnapshot {
    pub fn handle(&self, path: &str) -> Option<&HandleSnapshot> {
        self.handles.iter().find(|h| h.path == path)
    }

    pub fn bundle(&self, name: &str) -> Option<&BundleSnapshot> {
        self.bundles.iter().find(|b| b.name == name)
    }

    pub fn total_bundle_bytes(&self) -> u64 {
        self.bundles.iter().map(|b| b.size_bytes).sum()
    }

    /// Callers waiting on the in-flight load of `bundle` (0 if none).
    pub fn waiters(&self, bundle: &str) -> usize {
        self.loading
            .iter()
            .find(|l| l.bundle == bundle)
            .map_or(0, |l| l.waiters)
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub assets: usize,
    pub bundles: usize,
}

/// A live instance created from a loaded asset. Dropping it releases the
/// handle it came from, if that handle is still the one cached for its path.
pub struct Instance {
    object: Asset,
    path: String,
    handle: Weak<AssetHandle>,
    loader: Weak<LoaderInner>,
}

impl Instance {
    pub fn object(&self) -> &Asset {
        &self.object
    }

    pub fn get<T: std::any::Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.object).downcast::<T>().ok()
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").field("path", &self.path).finish()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let (Some(inner), Some(ours)) = (self.loader.upgrade(), self.handle.upgrade()) else {
            return;
        };
        let mut state = inner.state();
        let current = matches!(
            state.handles.get(&self.path),
            Some(CachedHandle::Asset(cached)) if Arc::ptr_eq(cached, &ours)
        );
        if current {
            state.release_handle(&self.path, false);
        } else {
            debug!(path = %self.path, "Instance outlived its handle, nothing released");
        }
    }
}

/// Runtime content coordinator. Cheap to clone; clones share every cache.
#[derive(Clone)]
pub struct AssetLoader {
    inner: Arc<LoaderInner>,
}

impl AssetLoader {
    pub fn new(transport: Arc<dyn Transport>, host: Arc<dyn HostRuntime>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                transport,
                host,
                manifest: RwLock::new(None),
                state: Mutex::new(LoaderState::default()),
                detail_log: AtomicBool::new(false),
            }),
        }
    }

    /// Builds the loader with the transport `config.play_mode` selects.
    pub fn from_config(config: &LoaderConfig, host: Arc<dyn HostRuntime>) -> anyhow::Result<Self> {
        let loader = Self::new(transport::from_config(config)?, host);
        loader.set_detail_log(config.detail_log);
        Ok(loader)
    }

    pub fn set_detail_log(&self, on: bool) {
        self.inner.detail_log.store(on, Ordering::Relaxed);
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Installs the manifest and prepares the transport. A manifest whose
    /// dependency graph has a cycle is rejected.
    pub async fn initialize(&self, manifest: BundleManifest) -> anyhow::Result<()> {
        if let Some(cycle) = manifest.find_cycle() {
            bail!("bundle dependency cycle: {}", cycle.join(" -> "));
        }
        self.inner
            .transport
            .prepare()
            .await
            .with_context(|| format!("prepare {} transport", self.inner.transport.name()))?;
        let bundles = manifest.bundles().len();
        let assets = manifest.asset_count();
        *self
            .inner
            .manifest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(manifest));
        info!(transport = self.inner.transport.name(), bundles, assets, "Asset loader initialized");
        Ok(())
    }

    /// Reads the manifest named by `config` and initializes with it. Bypass
    /// mode runs without one when the file is absent.
    pub async fn initialize_from_config(&self, config: &LoaderConfig) -> anyhow::Result<()> {
        let path = config.manifest_path();
        if config.play_mode == PlayMode::Bypass && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return self.initialize(BundleManifest::default()).await;
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read manifest {}", path.display()))?;
        let manifest = BundleManifest::from_json_str(&text)
            .with_context(|| format!("parse manifest {}", path.display()))?;
        self.initialize(manifest).await
    }

    #[cfg(test)]
    fn set_manifest_unchecked(&self, manifest: BundleManifest) {
        *self
            .inner
            .manifest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(manifest));
    }

    pub fn manifest(&self) -> Option<Arc<BundleManifest>> {
        self.inner.manifest().ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.manifest().is_some()
    }

    /// Loads the asset at `path`, retaining its handle once.
    pub async fn load_asset(&self, path: &str, cancel: &CancellationToken) -> Option<Arc<AssetHandle>> {
        match self.inner.load_payload(path, HandleKind::Asset, cancel).await {
            Ok(CachedHandle::Asset(handle)) => Some(handle),
            Ok(other) => {
                error!(path = %path, kind = ?other.kind(), "Unexpected handle kind");
                None
            }
            Err(err) => {
                report("Asset load", path, &err);
                None
            }
        }
    }

    /// Loads several assets concurrently. Results keep the input order.
    pub async fn load_assets<S: AsRef<str>>(
        &self,
        paths: &[S],
        cancel: &CancellationToken,
    ) -> Vec<Option<Arc<AssetHandle>>> {
        let mut set = JoinSet::new();
        for (i, path) in paths.iter().enumerate() {
            let loader = self.clone();
            let path = path.as_ref().to_string();
            let cancel = cancel.clone();
            set.spawn(async move { (i, loader.load_asset(&path, &cancel).await) });
        }
        let mut out = vec![None; paths.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, handle)) => out[i] = handle,
                Err(err) => warn!(error = %err, "Batch load task failed"),
            }
        }
        out
    }

    /// Bytes of a raw-file bundle entry, retaining its handle once.
    pub async fn load_raw_file(&self, path: &str, cancel: &CancellationToken) -> Option<Bytes> {
        match self.inner.load_payload(path, HandleKind::RawFile, cancel).await {
            Ok(CachedHandle::RawFile(handle)) => handle.data(),
            Ok(other) => {
                error!(path = %path, kind = ?other.kind(), "Unexpected handle kind");
                None
            }
            Err(err) => {
                report("Raw file load", path, &err);
                None
            }
        }
    }

    pub async fn load_raw_file_text(&self, path: &str, cancel: &CancellationToken) -> Option<String> {
        self.load_raw_file(path, cancel)
            .await
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// Opens a scene. Failures are recorded on the returned handle.
    pub async fn load_scene(
        &self,
        path: &str,
        mode: LoadSceneMode,
        activate: bool,
        cancel: &CancellationToken,
    ) -> Arc<SceneHandle> {
        self.inner.load_scene(path, mode, activate, cancel).await
    }

    /// Activates a scene that was loaded with `activate = false`.
    pub async fn activate_scene(&self, handle: &SceneHandle) -> anyhow::Result<()> {
        let id = handle
            .scene_id()
            .with_context(|| format!("scene {} is not open", handle.path()))?;
        if handle.is_activated() {
            return Ok(());
        }
        self.inner.host.activate_scene(id).await?;
        handle.mark_activated();
        Ok(())
    }

    /// Loads `path` and creates a live instance from it. The instance keeps
    /// the load's reference until dropped.
    pub async fn instantiate(&self, path: &str, cancel: &CancellationToken) -> Option<Instance> {
        let handle = self.load_asset(path, cancel).await?;
        let created = handle
            .asset()
            .context("asset disposed before instantiation")
            .and_then(|asset| self.inner.host.instantiate(path, &asset));
        match created {
            Ok(object) => Some(Instance {
                object,
                path: path.to_string(),
                handle: Arc::downgrade(&handle),
                loader: Arc::downgrade(&self.inner),
            }),
            Err(err) => {
                report("Instantiate", path, &err);
                self.release(path);
                None
            }
        }
    }

    /// Drops one reference on `path`. Unknown paths are ignored.
    pub fn release(&self, path: &str) {
        if path.is_empty() {
            return;
        }
        let found = self.inner.state().release_handle(path, false);
        if !found {
            debug!(path = %path, "Release of unknown path ignored");
        }
    }

    /// Releases the asset handle holding exactly `asset`.
    pub fn release_resource(&self, asset: &Asset) -> bool {
        let mut state = self.inner.state();
        let path = state.handles.iter().find_map(|(path, h)| match h {
            CachedHandle::Asset(handle) if handle.holds(asset) => Some(path.clone()),
            _ => None,
        });
        match path {
            Some(path) => state.release_handle(&path, false),
            None => {
                debug!("Release of untracked resource ignored");
                false
            }
        }
    }

    /// Drops every reference on `path`.
    pub fn force_release_asset(&self, path: &str) {
        if !self.inner.state().release_handle(path, true) {
            debug!(path = %path, "Force release of unknown path ignored");
        }
    }

    /// Drops every reference on every handle.
    pub fn force_release_all(&self) {
        {
            let mut state = self.inner.state();
            let paths: Vec<String> = state.handles.keys().cloned().collect();
            for path in &paths {
                state.release_handle(path, true);
            }
        }
        self.inner.transport.clear_memo();
        info!("Force released all handles");
    }

    /// Force-releases every handle of bundle `name`, then the bundle itself.
    pub fn force_unload_bundle(&self, name: &str) -> bool {
        let mut state = self.inner.state();
        let Some(bundle) = state.bundles.get(name).cloned() else {
            debug!(bundle = %name, "Force unload of unknown bundle ignored");
            return false;
        };
        let paths: Vec<String> = state
            .handles
            .iter()
            .filter(|(_, h)| h.core().bundle_name() == name)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &paths {
            state.release_handle(path, true);
        }
        bundle.set_dependency_only(true);
        LoaderState::release_bundle(&bundle, true);
        info!(bundle = %name, handles = paths.len(), "Force unloaded bundle");
        true
    }

    /// Disposes and removes every unreferenced or invalid handle, then every
    /// unreferenced bundle, then lets the host reclaim its own memory.
    pub async fn unload_unused(&self) -> SweepReport {
        let (report, scenes) = {
            let mut state = self.inner.state();
            let stale: Vec<String> = state
                .handles
                .iter()
                .filter(|(_, h)| !h.is_live())
                .map(|(p, _)| p.clone())
                .collect();
            let mut scenes = Vec::new();
            let mut owners = HashSet::new();
            for path in &stale {
                if let Some(handle) = state.handles.remove(path) {
                    scenes.extend(handle.dispose());
                    owners.insert(handle.core().bundle_name().to_string());
                }
            }
            for owner in &owners {
                state.drop_direct_hold_if_orphaned(owner);
            }

            let idle: Vec<String> = state
                .bundles
                .iter()
                .filter(|(_, b)| b.ref_count() == 0 || !b.is_valid())
                .map(|(n, _)| n.clone())
                .collect();
            for name in &idle {
                if let Some(bundle) = state.bundles.remove(name) {
                    LoaderState::release_dependencies(&bundle);
                    bundle.dispose();
                }
            }
            (
                SweepReport {
                    assets: stale.len(),
                    bundles: idle.len(),
                },
                scenes,
            )
        };

        for id in scenes {
            self.inner.close_scene_quietly(id).await;
        }
        self.inner.host.reclaim_unused().await;
        info!(assets = report.assets, bundles = report.bundles, "Swept unused content");
        report
    }

    /// Force-releases everything and sweeps.
    pub async fn dispose(&self) -> SweepReport {
        self.force_release_all();
        self.unload_unused().await
    }

    pub fn handle(&self, path: &str) -> Option<CachedHandle> {
        self.inner.state().handles.get(path).cloned()
    }

    pub fn bundle(&self, name: &str) -> Option<Arc<BundleHandle>> {
        self.inner.state().bundles.get(name).cloned()
    }

    /// Memory held by loaded content: the host's figure when it reports one,
    /// otherwise the manifest size of every cached bundle.
    pub fn memory_in_use(&self) -> u64 {
        if let Some(bytes) = self.inner.host.memory_in_use() {
            return bytes;
        }
        self.inner
            .state()
            .bundles
            .values()
            .filter(|b| b.is_valid())
            .map(|b| b.size_bytes())
            .sum()
    }

    pub fn is_loading(&self, bundle: &str) -> bool {
        self.inner.state().in_flight.contains_key(bundle)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.inner.state();
        let mut handles: Vec<HandleSnapshot> = state
            .handles
            .iter()
            .map(|(path, h)| {
                let core = h.core();
                HandleSnapshot {
                    path: path.clone(),
                    bundle: core.bundle_name().to_string(),
                    kind: h.kind(),
                    ref_count: core.ref_count(),
                    valid: h.is_valid(),
                    file_size_bytes: core.file_size_bytes(),
                    load_time_ms: core.last_load_time_ms(),
                    loaded_at: core.loaded_at(),
                }
            })
            .collect();
        handles.sort_by(|a, b| a.path.cmp(&b.path));

        let mut bundles: Vec<BundleSnapshot> = state
            .bundles
            .values()
            .map(|b| BundleSnapshot {
                name: b.name().to_string(),
                ref_count: b.ref_count(),
                dependency_only: b.is_dependency_only(),
                valid: b.is_valid(),
                dependencies: b.dependency_names(),
                size_bytes: b.size_bytes(),
                load_time_ms: b.load_time_ms(),
                loaded_at: b.loaded_at(),
            })
            .collect();
        bundles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut loading: Vec<LoadingSnapshot> = state
            .in_flight
            .iter()
            .map(|(name, entry)| LoadingSnapshot {
                bundle: name.clone(),
                waiters: entry.waiters.len(),
            })
            .collect();
        loading.sort_by(|a, b| a.bundle.cmp(&b.bundle));
        CacheSnapshot {
            handles,
            bundles,
            loading,
        }
    }
}
