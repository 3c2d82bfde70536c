//! Shared fixtures for the loader integration tests.
//!
//! - `MemoryTransport`: serves manifest bundles from memory, counts fetches,
//!   can hold every fetch behind a gate and can fail chosen bundles.
//! - `RecordingHost`: a `HeadlessHost` that also logs scene traffic.
//! - `sample_manifest`: the bundle layout most tests use.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use assets_shared::archive::PackedArchive;
use assets_shared::host::{OpenedScene, SceneId, SceneProgress, SceneRequest};
use assets_shared::prelude::*;
use assets_shared::transport::{ArchiveContent, RawContent};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// ui.bundle and hud.bundle share common.bundle; cfg.bytes is a raw file;
/// levels.bundle holds two scenes.
pub fn sample_manifest() -> BundleManifest {
    BundleManifest::new(vec![
        BundleInfo::new("ui.bundle")
            .with_assets(["ui/a.png", "ui/b.png"])
            .with_dependencies(["common.bundle"])
            .with_size(2048),
        BundleInfo::new("hud.bundle")
            .with_assets(["hud/c.png"])
            .with_dependencies(["common.bundle"])
            .with_size(512),
        BundleInfo::new("common.bundle")
            .with_assets(["common/font.ttf"])
            .with_size(4096),
        BundleInfo::new("cfg.bytes")
            .with_assets(["cfg/game.json"])
            .raw_file()
            .with_size(16),
        BundleInfo::new("levels.bundle")
            .with_assets(["levels/forest.scene", "levels/cave.scene"])
            .with_dependencies(["common.bundle"]),
    ])
}

/// Payload every fixture asset carries: its own path.
pub fn payload_of(path: &str) -> Bytes {
    Bytes::from(path.to_string())
}

/// In-memory bundle source.
pub struct MemoryTransport {
    manifest: BundleManifest,
    fetches: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    gate: watch::Sender<bool>,
    memo_clears: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(manifest: &BundleManifest) -> Arc<Self> {
        Arc::new(Self::build(manifest, true))
    }

    /// Every fetch waits until `open_gate`.
    pub fn gated(manifest: &BundleManifest) -> Arc<Self> {
        Arc::new(Self::build(manifest, false))
    }

    fn build(manifest: &BundleManifest, open: bool) -> Self {
        let (gate, _) = watch::channel(open);
        Self {
            manifest: manifest.clone(),
            fetches: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            gate,
            memo_clears: AtomicUsize::new(0),
        }
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail(&self, bundle: &str) {
        self.failing.lock().unwrap().insert(bundle.to_string());
    }

    pub fn heal(&self, bundle: &str) {
        self.failing.lock().unwrap().remove(bundle);
    }

    pub fn fetches(&self, bundle: &str) -> usize {
        self.fetches.lock().unwrap().get(bundle).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    pub fn memo_clears(&self) -> usize {
        self.memo_clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_bundle(
        &self,
        info: &BundleInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn BundleContent>> {
        let mut gate = self.gate.subscribe();
        tokio::select! {
            _ = async { gate.wait_for(|open| *open).await.map(|_| ()) } => {}
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        }
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(info.name.clone())
            .or_default() += 1;
        if self.failing.lock().unwrap().contains(&info.name) {
            bail!("simulated transport failure for {}", info.name);
        }
        let Some(info) = self.manifest.bundle_info(&info.name) else {
            bail!("unknown bundle {}", info.name);
        };
        if info.is_raw_file {
            let path = info.assets.first().map(String::as_str).unwrap_or_default();
            return Ok(Arc::new(RawContent::new(payload_of(path))));
        }
        let mut archive = PackedArchive::new();
        for asset in &info.assets {
            archive.insert(asset.clone(), payload_of(asset));
        }
        Ok(Arc::new(ArchiveContent::new(archive)))
    }

    fn clear_memo(&self) {
        self.memo_clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Headless host that records every scene call.
#[derive(Default)]
pub struct RecordingHost {
    inner: HeadlessHost,
    events: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn open_scenes(&self) -> usize {
        self.inner.open_scenes()
    }

    pub fn reclaim_count(&self) -> u64 {
        self.inner.reclaim_count()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl HostRuntime for RecordingHost {
    async fn open_scene(
        &self,
        request: SceneRequest<'_>,
        progress: SceneProgress<'_>,
    ) -> anyhow::Result<OpenedScene> {
        let path = request.path.to_string();
        let opened = self.inner.open_scene(request, progress).await?;
        self.record(format!("open {path} #{}", opened.id.0));
        Ok(opened)
    }

    async fn activate_scene(&self, id: SceneId) -> anyhow::Result<()> {
        self.inner.activate_scene(id).await?;
        self.record(format!("activate #{}", id.0));
        Ok(())
    }

    async fn close_scene(&self, id: SceneId) -> anyhow::Result<()> {
        self.inner.close_scene(id).await?;
        self.record(format!("close #{}", id.0));
        Ok(())
    }

    async fn reclaim_unused(&self) {
        self.inner.reclaim_unused().await;
    }

    fn memory_in_use(&self) -> Option<u64> {
        self.inner.memory_in_use()
    }
}

/// Loader over `transport` and `host`, initialised with `manifest`.
pub async fn loader_with(
    manifest: BundleManifest,
    transport: Arc<dyn Transport>,
    host: Arc<dyn HostRuntime>,
) -> anyhow::Result<AssetLoader> {
    init_tracing();
    let loader = AssetLoader::new(transport, host);
    loader.initialize(manifest).await?;
    Ok(loader)
}

/// Loader over an open `MemoryTransport` of `sample_manifest`.
pub async fn sample_loader() -> anyhow::Result<(AssetLoader, Arc<MemoryTransport>)> {
    let manifest = sample_manifest();
    let transport = MemoryTransport::new(&manifest);
    let loader = loader_with(manifest, transport.clone(), Arc::new(HeadlessHost::new())).await?;
    Ok((loader, transport))
}

/// Polls `cond` until it holds, failing after two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Bundle refcount, 0 when not cached.
pub fn bundle_refs(loader: &AssetLoader, bundle: &str) -> usize {
    loader.bundle(bundle).map_or(0, |b| b.ref_count())
}

/// Handle refcount, `None` when not cached.
pub fn handle_refs(loader: &AssetLoader, path: &str) -> Option<usize> {
    loader.handle(path).map(|h| h.core().ref_count())
}
