//! Host runtime seam.
//!
//! The loader never touches the world itself. Opening scenes, creating live
//! instances and reclaiming host-side memory go through `HostRuntime`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::handle::Asset;
use crate::lock;
use crate::transport::BundleContent;

/// Identifies a scene opened by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneId(pub u64);

/// How a scene is added to the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSceneMode {
    /// Replace every open scene.
    #[default]
    Single,
    /// Open alongside the current scenes.
    Additive,
}

/// Everything the host needs to open one scene.
pub struct SceneRequest<'a> {
    /// Logical scene path as requested by the caller.
    pub path: &'a str,
    /// Scene name inside its bundle (file stem of the path).
    pub name: &'a str,
    /// Content that holds the scene data.
    pub content: Arc<dyn BundleContent>,
    pub mode: LoadSceneMode,
    /// Activate as soon as loading finishes.
    pub activate: bool,
}

/// Result of a successful scene open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedScene {
    pub id: SceneId,
    pub activated: bool,
    /// Scenes the host closed to make room (`LoadSceneMode::Single`).
    pub replaced: Vec<SceneId>,
}

/// Progress callback handed to `open_scene`, values in `0.0..=1.0`.
pub type SceneProgress<'a> = &'a (dyn Fn(f32) + Send + Sync);

#[async_trait]
pub trait HostRuntime: Send + Sync {
    async fn open_scene(
        &self,
        request: SceneRequest<'_>,
        progress: SceneProgress<'_>,
    ) -> anyhow::Result<OpenedScene>;

    async fn activate_scene(&self, id: SceneId) -> anyhow::Result<()>;

    async fn close_scene(&self, id: SceneId) -> anyhow::Result<()>;

    /// Creates a live instance from a loaded asset. The default shares the asset.
    fn instantiate(&self, _path: &str, asset: &Asset) -> anyhow::Result<Asset> {
        Ok(Arc::clone(asset))
    }

    /// Lets the host free its own unused resources after a sweep.
    async fn reclaim_unused(&self) {}

    /// Bytes the host attributes to loaded content, when it can measure them.
    /// `None` leaves the measurement to the loader.
    fn memory_in_use(&self) -> Option<u64> {
        None
    }
}

/// Extracts the in-bundle scene name from a scene path.
pub fn scene_name(path: &str) -> &str {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
}

/// Host without a world: tracks which scenes are open and active.
#[derive(Debug, Default)]
pub struct HeadlessHost {
    next_id: AtomicU64,
    open: Mutex<HashSet<SceneId>>,
    active: Mutex<HashSet<SceneId>>,
    reclaims: AtomicU64,
    memory: Mutex<Option<u64>>,
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_scenes(&self) -> usize {
        lock(&self.open).len()
    }

    pub fn is_active(&self, id: SceneId) -> bool {
        lock(&self.active).contains(&id)
    }

    /// How many sweeps asked the host to reclaim memory.
    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    /// Overrides the memory figure reported to the loader.
    pub fn set_memory_in_use(&self, bytes: Option<u64>) {
        *lock(&self.memory) = bytes;
    }
}

#[async_trait]
impl HostRuntime for HeadlessHost {
    async fn open_scene(
        &self,
        request: SceneRequest<'_>,
        progress: SceneProgress<'_>,
    ) -> anyhow::Result<OpenedScene> {
        progress(0.0);
        if !request.content.contains(request.path) && !request.content.contains(request.name) {
            bail!("scene {} not found in its bundle", request.path);
        }
        progress(0.9);

        let id = SceneId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut replaced = Vec::new();
        {
            let mut open = lock(&self.open);
            let mut active = lock(&self.active);
            if request.mode == LoadSceneMode::Single {
                replaced.extend(open.drain());
                replaced.sort_by_key(|s| s.0);
                active.clear();
            }
            open.insert(id);
            if request.activate {
                active.insert(id);
            }
        }
        progress(1.0);
        debug!(scene = %request.path, id = id.0, mode = ?request.mode, replaced = replaced.len(), "Scene opened");
        Ok(OpenedScene {
            id,
            activated: request.activate,
            replaced,
        })
    }

    async fn activate_scene(&self, id: SceneId) -> anyhow::Result<()> {
        if !lock(&self.open).contains(&id) {
            bail!("scene {} is not open", id.0);
        }
        lock(&self.active).insert(id);
        Ok(())
    }

    async fn close_scene(&self, id: SceneId) -> anyhow::Result<()> {
        lock(&self.active).remove(&id);
        lock(&self.open).remove(&id);
        Ok(())
    }

    async fn reclaim_unused(&self) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
    }

    fn memory_in_use(&self) -> Option<u64> {
        *lock(&self.memory)
    }
}
