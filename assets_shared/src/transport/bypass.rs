//! Bypass transport: authoring mode without bundles.
//!
//! Every asset path is read from the source tree directly. The loader skips
//! bundle bookkeeping and tracks handles with an empty bundle name.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{BundleContent, Transport};
use crate::handle::Asset;
use crate::manifest::BundleInfo;

/// Content backed by a directory of source files.
#[derive(Debug, Clone)]
pub struct SourceTree {
    root: PathBuf,
}

impl SourceTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves an asset path under the root, refusing escapes.
    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("asset path {path} leaves the source tree");
        }
        Ok(self.root.join(rel))
    }

    async fn read(&self, path: &str) -> anyhow::Result<Option<Bytes>> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", full.display())),
        }
    }
}

#[async_trait]
impl BundleContent for SourceTree {
    fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|p| p.is_file())
    }

    async fn load_asset(&self, path: &str) -> anyhow::Result<Option<Asset>> {
        Ok(self.read(path).await?.map(|b| Arc::new(b) as Asset))
    }

    async fn read_raw(&self, path: &str) -> anyhow::Result<Option<Bytes>> {
        self.read(path).await
    }
}

pub struct BypassTransport {
    tree: Arc<SourceTree>,
}

impl BypassTransport {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            tree: Arc::new(SourceTree::new(source_dir)),
        }
    }
}

#[async_trait]
impl Transport for BypassTransport {
    fn name(&self) -> &'static str {
        "bypass"
    }

    async fn fetch_bundle(
        &self,
        info: &BundleInfo,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn BundleContent>> {
        bail!("bypass mode has no bundles (asked for {})", info.name)
    }

    fn direct_source(&self) -> Option<Arc<dyn BundleContent>> {
        Some(self.tree.clone())
    }
}
