//! Bundle transports.
//!
//! A transport turns a `BundleInfo` into live `BundleContent`:
//! - `local`: read archives from the cache dir, then the shipped bundle dir
//! - `download`: make sure a valid copy is in the cache dir, then read it
//! - `streaming`: fetch from a remote source on every load, memoised
//! - `bypass`: no bundles, content is read straight from a source tree
//!
//! Archives are turned into content by a `BundleDecoder`. The default one
//! understands `PackedArchive` files and raw-file bundles.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::archive::PackedArchive;
use crate::config::{LoaderConfig, PlayMode};
use crate::handle::Asset;
use crate::host::scene_name;
use crate::lock;
use crate::manifest::BundleInfo;

pub mod bypass;
pub mod download;
pub mod local;
pub mod streaming;

pub use bypass::BypassTransport;
pub use download::{ArchiveDownloader, DownloadTransport, MirrorDownloader};
pub use local::LocalTransport;
pub use streaming::{DirectorySource, RemoteSource, StreamingTransport};

/// Error marker for work abandoned because its token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Whether an error chain ends in a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}

/// Loaded bundle content, queried by asset path.
#[async_trait]
pub trait BundleContent: Send + Sync {
    fn contains(&self, path: &str) -> bool;

    /// Extracts one asset. `Ok(None)` when the bundle has no such entry.
    async fn load_asset(&self, path: &str) -> anyhow::Result<Option<Asset>>;

    /// Raw bytes of an entry.
    async fn read_raw(&self, path: &str) -> anyhow::Result<Option<Bytes>>;

    /// Releases underlying storage. Called once when the bundle is disposed.
    fn unload(&self) {}
}

/// Materialises bundle content for the loader.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time setup before the first load.
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_bundle(
        &self,
        info: &BundleInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn BundleContent>>;

    /// Content that serves every path without bundles (bypass mode).
    fn direct_source(&self) -> Option<Arc<dyn BundleContent>> {
        None
    }

    /// Forgets memoised payloads.
    fn clear_memo(&self) {}
}

/// Turns fetched bytes into content.
pub trait BundleDecoder: Send + Sync {
    fn decode(&self, info: &BundleInfo, bytes: Bytes) -> anyhow::Result<Arc<dyn BundleContent>>;
}

/// Decodes `PackedArchive` files; raw-file bundles keep their bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveDecoder;

impl BundleDecoder for ArchiveDecoder {
    fn decode(&self, info: &BundleInfo, bytes: Bytes) -> anyhow::Result<Arc<dyn BundleContent>> {
        if info.is_encrypted {
            bail!("bundle {} is encrypted and no decrypting decoder is configured", info.name);
        }
        if info.is_raw_file {
            return Ok(Arc::new(RawContent::new(bytes)));
        }
        let archive = PackedArchive::decode(bytes)
            .with_context(|| format!("decode bundle {}", info.name))?;
        Ok(Arc::new(ArchiveContent::new(archive)))
    }
}

/// Content backed by a decoded archive. Assets are the entry bytes.
#[derive(Debug)]
pub struct ArchiveContent {
    archive: Mutex<Option<PackedArchive>>,
}

impl ArchiveContent {
    pub fn new(archive: PackedArchive) -> Self {
        Self {
            archive: Mutex::new(Some(archive)),
        }
    }

    /// Entry by full path, falling back to the path's file stem.
    fn entry(&self, path: &str) -> anyhow::Result<Option<Bytes>> {
        let guard = lock(&self.archive);
        let Some(archive) = guard.as_ref() else {
            bail!("bundle content already unloaded");
        };
        Ok(archive
            .get(path)
            .or_else(|| archive.get(scene_name(path)))
            .cloned())
    }
}

#[async_trait]
impl BundleContent for ArchiveContent {
    fn contains(&self, path: &str) -> bool {
        lock(&self.archive)
            .as_ref()
            .is_some_and(|a| a.contains(path) || a.contains(scene_name(path)))
    }

    async fn load_asset(&self, path: &str) -> anyhow::Result<Option<Asset>> {
        Ok(self.entry(path)?.map(|b| Arc::new(b) as Asset))
    }

    async fn read_raw(&self, path: &str) -> anyhow::Result<Option<Bytes>> {
        self.entry(path)
    }

    fn unload(&self) {
        lock(&self.archive).take();
    }
}

/// A raw-file bundle: one payload, whatever path asks for it.
#[derive(Debug)]
pub struct RawContent {
    data: Mutex<Option<Bytes>>,
}

impl RawContent {
    pub fn new(data: Bytes) -> Self {
        Self {
            data: Mutex::new(Some(data)),
        }
    }

    fn data(&self) -> anyhow::Result<Bytes> {
        lock(&self.data)
            .clone()
            .context("raw bundle content already unloaded")
    }
}

#[async_trait]
impl BundleContent for RawContent {
    fn contains(&self, _path: &str) -> bool {
        lock(&self.data).is_some()
    }

    async fn load_asset(&self, _path: &str) -> anyhow::Result<Option<Asset>> {
        Ok(Some(Arc::new(self.data()?) as Asset))
    }

    async fn read_raw(&self, _path: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(Some(self.data()?))
    }

    fn unload(&self) {
        lock(&self.data).take();
    }
}

/// Reads a whole file, abandoning the read when `cancel` fires.
pub(crate) async fn read_file(path: &Path, cancel: &CancellationToken) -> anyhow::Result<Bytes> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled.into()),
        read = tokio::fs::read(path) => {
            let data = read.with_context(|| format!("read {}", path.display()))?;
            Ok(Bytes::from(data))
        }
    }
}

/// First existing file among `dirs` joined with `file_name`.
pub(crate) async fn first_existing(dirs: &[&Path], file_name: &str) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(file_name);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}

/// Builds the transport the config's play mode asks for.
///
/// Online and streaming modes treat `remote_url` as a mirror directory; hosts
/// with a network stack build `DownloadTransport`/`StreamingTransport` with
/// their own downloader or source instead.
pub fn from_config(config: &LoaderConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let decoder: Arc<dyn BundleDecoder> = Arc::new(ArchiveDecoder);
    let transport: Arc<dyn Transport> = match config.play_mode {
        PlayMode::Bypass => Arc::new(BypassTransport::new(&config.source_dir)),
        PlayMode::Offline => Arc::new(LocalTransport::new(
            &config.bundle_dir,
            &config.cache_dir,
            decoder,
        )),
        PlayMode::Online => {
            if config.remote_url.is_empty() {
                bail!("online play mode needs remote_url");
            }
            Arc::new(DownloadTransport::new(
                &config.bundle_dir,
                &config.cache_dir,
                Arc::new(MirrorDownloader::new(&config.remote_url)),
                decoder,
            ))
        }
        PlayMode::Streaming => {
            if config.remote_url.is_empty() {
                bail!("streaming play mode needs remote_url");
            }
            Arc::new(StreamingTransport::new(
                Arc::new(DirectorySource::new(&config.remote_url)),
                decoder,
            ))
        }
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn archive_content_falls_back_to_file_stem() -> anyhow::Result<()> {
        let mut archive = PackedArchive::new();
        archive.insert("icon", Bytes::from_static(b"png"));
        let content = ArchiveContent::new(archive);

        assert!(content.contains("ui/icon.png"));
        assert_eq!(content.read_raw("ui/icon.png").await?.unwrap().as_ref(), b"png");
        assert!(content.load_asset("ui/other.png").await?.is_none());

        content.unload();
        assert!(!content.contains("ui/icon.png"));
        assert!(content.read_raw("ui/icon.png").await.is_err());
        Ok(())
    }

    #[test]
    fn decoder_keeps_raw_files_and_rejects_encrypted() {
        let info = BundleInfo::new("cfg.bytes").raw_file();
        let content = ArchiveDecoder
            .decode(&info, Bytes::from_static(b"not an archive"))
            .unwrap();
        assert!(content.contains("anything"));

        let mut encrypted = BundleInfo::new("secret");
        encrypted.is_encrypted = true;
        assert!(ArchiveDecoder.decode(&encrypted, Bytes::new()).is_err());
        assert!(ArchiveDecoder.decode(&BundleInfo::new("bad"), Bytes::from_static(b"junk")).is_err());
    }

    #[tokio::test]
    async fn read_file_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = read_file(Path::new("/definitely/not/here"), &cancel)
            .await
            .unwrap_err();
        assert!(is_cancelled(&err));
    }

    #[test]
    fn online_mode_requires_remote_url() {
        let config = LoaderConfig {
            play_mode: PlayMode::Online,
            ..LoaderConfig::default()
        };
        assert!(from_config(&config).is_err());

        let config = LoaderConfig {
            play_mode: PlayMode::Offline,
            ..LoaderConfig::default()
        };
        assert_eq!(from_config(&config).unwrap().name(), "local");
    }
}
