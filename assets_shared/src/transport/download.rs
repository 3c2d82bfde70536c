//! Online transport: keep a validated copy in the cache dir, then read it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{read_file, BundleContent, BundleDecoder, Cancelled, Transport};
use crate::manifest::BundleInfo;

/// Fetches one archive file into `dest`.
#[async_trait]
pub trait ArchiveDownloader: Send + Sync {
    async fn download(
        &self,
        file_name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Copies archives from a mirror directory.
#[derive(Debug, Clone)]
pub struct MirrorDownloader {
    root: PathBuf,
}

impl MirrorDownloader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArchiveDownloader for MirrorDownloader {
    async fn download(
        &self,
        file_name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let source = self.root.join(file_name);
        let bytes = read_file(&source, cancel).await?;
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("write {}", dest.display()))
    }
}

/// Validates the cached copy of each bundle, downloading it when missing or
/// stale. A shipped copy in `bundle_dir` is used when it validates.
pub struct DownloadTransport {
    bundle_dir: PathBuf,
    cache_dir: PathBuf,
    downloader: Arc<dyn ArchiveDownloader>,
    decoder: Arc<dyn BundleDecoder>,
}

impl DownloadTransport {
    pub fn new(
        bundle_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        downloader: Arc<dyn ArchiveDownloader>,
        decoder: Arc<dyn BundleDecoder>,
    ) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
            cache_dir: cache_dir.into(),
            downloader,
            decoder,
        }
    }

    /// A file is valid when it exists and matches the manifest's size and
    /// CRC-32. A zero size or CRC is not checked.
    async fn is_valid(path: &Path, info: &BundleInfo) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) if info.size == 0 || meta.len() == info.size => {}
            _ => return false,
        }
        if info.crc == 0 {
            return true;
        }
        match tokio::fs::read(path).await {
            Ok(data) => {
                let actual = crc32fast::hash(&data);
                if actual != info.crc {
                    debug!(path = %path.display(), expected = info.crc, actual, "CRC mismatch");
                }
                actual == info.crc
            }
            Err(_) => false,
        }
    }

    async fn ensure_local(
        &self,
        info: &BundleInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PathBuf> {
        let file_name = info.file_name();
        let cached = self.cache_dir.join(&file_name);
        if Self::is_valid(&cached, info).await {
            return Ok(cached);
        }
        let shipped = self.bundle_dir.join(&file_name);
        if Self::is_valid(&shipped, info).await {
            return Ok(shipped);
        }
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        info!(bundle = %info.name, file = %file_name, "Downloading bundle");
        let partial = self.cache_dir.join(format!("{file_name}.part"));
        if let Err(err) = self.downloader.download(&file_name, &partial, cancel).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err.context(format!("download {file_name}")));
        }
        if !Self::is_valid(&partial, info).await {
            let _ = tokio::fs::remove_file(&partial).await;
            bail!(
                "downloaded {file_name} does not match manifest (size {}, crc {:08x})",
                info.size,
                info.crc
            );
        }
        tokio::fs::rename(&partial, &cached)
            .await
            .with_context(|| format!("move {} into cache", file_name))?;
        Ok(cached)
    }
}

#[async_trait]
impl Transport for DownloadTransport {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("create cache dir {}", self.cache_dir.display()))
    }

    async fn fetch_bundle(
        &self,
        info: &BundleInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn BundleContent>> {
        let path = self.ensure_local(info, cancel).await?;
        let bytes = read_file(&path, cancel).await?;
        if info.size != 0 && bytes.len() as u64 != info.size {
            warn!(bundle = %info.name, expected = info.size, actual = bytes.len(), "Bundle size changed after validation");
        }
        debug!(bundle = %info.name, path = %path.display(), "Read bundle file");
        self.decoder.decode(info, bytes)
    }
}
