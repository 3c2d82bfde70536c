//! Offline transport: archives already on local storage.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{first_existing, read_file, BundleContent, BundleDecoder, Transport};
use crate::manifest::BundleInfo;

/// Reads `{name}_{hash}` from the cache dir first, then the bundle dir.
pub struct LocalTransport {
    bundle_dir: PathBuf,
    cache_dir: PathBuf,
    decoder: Arc<dyn BundleDecoder>,
}

impl LocalTransport {
    pub fn new(
        bundle_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        decoder: Arc<dyn BundleDecoder>,
    ) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
            cache_dir: cache_dir.into(),
            decoder,
        }
    }

    /// Where the archive for `info` would be read from, if it exists.
    pub async fn locate(&self, info: &BundleInfo) -> Option<PathBuf> {
        let dirs = [self.cache_dir.as_path(), self.bundle_dir.as_path()];
        first_existing(&dirs, &info.file_name()).await
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn fetch_bundle(
        &self,
        info: &BundleInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn BundleContent>> {
        let path = self.locate(info).await.with_context(|| {
            format!(
                "bundle file {} not found in {} or {}",
                info.file_name(),
                self.cache_dir.display(),
                self.bundle_dir.display()
            )
        })?;
        let bytes = read_file(&path, cancel).await?;
        debug!(bundle = %info.name, path = %path.display(), bytes = bytes.len(), "Read bundle file");
        self.decoder.decode(info, bytes)
    }
}
