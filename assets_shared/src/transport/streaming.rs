//! Streaming transport: archives come from a remote source on demand.
//!
//! Fetched payloads are memoised per file name until `clear_memo`, so a
//! bundle that is swept and loaded again does not hit the source twice.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{read_file, BundleContent, BundleDecoder, Transport};
use crate::lock;
use crate::manifest::BundleInfo;

/// Where streamed archives come from.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, file_name: &str, cancel: &CancellationToken) -> anyhow::Result<Bytes>;
}

/// Serves archives from a directory laid out like the remote root.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RemoteSource for DirectorySource {
    async fn fetch(&self, file_name: &str, cancel: &CancellationToken) -> anyhow::Result<Bytes> {
        read_file(&self.root.join(file_name), cancel).await
    }
}

pub struct StreamingTransport {
    source: Arc<dyn RemoteSource>,
    decoder: Arc<dyn BundleDecoder>,
    memo: Mutex<HashMap<String, Bytes>>,
}

impl StreamingTransport {
    pub fn new(source: Arc<dyn RemoteSource>, decoder: Arc<dyn BundleDecoder>) -> Self {
        Self {
            source,
            decoder,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn memo_len(&self) -> usize {
        lock(&self.memo).len()
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn fetch_bundle(
        &self,
        info: &BundleInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn BundleContent>> {
        let file_name = info.file_name();
        let memoised = lock(&self.memo).get(&file_name).cloned();
        let bytes = match memoised {
            Some(bytes) => bytes,
            None => {
                let bytes = self.source.fetch(&file_name, cancel).await?;
                debug!(bundle = %info.name, bytes = bytes.len(), "Streamed bundle");
                lock(&self.memo).insert(file_name, bytes.clone());
                bytes
            }
        };
        self.decoder.decode(info, bytes)
    }

    fn clear_memo(&self) {
        lock(&self.memo).clear();
    }
}
