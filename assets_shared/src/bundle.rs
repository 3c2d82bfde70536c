//! Loaded bundle handles.
//!
//! A bundle's count is one for its direct holder (if any) plus one per live
//! dependent bundle. The cascade into dependencies is driven by the loader
//! while it holds its state lock; this type only stores the flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::handle::HandleCore;
use crate::lock;
use crate::transport::BundleContent;

/// A loaded bundle: its content plus the dependencies it keeps alive.
pub struct BundleHandle {
    core: HandleCore,
    /// No direct holder; alive only for dependents.
    dependency_only: AtomicBool,
    /// Whether this bundle currently counts one reference on each dependency.
    holds_dependencies: AtomicBool,
    content: Mutex<Option<Arc<dyn BundleContent>>>,
    dependencies: Mutex<Vec<Arc<BundleHandle>>>,
}

impl std::fmt::Debug for BundleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleHandle")
            .field("name", &self.name())
            .field("ref_count", &self.ref_count())
            .field("dependency_only", &self.is_dependency_only())
            .field("dependencies", &self.dependency_names())
            .finish()
    }
}

impl BundleHandle {
    /// A freshly loaded bundle. It starts with no holders and counts one
    /// reference on every dependency attached before it is published.
    pub fn new(
        name: impl Into<String>,
        content: Arc<dyn BundleContent>,
        size_bytes: u64,
        load_time_ms: f64,
    ) -> Self {
        let name = name.into();
        let core = HandleCore::new(name.clone(), name);
        core.set_load_info(size_bytes, load_time_ms);
        Self {
            core,
            dependency_only: AtomicBool::new(true),
            holds_dependencies: AtomicBool::new(true),
            content: Mutex::new(Some(content)),
            dependencies: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.core.path()
    }

    pub fn core(&self) -> &HandleCore {
        &self.core
    }

    pub fn ref_count(&self) -> usize {
        self.core.ref_count()
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    pub fn is_valid(&self) -> bool {
        !self.is_disposed() && lock(&self.content).is_some()
    }

    pub fn is_dependency_only(&self) -> bool {
        self.dependency_only.load(Ordering::Acquire)
    }

    pub(crate) fn set_dependency_only(&self, value: bool) {
        self.dependency_only.store(value, Ordering::Release);
    }

    pub(crate) fn holds_dependencies(&self) -> bool {
        self.holds_dependencies.load(Ordering::Acquire)
    }

    pub(crate) fn set_holds_dependencies(&self, value: bool) {
        self.holds_dependencies.store(value, Ordering::Release);
    }

    pub fn content(&self) -> Option<Arc<dyn BundleContent>> {
        lock(&self.content).clone()
    }

    pub fn size_bytes(&self) -> u64 {
        self.core.file_size_bytes()
    }

    pub fn load_time_ms(&self) -> f64 {
        self.core.last_load_time_ms()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.core.loaded_at()
    }

    pub fn dependencies(&self) -> Vec<Arc<BundleHandle>> {
        lock(&self.dependencies).clone()
    }

    pub fn dependency_names(&self) -> Vec<String> {
        lock(&self.dependencies)
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Attaches a dependency. Does not change any count; ignores duplicates.
    pub fn add_dependency(&self, dependency: Arc<BundleHandle>) {
        let mut deps = lock(&self.dependencies);
        if !deps.iter().any(|d| d.name() == dependency.name()) {
            deps.push(dependency);
        }
    }

    pub(crate) fn retain(&self) -> usize {
        self.core.retain()
    }

    pub(crate) fn release(&self) -> usize {
        self.core.release()
    }

    pub(crate) fn drain(&self) -> usize {
        self.core.drain()
    }

    /// Unloads the content and detaches dependencies. Idempotent.
    pub fn dispose(&self) {
        if !self.core.mark_disposed() {
            return;
        }
        if let Some(content) = lock(&self.content).take() {
            content.unload();
        }
        lock(&self.dependencies).clear();
        debug!(bundle = %self.name(), "Bundle disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::PackedArchive;
    use crate::transport::ArchiveContent;

    fn bundle(name: &str) -> Arc<BundleHandle> {
        let content = Arc::new(ArchiveContent::new(PackedArchive::new()));
        Arc::new(BundleHandle::new(name, content, 128, 1.5))
    }

    #[test]
    fn new_bundle_is_dependency_only_and_unreferenced() {
        let b = bundle("ui.bundle");
        assert_eq!(b.ref_count(), 0);
        assert!(b.is_dependency_only());
        assert!(b.holds_dependencies());
        assert!(b.is_valid());
        assert_eq!(b.size_bytes(), 128);
    }

    #[test]
    fn add_dependency_ignores_duplicates() {
        let b = bundle("ui.bundle");
        let common = bundle("common.bundle");
        b.add_dependency(Arc::clone(&common));
        b.add_dependency(common);
        assert_eq!(b.dependency_names(), vec!["common.bundle".to_string()]);
    }

    #[test]
    fn dispose_unloads_once() {
        let b = bundle("ui.bundle");
        b.add_dependency(bundle("common.bundle"));
        b.dispose();
        b.dispose();
        assert!(!b.is_valid());
        assert!(b.content().is_none());
        assert!(b.dependencies().is_empty());
    }
}
