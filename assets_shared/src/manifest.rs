//! Bundle manifest.
//!
//! The manifest is produced by the build pipeline and describes every bundle:
//! its file identity, the asset paths it owns and the bundles it depends on.
//! The loader only reads it; the dependency graph is static for a session.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Metadata for one bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleInfo {
    pub name: String,
    /// Content hash, appended to the on-disk file name.
    pub hash: String,
    pub crc: u32,
    /// Archive size in bytes.
    pub size: u64,
    /// The bundle is a single raw file rather than a packed archive.
    pub is_raw_file: bool,
    pub is_encrypted: bool,
    pub tags: Vec<String>,
    /// Bundle names this bundle needs loaded first, in load order.
    pub dependencies: Vec<String>,
    /// Asset paths owned by this bundle.
    pub assets: Vec<String>,
    /// 0-10, higher loads first when preloading.
    pub priority: u8,
}

impl BundleInfo {
    /// Creates an empty bundle description.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assets = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn raw_file(mut self) -> Self {
        self.is_raw_file = true;
        self
    }

    /// On-disk file name: `{name}_{hash}`, or just the name when unhashed.
    pub fn file_name(&self) -> String {
        if self.hash.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.name, self.hash)
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ManifestIndex {
    by_name: HashMap<String, usize>,
    by_asset: HashMap<String, usize>,
    by_tag: HashMap<String, Vec<usize>>,
}

/// The full bundle manifest for one build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleManifest {
    pub version: String,
    pub build_time: String,
    pub platform: String,
    bundles: Vec<BundleInfo>,
    #[serde(skip)]
    index: OnceLock<ManifestIndex>,
}

impl BundleManifest {
    /// Creates a manifest from a list of bundles.
    pub fn new(bundles: Vec<BundleInfo>) -> Self {
        Self {
            bundles,
            ..Self::default()
        }
    }

    pub fn bundles(&self) -> &[BundleInfo] {
        &self.bundles
    }

    /// Takes the bundle list out, leaving the manifest empty.
    pub fn into_bundles(self) -> Vec<BundleInfo> {
        self.bundles
    }

    /// Replaces the bundle list. Lookups are re-indexed on next use.
    pub fn set_bundles(&mut self, bundles: Vec<BundleInfo>) {
        self.bundles = bundles;
        self.index = OnceLock::new();
    }

    /// Adds a bundle, replacing any bundle of the same name.
    pub fn insert_bundle(&mut self, info: BundleInfo) {
        match self.bundles.iter_mut().find(|b| b.name == info.name) {
            Some(existing) => *existing = info,
            None => self.bundles.push(info),
        }
        self.index = OnceLock::new();
    }

    /// Parses a manifest from JSON.
    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        serde_json::from_str(s).context("parse bundle manifest")
    }

    /// Serializes the manifest as pretty JSON.
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("serialize bundle manifest")
    }

    fn index(&self) -> &ManifestIndex {
        self.index.get_or_init(|| {
            let mut index = ManifestIndex::default();
            for (i, bundle) in self.bundles.iter().enumerate() {
                index.by_name.insert(bundle.name.clone(), i);
                for asset in &bundle.assets {
                    index.by_asset.insert(asset.clone(), i);
                }
                for tag in &bundle.tags {
                    index.by_tag.entry(tag.clone()).or_default().push(i);
                }
            }
            index
        })
    }

    /// Looks up a bundle by name.
    pub fn bundle_info(&self, name: &str) -> Option<&BundleInfo> {
        self.index().by_name.get(name).map(|&i| &self.bundles[i])
    }

    /// Returns the bundle that owns an asset path.
    pub fn bundle_by_asset(&self, path: &str) -> Option<&BundleInfo> {
        self.index().by_asset.get(path).map(|&i| &self.bundles[i])
    }

    pub fn bundle_name_by_asset(&self, path: &str) -> Option<&str> {
        self.bundle_by_asset(path).map(|b| b.name.as_str())
    }

    pub fn contains_asset(&self, path: &str) -> bool {
        self.index().by_asset.contains_key(path)
    }

    /// Whether the asset lives in a raw-file bundle.
    pub fn is_raw_file(&self, path: &str) -> bool {
        self.bundle_by_asset(path).is_some_and(|b| b.is_raw_file)
    }

    /// Every asset path in the manifest.
    pub fn asset_paths(&self) -> Vec<&str> {
        self.bundles
            .iter()
            .flat_map(|b| b.assets.iter().map(String::as_str))
            .collect()
    }

    pub fn bundles_by_tag(&self, tag: &str) -> Vec<&BundleInfo> {
        self.index()
            .by_tag
            .get(tag)
            .map(|ids| ids.iter().map(|&i| &self.bundles[i]).collect())
            .unwrap_or_default()
    }

    /// Union of the bundles carrying any of the tags.
    pub fn bundles_by_tags<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> Vec<&BundleInfo> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tag in tags {
            for bundle in self.bundles_by_tag(tag) {
                if seen.insert(bundle.name.as_str()) {
                    out.push(bundle);
                }
            }
        }
        out
    }

    /// Every transitive dependency of a bundle, depth first, without duplicates.
    pub fn all_dependencies(&self, name: &str) -> Vec<&BundleInfo> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.collect_dependencies(name, &mut out, &mut visited);
        out
    }

    fn collect_dependencies<'a>(
        &'a self,
        name: &str,
        out: &mut Vec<&'a BundleInfo>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }
        let Some(bundle) = self.bundle_info(name) else {
            return;
        };
        for dep in &bundle.dependencies {
            if let Some(info) = self.bundle_info(dep) {
                if !out.iter().any(|b| b.name == info.name) {
                    out.push(info);
                    self.collect_dependencies(dep, out, visited);
                }
            }
        }
    }

    /// Bundles needed to load an asset: dependencies first, owner last.
    pub fn required_bundles(&self, path: &str) -> Vec<&BundleInfo> {
        let Some(owner) = self.bundle_by_asset(path) else {
            return Vec::new();
        };
        let mut out = self.all_dependencies(&owner.name);
        out.push(owner);
        out
    }

    pub fn asset_count(&self) -> usize {
        self.bundles.iter().map(|b| b.assets.len()).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.bundles.iter().map(|b| b.size).sum()
    }

    pub fn size_by_tag(&self, tag: &str) -> u64 {
        self.bundles_by_tag(tag).iter().map(|b| b.size).sum()
    }

    /// Finds a dependency cycle, returned as the chain of bundle names that
    /// closes on itself (`a -> b -> a`). Unknown dependency names are ignored.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            manifest: &'a BundleManifest,
            name: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(name) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                    let mut chain: Vec<String> =
                        stack[start..].iter().map(|n| n.to_string()).collect();
                    chain.push(name.to_string());
                    return Some(chain);
                }
                None => {}
            }
            let info = manifest.bundle_info(name)?;
            marks.insert(name, Mark::Visiting);
            stack.push(name);
            for dep in &info.dependencies {
                if let Some(chain) = visit(manifest, dep, marks, stack) {
                    return Some(chain);
                }
            }
            stack.pop();
            marks.insert(name, Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        self.bundles
            .iter()
            .find_map(|b| visit(self, &b.name, &mut marks, &mut stack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BundleManifest {
        BundleManifest::new(vec![
            BundleInfo::new("common.bundle")
                .with_assets(["ui/font.ttf"])
                .with_tags(["base"])
                .with_size(100),
            BundleInfo::new("ui.bundle")
                .with_assets(["ui/a.png", "ui/b.png"])
                .with_dependencies(["common.bundle"])
                .with_tags(["base", "ui"])
                .with_size(250),
            BundleInfo::new("level1.bundle")
                .with_assets(["levels/level1.scene"])
                .with_dependencies(["ui.bundle", "common.bundle"])
                .with_size(1000),
            BundleInfo::new("config.bundle")
                .with_assets(["config/game.json"])
                .raw_file()
                .with_size(12),
        ])
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    #[test]
    fn resolves_bundles_by_name_and_asset() {
        let m = sample();
        assert_eq!(m.bundle_info("ui.bundle").unwrap().assets.len(), 2);
        assert_eq!(m.bundle_name_by_asset("ui/b.png"), Some("ui.bundle"));
        assert!(m.contains_asset("ui/font.ttf"));
        assert!(!m.contains_asset("ui/missing.png"));
        assert!(m.bundle_info("nope.bundle").is_none());
        assert!(m.is_raw_file("config/game.json"));
        assert!(!m.is_raw_file("ui/a.png"));
    }

    #[test]
    fn file_name_includes_hash_when_present() {
        let mut info = BundleInfo::new("ui.bundle");
        assert_eq!(info.file_name(), "ui.bundle");
        info.hash = "abc123".to_string();
        assert_eq!(info.file_name(), "ui.bundle_abc123");
    }

    #[test]
    fn tags_and_sizes() {
        let m = sample();
        assert_eq!(m.bundles_by_tag("base").len(), 2);
        assert_eq!(m.bundles_by_tags(["base", "ui"]).len(), 2);
        assert_eq!(m.size_by_tag("ui"), 250);
        assert_eq!(m.total_size(), 1362);
        assert_eq!(m.asset_count(), 5);
    }

    // =========================================================================
    // Dependency graph
    // =========================================================================

    #[test]
    fn transitive_dependencies_are_deduplicated() {
        let m = sample();
        let deps: Vec<&str> = m
            .all_dependencies("level1.bundle")
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(deps, vec!["ui.bundle", "common.bundle"]);

        let required: Vec<&str> = m
            .required_bundles("levels/level1.scene")
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(required.last(), Some(&"level1.bundle"));
        assert!(m.required_bundles("nope").is_empty());
    }

    #[test]
    fn acyclic_manifest_has_no_cycle() {
        assert!(sample().find_cycle().is_none());
    }

    #[test]
    fn cycle_is_reported_as_chain() {
        let m = BundleManifest::new(vec![
            BundleInfo::new("a").with_dependencies(["b"]),
            BundleInfo::new("b").with_dependencies(["c"]),
            BundleInfo::new("c").with_dependencies(["a"]),
        ]);
        let chain = m.find_cycle().expect("cycle");
        assert_eq!(chain, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let m = BundleManifest::new(vec![BundleInfo::new("a").with_dependencies(["a"])]);
        assert_eq!(m.find_cycle(), Some(vec!["a".to_string(), "a".to_string()]));
    }

    #[test]
    fn json_roundtrip_rebuilds_index() {
        let m = sample();
        let json = m.to_json().unwrap();
        let back = BundleManifest::from_json_str(&json).unwrap();
        assert_eq!(back.bundles(), m.bundles());
        assert_eq!(back.bundle_name_by_asset("ui/a.png"), Some("ui.bundle"));
    }

    #[test]
    fn edits_after_lookup_are_reindexed() {
        let mut m = BundleManifest::new(vec![
            BundleInfo::new("a").with_assets(["a/x"]),
            BundleInfo::new("b").with_assets(["b/y"]),
        ]);
        assert_eq!(m.bundle_name_by_asset("b/y"), Some("b"));

        let mut rest = m.bundles().to_vec();
        rest.remove(0);
        m.set_bundles(rest);
        assert!(m.bundle_info("a").is_none());
        assert_eq!(m.bundle_info("b").map(|b| b.assets.len()), Some(1));

        m.insert_bundle(BundleInfo::new("c").with_assets(["c/z"]));
        assert_eq!(m.bundle_name_by_asset("c/z"), Some("c"));
        m.insert_bundle(BundleInfo::new("b").with_assets(["b/w"]));
        assert_eq!(m.bundles().len(), 2);
        assert!(!m.contains_asset("b/y"));

        let copy = m.clone();
        assert_eq!(copy.bundle_name_by_asset("b/w"), Some("b"));
    }
}
