//! Loader configuration.
//!
//! Loaded from JSON strings/files. The play mode decides which transport the
//! loader is built with.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which transport materialises bundle content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayMode {
    /// Authoring mode: read source files directly, no bundles.
    Bypass,
    /// Read archives from local storage only.
    Offline,
    /// Make sure archives are downloaded and valid, then read them locally.
    Online,
    /// Fetch archives over the network on every load.
    Streaming,
}

/// Root loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub play_mode: PlayMode,
    /// Archives shipped with the application (read-only).
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: PathBuf,
    /// Downloaded archives. Checked before `bundle_dir`.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Base URL (or mirror root) for online and streaming modes.
    #[serde(default)]
    pub remote_url: String,
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    /// Root of authoring sources for bypass mode.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    /// Log every load with its timing at info level.
    #[serde(default)]
    pub detail_log: bool,
    /// Run the background preload scheduler.
    #[serde(default = "default_true")]
    pub enable_preload: bool,
    /// Preloads running at once.
    #[serde(default = "default_max_preload_tasks")]
    pub max_preload_tasks: usize,
    /// Memory in use at which only high-priority preloads start. 0 disables.
    #[serde(default = "default_memory_warning_bytes")]
    pub memory_warning_bytes: u64,
    /// Memory in use at which preloading stops. 0 disables.
    #[serde(default = "default_memory_critical_bytes")]
    pub memory_critical_bytes: u64,
    /// Sweep unused content when memory becomes critical.
    #[serde(default = "default_true")]
    pub auto_unload: bool,
}

fn default_bundle_dir() -> PathBuf {
    PathBuf::from("bundles")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_manifest_file() -> String {
    "manifest.json".to_string()
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("assets")
}

fn default_true() -> bool {
    true
}

fn default_max_preload_tasks() -> usize {
    3
}

fn default_memory_warning_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_memory_critical_bytes() -> u64 {
    768 * 1024 * 1024
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            play_mode: PlayMode::Offline,
            bundle_dir: default_bundle_dir(),
            cache_dir: default_cache_dir(),
            remote_url: String::new(),
            manifest_file: default_manifest_file(),
            source_dir: default_source_dir(),
            detail_log: false,
            enable_preload: default_true(),
            max_preload_tasks: default_max_preload_tasks(),
            memory_warning_bytes: default_memory_warning_bytes(),
            memory_critical_bytes: default_memory_critical_bytes(),
            auto_unload: default_true(),
        }
    }
}

impl LoaderConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Where the manifest lives: next to the shipped bundles.
    pub fn manifest_path(&self) -> PathBuf {
        self.bundle_dir.join(&self.manifest_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg = LoaderConfig::from_json_str(r#"{ "play_mode": "online" }"#).unwrap();
        assert_eq!(cfg.play_mode, PlayMode::Online);
        assert_eq!(cfg.bundle_dir, PathBuf::from("bundles"));
        assert_eq!(cfg.cache_dir, PathBuf::from("cache"));
        assert_eq!(cfg.manifest_file, "manifest.json");
        assert!(!cfg.detail_log);
        assert!(cfg.enable_preload && cfg.auto_unload);
        assert_eq!(cfg.max_preload_tasks, 3);
        assert!(cfg.memory_warning_bytes < cfg.memory_critical_bytes);
    }

    #[test]
    fn preload_settings_parse() {
        let cfg = LoaderConfig::from_json_str(
            r#"{ "play_mode": "offline", "enable_preload": false, "max_preload_tasks": 8,
                 "memory_warning_bytes": 100, "memory_critical_bytes": 200, "auto_unload": false }"#,
        )
        .unwrap();
        assert!(!cfg.enable_preload && !cfg.auto_unload);
        assert_eq!(cfg.max_preload_tasks, 8);
        assert_eq!((cfg.memory_warning_bytes, cfg.memory_critical_bytes), (100, 200));
    }

    #[test]
    fn unknown_play_mode_is_rejected() {
        assert!(LoaderConfig::from_json_str(r#"{ "play_mode": "webgl" }"#).is_err());
    }

    #[test]
    fn manifest_path_is_under_bundle_dir() {
        let cfg = LoaderConfig {
            bundle_dir: PathBuf::from("/data/bundles"),
            ..LoaderConfig::default()
        };
        assert_eq!(cfg.manifest_path(), PathBuf::from("/data/bundles/manifest.json"));
    }
}
