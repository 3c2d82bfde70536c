//! Line console driving one `AssetLoader`.
//!
//! Commands:
//!   load <path>                      - load an asset (one reference)
//!   raw <path> / text <path>         - load a raw file as bytes / text
//!   scene <path> [additive] [paused] - open a scene
//!   activate <path>                  - activate a paused scene
//!   release <path>                   - drop one reference
//!   force_release <path>             - drop every reference on a path
//!   unload_bundle <name>             - force unload a bundle and its handles
//!   release_all                      - force release every handle
//!   sweep                            - dispose everything unreferenced
//!   status [json]                    - cache contents
//!   pack <out> <entry>=<file>...     - write a packed archive
//!   preload <path> [priority]        - queue a background load
//!   preload_cancel <path>|all        - drop queued or running preloads
//!   preload_pause / preload_resume   - hold or restart the preload queue
//!   preload_release <path>|all       - give back preloaded references
//!   memory                           - memory state and preload counters
//!   quit

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use assets_shared::archive::PackedArchive;
use assets_shared::prelude::*;
use bytes::Bytes;
use tracing::info;

pub struct Console {
    loader: AssetLoader,
    preload: PreloadManager,
    scenes: HashMap<String, Arc<SceneHandle>>,
    cancel: CancellationToken,
    quit: bool,
}

impl Console {
    pub fn new(loader: AssetLoader, preload: PreloadManager) -> Self {
        Self {
            loader,
            preload,
            scenes: HashMap::new(),
            cancel: CancellationToken::new(),
            quit: false,
        }
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Returns preloaded references and stops the preload scheduler.
    pub async fn shutdown(&self) {
        self.preload.release_all();
        self.preload.shutdown().await;
    }

    /// Runs one command line and returns the lines to print.
    pub async fn exec(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = tokens.split_first() else {
            return Ok(Vec::new());
        };

        match cmd {
            "load" => {
                let [path] = args else {
                    return Ok(usage("load <path>"));
                };
                Ok(match self.loader.load_asset(path, &self.cancel).await {
                    Some(handle) => {
                        self.preload.record_access(path);
                        vec![format!("Loaded {path} (refs {})", handle.ref_count())]
                    }
                    None => vec![format!("Failed to load {path}")],
                })
            }
            "raw" => {
                let [path] = args else {
                    return Ok(usage("raw <path>"));
                };
                Ok(match self.loader.load_raw_file(path, &self.cancel).await {
                    Some(bytes) => vec![format!("{path}: {} bytes", bytes.len())],
                    None => vec![format!("Failed to load {path}")],
                })
            }
            "text" => {
                let [path] = args else {
                    return Ok(usage("text <path>"));
                };
                Ok(match self.loader.load_raw_file_text(path, &self.cancel).await {
                    Some(text) => text.lines().map(str::to_string).collect(),
                    None => vec![format!("Failed to load {path}")],
                })
            }
            "scene" => {
                let Some((path, flags)) = args.split_first() else {
                    return Ok(usage("scene <path> [additive] [paused]"));
                };
                let mode = if flags.contains(&"additive") {
                    LoadSceneMode::Additive
                } else {
                    LoadSceneMode::Single
                };
                let activate = !flags.contains(&"paused");
                let handle = self.loader.load_scene(path, mode, activate, &self.cancel).await;
                if let Some(err) = handle.error() {
                    return Ok(vec![format!("Scene {path} failed: {err:#}")]);
                }
                let line = format!(
                    "Scene {path} open (active: {}, refs {})",
                    handle.is_activated(),
                    handle.ref_count()
                );
                self.scenes.insert(path.to_string(), handle);
                Ok(vec![line])
            }
            "activate" => {
                let [path] = args else {
                    return Ok(usage("activate <path>"));
                };
                let handle = self
                    .scenes
                    .get(*path)
                    .with_context(|| format!("scene {path} was not opened here"))?;
                self.loader.activate_scene(handle).await?;
                Ok(vec![format!("Scene {path} activated")])
            }
            "release" => {
                let [path] = args else {
                    return Ok(usage("release <path>"));
                };
                self.loader.release(path);
                Ok(vec![self.ref_line(path)])
            }
            "force_release" => {
                let [path] = args else {
                    return Ok(usage("force_release <path>"));
                };
                self.loader.force_release_asset(path);
                Ok(vec![self.ref_line(path)])
            }
            "unload_bundle" => {
                let [name] = args else {
                    return Ok(usage("unload_bundle <name>"));
                };
                Ok(if self.loader.force_unload_bundle(name) {
                    vec![format!("Bundle {name} force unloaded")]
                } else {
                    vec![format!("Bundle {name} is not loaded")]
                })
            }
            "release_all" => {
                self.loader.force_release_all();
                Ok(vec!["All handles released".to_string()])
            }
            "sweep" => {
                let report = self.loader.unload_unused().await;
                self.scenes.retain(|_, h| h.is_valid());
                Ok(vec![format!(
                    "Swept {} handles and {} bundles",
                    report.assets, report.bundles
                )])
            }
            "status" => {
                let snap = self.loader.snapshot();
                if args.first() == Some(&"json") {
                    return Ok(vec![serde_json::to_string_pretty(&snap)?]);
                }
                let mut out = vec![format!(
                    "Transport: {}  handles: {}  bundles: {} ({} bytes)  loading: {}",
                    self.loader.transport_name(),
                    snap.handles.len(),
                    snap.bundles.len(),
                    snap.total_bundle_bytes(),
                    snap.loading.len()
                )];
                for h in &snap.handles {
                    out.push(format!(
                        "  {:?} {} [{}] refs={} valid={} {:.1}ms",
                        h.kind, h.path, h.bundle, h.ref_count, h.valid, h.load_time_ms
                    ));
                }
                for b in &snap.bundles {
                    out.push(format!(
                        "  bundle {} refs={} dep_only={} deps={:?}",
                        b.name, b.ref_count, b.dependency_only, b.dependencies
                    ));
                }
                Ok(out)
            }
            "pack" => {
                let Some((out, entries)) = args.split_first() else {
                    return Ok(usage("pack <out> <entry>=<file>..."));
                };
                let count = pack(Path::new(out), entries).await?;
                Ok(vec![format!("Packed {count} entries into {out}")])
            }
            "preload" => {
                let (path, priority) = match args {
                    [path] => (*path, PreloadPriority::default()),
                    [path, priority] => (*path, priority.parse::<PreloadPriority>()?),
                    _ => return Ok(usage("preload <path> [low|normal|high|critical]")),
                };
                Ok(if self.preload.request(path, priority) {
                    vec![format!("Queued {path} ({priority:?})")]
                } else {
                    vec![format!("Not queued: {path}")]
                })
            }
            "preload_cancel" => match args {
                ["all"] => Ok(vec![format!("Cancelled {} preloads", self.preload.cancel_all())]),
                [path] => Ok(if self.preload.cancel(path) {
                    vec![format!("Cancelled {path}")]
                } else {
                    vec![format!("No preload for {path}")]
                }),
                _ => Ok(usage("preload_cancel <path>|all")),
            },
            "preload_pause" => {
                self.preload.pause();
                Ok(vec!["Preloading paused".to_string()])
            }
            "preload_resume" => {
                self.preload.resume();
                Ok(vec!["Preloading resumed".to_string()])
            }
            "preload_release" => match args {
                ["all"] => Ok(vec![format!("Released {} preloads", self.preload.release_all())]),
                [path] => {
                    self.preload.release(path);
                    Ok(vec![self.ref_line(path)])
                }
                _ => Ok(usage("preload_release <path>|all")),
            },
            "memory" => {
                let monitor = self.preload.monitor();
                let state = monitor.poll().await;
                let stats = self.preload.stats();
                Ok(vec![
                    format!("Memory: {} bytes ({state:?})", monitor.used_bytes()),
                    format!(
                        "Preload: pending {} active {} preloaded {} failed {}{}",
                        stats.pending,
                        stats.active,
                        stats.preloaded,
                        stats.failed,
                        if self.preload.is_paused() { " (paused)" } else { "" }
                    ),
                ])
            }
            "help" => Ok(HELP.lines().map(str::to_string).collect()),
            "quit" | "exit" => {
                info!("Console quitting");
                self.quit = true;
                Ok(Vec::new())
            }
            other => Ok(vec![format!("Unknown command: {other} (try 'help')")]),
        }
    }

    fn ref_line(&self, path: &str) -> String {
        match self.loader.handle(path) {
            Some(h) => format!("{path}: refs {}", h.core().ref_count()),
            None => format!("{path}: not loaded"),
        }
    }
}

const HELP: &str = "\
load <path> | raw <path> | text <path>
scene <path> [additive] [paused] | activate <path>
release <path> | force_release <path> | unload_bundle <name> | release_all
sweep | status [json] | pack <out> <entry>=<file>... | quit
preload <path> [priority] | preload_cancel <path>|all | preload_release <path>|all
preload_pause | preload_resume | memory";

fn usage(form: &str) -> Vec<String> {
    vec![format!("Usage: {form}")]
}

/// Writes `entries` (`name=file` pairs) into a packed archive at `out`.
pub async fn pack(out: &Path, entries: &[&str]) -> anyhow::Result<usize> {
    if entries.is_empty() {
        bail!("nothing to pack");
    }
    let mut archive = PackedArchive::new();
    for entry in entries {
        let Some((name, file)) = entry.split_once('=') else {
            bail!("expected <entry>=<file>, got {entry}");
        };
        let data = tokio::fs::read(file)
            .await
            .with_context(|| format!("read {file}"))?;
        archive.insert(name, Bytes::from(data));
    }
    let encoded = archive.encode()?;
    tokio::fs::write(out, &encoded)
        .await
        .with_context(|| format!("write {}", out.display()))?;
    info!(out = %out.display(), entries = archive.len(), bytes = encoded.len(), "Wrote archive");
    Ok(archive.len())
}
