//! Content loader console.
//!
//! Usage:
//!   assets [--config loader.json] [--mode offline|online|streaming|bypass] [--detail-log]
//!   assets pack <out> <entry>=<file>...
//!
//! Builds one loader from the config, loads its manifest, starts preloading
//! when the config enables it and reads console commands from stdin (`help`
//! lists them).

mod console;

use std::env;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use assets_shared::prelude::*;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::console::Console;

fn parse_mode(s: &str) -> anyhow::Result<PlayMode> {
    Ok(match s {
        "bypass" => PlayMode::Bypass,
        "offline" => PlayMode::Offline,
        "online" => PlayMode::Online,
        "streaming" => PlayMode::Streaming,
        other => bail!("unknown play mode {other}"),
    })
}

fn parse_args(args: &[String]) -> anyhow::Result<LoaderConfig> {
    let mut config_path: Option<PathBuf> = None;
    let mut mode = None;
    let mut detail_log = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                config_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--mode" if i + 1 < args.len() => {
                mode = Some(parse_mode(&args[i + 1])?);
                i += 2;
            }
            "--detail-log" => {
                detail_log = true;
                i += 1;
            }
            other => {
                warn!(arg = %other, "Ignoring unknown argument");
                i += 1;
            }
        }
    }

    let mut cfg = match config_path {
        Some(path) => LoaderConfig::from_file(&path)?,
        None => LoaderConfig::default(),
    };
    if let Some(mode) = mode {
        cfg.play_mode = mode;
    }
    cfg.detail_log |= detail_log;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.get(1).map(String::as_str) == Some("pack") {
        let Some((out, entries)) = args[2..].split_first() else {
            bail!("usage: assets pack <out> <entry>=<file>...");
        };
        let entries: Vec<&str> = entries.iter().map(String::as_str).collect();
        let count = console::pack(Path::new(out), &entries).await?;
        println!("Packed {count} entries into {out}");
        return Ok(());
    }

    let cfg = parse_args(&args)?;
    info!(mode = ?cfg.play_mode, bundle_dir = %cfg.bundle_dir.display(), "Starting loader");

    let loader = AssetLoader::from_config(&cfg, Arc::new(HeadlessHost::new()))
        .context("build loader")?;
    loader
        .initialize_from_config(&cfg)
        .await
        .context("initialize loader")?;
    let preload = PreloadManager::from_config(loader.clone(), &cfg);
    let mut console = Console::new(loader.clone(), preload);

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Loader ready ({}). Type 'help' for commands.", loader.transport_name());

    while let Some(line) = console_rx.recv().await {
        match console.exec(&line).await {
            Ok(out) => {
                for l in out {
                    println!("{l}");
                }
            }
            Err(e) => println!("Error: {e:#}"),
        }
        if console.should_quit() {
            break;
        }
    }

    console.shutdown().await;
    let report = loader.dispose().await;
    info!(assets = report.assets, bundles = report.bundles, "Loader disposed");
    Ok(())
}
