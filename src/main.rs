//! tvcache CLI

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tvcache::config::Config;
use tvcache::network::{HyperUpstream, Server, Upstream};
use tvcache::recording::Finalizer;
use tvcache::replay::DecisionEngine;
use tvcache::storage::{BlobStore, FsBlobStore, ReplayStore};

fn usage() -> ! {
    eprintln!("tvcache v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: tvcache <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve <config.toml>                 Serve the cached API, proxying misses");
    eprintln!("  capture <config.toml> [replay-id]   Capture one replay and exit");
    eprintln!("  list <data-dir>                     List captured replays");
    process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        usage();
    }

    let result = match args[1].as_str() {
        "serve" => serve(Path::new(&args[2])).await,
        "capture" => capture(Path::new(&args[2]), args.get(3).map(String::as_str)).await,
        "list" => list(PathBuf::from(&args[2])).await,
        command => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'tvcache' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn open(config_path: &Path) -> anyhow::Result<(Config, ReplayStore, Arc<dyn Upstream>)> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.data_dir.clone()));
    let upstream: Arc<dyn Upstream> = Arc::new(HyperUpstream::new(&config.upstream)?);
    Ok((config, ReplayStore::new(blobs), upstream))
}

async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let (config, store, upstream) = open(config_path)?;
    tracing::info!(
        "tvcache v{} proxying {}://{}:{}",
        env!("CARGO_PKG_VERSION"),
        config.upstream.scheme.as_str(),
        config.upstream.host,
        config.upstream.port()
    );

    let engine = Arc::new(DecisionEngine::from_config(
        &config,
        store.clone(),
        Arc::clone(&upstream),
    ));
    let mut server = Server::new(&config, engine);

    if config.capture.trigger_interval_secs > 0 {
        let finalizer = Arc::new(Finalizer::from_config(&config, store, upstream));
        server = server.with_trigger(
            finalizer,
            Duration::from_secs(config.capture.trigger_interval_secs),
        );
    }

    server.run().await?;
    Ok(())
}

async fn capture(config_path: &Path, replay_id: Option<&str>) -> anyhow::Result<()> {
    let (config, store, upstream) = open(config_path)?;
    let finalizer = Finalizer::from_config(&config, store, upstream);

    let report = match replay_id {
        Some(id) => finalizer.capture_id(id).await?,
        None => finalizer.run_once().await?,
    };

    match report {
        Some(report) => {
            println!("Captured {} ({} chunks)", report.id, report.chunks);
            if let Some(confirmed) = report.confirmed {
                println!("  finalized at {} chunks", confirmed.chunks);
            }
            println!("  package: {}", report.package);
        }
        None => println!("Nothing to capture"),
    }
    Ok(())
}

async fn list(data_dir: PathBuf) -> anyhow::Result<()> {
    if !data_dir.is_dir() {
        anyhow::bail!("directory not found: {}", data_dir.display());
    }

    let store = ReplayStore::new(Arc::new(FsBlobStore::new(data_dir.clone())));
    let ids = store.list_replay_ids().await?;

    println!("Data directory: {}", data_dir.display());
    println!("Replays: {}", ids.len());
    println!();

    for id in ids {
        let record = store.read_record(&id).await?;
        println!(
            "{:<32} {:<8} {:>5} chunks  {}",
            id.as_str(),
            record.meta.game_mode.as_deref().unwrap_or("-"),
            record.meta.num_chunks,
            record.start_downloading.state.as_str()
        );
    }
    Ok(())
}
