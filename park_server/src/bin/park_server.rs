//! Park server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use park_server::{
    config::Config,
    data_socket::{frame_channel, spawn_data_socket},
    detector::DetectionMode,
    endpoints::{router, SharedMonitor},
    meter::spawn_meter_logger,
    monitor::{MonitorOptions, ParkMonitor},
    pipeline::{run_detection, spawn_heartbeat, HEARTBEAT_INTERVAL},
    sources::{FrameSource, ImageDirSource},
};
use tokio::sync::{broadcast, Mutex};

const DEBUG_STREAM_CAPACITY: usize = 4;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Path of the TOML configuration
    #[clap(long, default_value = "config/smartpark.toml")]
    config: PathBuf,

    /// Detection mode: threshold, yolo or hybrid
    #[clap(long)]
    mode: Option<String>,

    /// Frame source: an image directory, a single image, or `socket`
    #[clap(long)]
    source: Option<String>,

    /// Do not report to the backend
    #[clap(long)]
    no_api: bool,

    /// Log filter, overrides RUST_LOG and the config file
    #[clap(long)]
    log_level: Option<String>,

    /// Address of the HTTP server
    #[clap(long)]
    http_address: Option<String>,

    /// Address of the socket receiving camera frames
    #[clap(long)]
    socket_address: Option<String>,

    /// Write a sample configuration to the config path and exit
    #[clap(long)]
    create_config: bool,

    /// Check the configuration for every detection mode and exit
    #[clap(long)]
    validate_config: bool,
}

fn validate_config(config: &Config) -> bool {
    let mut all_valid = true;
    for mode in DetectionMode::ALL {
        let errors = config.validate_for_mode(mode);
        if errors.is_empty() {
            println!("{mode}: valid");
        } else {
            all_valid = false;
            println!("{mode}: invalid");
            for error in errors {
                println!("  - {error}");
            }
        }
    }
    all_valid
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.create_config {
        Config::default().save(&args.config)?;
        println!("Sample configuration written to {}", args.config.display());
        return Ok(());
    }

    let mut config = Config::load(&args.config)?;

    // Setup logger
    let mut logger =
        env_logger::Builder::from_env(Env::default().default_filter_or(&config.logging.level));
    if let Some(level) = &args.log_level {
        logger.parse_filters(level);
    }
    logger
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    if args.validate_config {
        if !validate_config(&config) {
            bail!("configuration {} is invalid", args.config.display());
        }
        return Ok(());
    }

    if let Some(source) = args.source {
        config.video.source = source;
    }
    if let Some(http_address) = args.http_address {
        config.server.http_address = http_address;
    }
    if let Some(socket_address) = args.socket_address {
        config.server.socket_address = socket_address;
    }
    let mode: DetectionMode = match &args.mode {
        Some(mode) => mode.parse()?,
        None => DetectionMode::Threshold,
    };

    let source = if config.video.source == "socket" {
        let (frame_tx, frame_rx) = frame_channel(2);
        spawn_data_socket(frame_tx, &config.server.socket_address).await?;
        FrameSource::Socket(frame_rx)
    } else {
        FrameSource::Files(ImageDirSource::open(
            &config.video.source,
            config.video.fps,
            config.video.loop_video,
        )?)
    };

    let http_address: SocketAddr = config.server.http_address.parse()?;
    let options = MonitorOptions {
        enable_api: !args.no_api,
        ..Default::default()
    };
    let monitor: SharedMonitor = Arc::new(Mutex::new(ParkMonitor::new(config, mode, options).await?));
    let (debug_tx, _) = broadcast::channel(DEBUG_STREAM_CAPACITY);

    {
        let monitor = monitor.clone();
        let debug_tx = debug_tx.clone();
        tokio::spawn(async move { run_detection(monitor, source, debug_tx).await });
    }

    if !args.no_api {
        spawn_heartbeat(monitor.clone(), HEARTBEAT_INTERVAL);
    }

    spawn_meter_logger();

    // Serve HTTP server until Ctrl-C
    log::info!("HTTP server listening on {http_address}");
    axum::Server::bind(&http_address)
        .serve(router(monitor.clone(), debug_tx).into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
            }
        })
        .await?;

    log::info!("Shutting down");
    monitor.lock().await.close().await?;

    Ok(())
}
