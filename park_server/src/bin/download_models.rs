//! Fetch YOLO model files.
//!
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use env_logger::TimestampPrecision;
use park_server::{
    config::Config,
    models::{download_model, model_info, AVAILABLE_MODELS},
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Path of the TOML configuration
    #[clap(long, default_value = "config/smartpark.toml")]
    config: PathBuf,

    /// List the known models and exit
    #[clap(long)]
    list: bool,

    /// Model file to fetch, defaults to the configured one
    #[clap(long)]
    model: Option<String>,

    /// Target directory, defaults to the configured one
    #[clap(long)]
    models_dir: Option<PathBuf>,

    /// Download even if the file exists
    #[clap(long)]
    force: bool,

    /// Base URL to download from, defaults to the configured one
    #[clap(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    if args.list {
        for info in AVAILABLE_MODELS.iter() {
            println!("{:<14} {}", info.name, info.description);
            println!("{:<14} recommended for {}", "", info.recommended_for);
        }
        return Ok(());
    }

    let yolo = Config::load(&args.config)?.detectors.yolo;
    let model = args.model.unwrap_or(yolo.model);
    let models_dir = args.models_dir.unwrap_or(yolo.models_dir);
    let Some(url) = args.url.or(yolo.download_url) else {
        bail!("no download URL given, pass --url or set detectors.yolo.download_url");
    };

    if model_info(&model).is_none() {
        log::warn!("{model} is not a known model, trying anyway");
    }

    let path = download_model(&url, &model, &models_dir, args.force).await?;
    println!("Model ready at {}", path.display());

    Ok(())
}
