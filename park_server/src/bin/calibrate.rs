//! Calibrate the pixel threshold on labelled frames.
//!
//! The manifest is a TOML file with one `[[sample]]` table per frame:
//!
//! ```toml
//! [[sample]]
//! image = "frames/morning.jpg"
//! expected = ["OCCUPIED", "FREE"]
//! ```
//!
//! Image paths are relative to the manifest, `expected` lists the slot states in zone order.
use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::TimestampPrecision;
use park_server::{
    config::Config,
    detector::{threshold::CalibrationSample, SlotStatus, ThresholdDetector},
};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Path of the TOML configuration
    #[clap(long, default_value = "config/smartpark.toml")]
    config: PathBuf,

    /// Manifest of labelled frames
    #[clap(long)]
    manifest: PathBuf,

    /// Store the calibrated threshold in the configuration
    #[clap(long)]
    write: bool,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    sample: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    image: PathBuf,
    expected: Vec<SlotStatus>,
}

fn load_samples(manifest_path: &Path, config: &Config) -> Result<Vec<CalibrationSample>> {
    let content = fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let manifest: Manifest = toml::from_str(&content)
        .with_context(|| format!("failed to parse manifest {}", manifest_path.display()))?;
    let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let zones = config.parking_zones();
    let mut samples = vec![];
    for entry in manifest.sample {
        if entry.expected.len() != zones.len() {
            bail!(
                "{} labels {} zones, the configuration has {}",
                entry.image.display(),
                entry.expected.len(),
                zones.len()
            );
        }
        if entry.expected.contains(&SlotStatus::Unknown) {
            bail!("{} has an UNKNOWN label", entry.image.display());
        }

        let image_path = base_dir.join(&entry.image);
        let frame = image::open(&image_path)
            .with_context(|| format!("failed to open {}", image_path.display()))?
            .to_rgb8();

        samples.push(CalibrationSample {
            frame,
            zones: zones.clone(),
            expected: entry
                .expected
                .iter()
                .map(|status| *status == SlotStatus::Occupied)
                .collect(),
        });
    }

    Ok(samples)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let mut config = Config::load(&args.config)?;
    let samples = load_samples(&args.manifest, &config)?;

    let mut detector = ThresholdDetector::new(config.detectors.threshold.clone());
    let threshold = detector.calibrate_threshold(&samples)?;
    println!("Best threshold: {threshold}");

    if args.write {
        config.detectors.threshold.threshold = threshold;
        config.save(&args.config)?;
        println!("Threshold stored in {}", args.config.display());
    }

    Ok(())
}
