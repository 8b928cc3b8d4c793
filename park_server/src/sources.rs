//! Frame sources for the detection loop.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Result};
use image::{ImageFormat, RgbImage};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::data_socket::FrameReceiver;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Images from a directory in name order, or a single image, paced at a frame rate.
pub struct ImageDirSource {
    files: Vec<PathBuf>,
    index: usize,
    loop_video: bool,
    pacing: Option<Interval>,
}

impl ImageDirSource {
    pub fn open(path: impl AsRef<Path>, fps: f32, loop_video: bool) -> Result<Self> {
        let path = path.as_ref();

        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image(p))
                .collect();
            files.sort();
            files
        } else if path.is_file() {
            vec![path.to_owned()]
        } else {
            bail!("video source {} does not exist", path.display());
        };

        if files.is_empty() {
            bail!("no jpg or png images in {}", path.display());
        }
        log::info!("Reading {} frames from {}", files.len(), path.display());

        // Non-positive or non-finite rates read frames unpaced
        let period = (fps > 0.0)
            .then(|| Duration::try_from_secs_f32(1.0 / fps).ok())
            .flatten()
            .filter(|period| !period.is_zero());
        let pacing = period.map(|period| {
            let mut pacing = interval(period);
            pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pacing
        });

        Ok(Self {
            files,
            index: 0,
            loop_video,
            pacing,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The next decodable frame, `None` at the end of a non-looping source.
    pub async fn next_frame(&mut self) -> Option<RgbImage> {
        let mut failures = 0;
        while failures < self.files.len() {
            if self.index >= self.files.len() {
                if !self.loop_video {
                    return None;
                }
                self.index = 0;
            }

            let path = &self.files[self.index];
            self.index += 1;

            if let Some(pacing) = self.pacing.as_mut() {
                pacing.tick().await;
            }

            match image::open(path) {
                Ok(frame) => return Some(frame.to_rgb8()),
                Err(e) => {
                    log::warn!("Skipping unreadable frame {}: {e}", path.display());
                    failures += 1;
                }
            }
        }

        log::error!("No readable frames left");
        None
    }
}

pub enum FrameSource {
    Files(ImageDirSource),
    Socket(FrameReceiver),
}

impl FrameSource {
    pub async fn next_frame(&mut self) -> Option<RgbImage> {
        match self {
            FrameSource::Files(source) => source.next_frame().await,
            FrameSource::Socket(frame_rx) => loop {
                let slot = frame_rx.recv_ref().await?;
                match image::load_from_memory_with_format(&slot.jpeg, ImageFormat::Jpeg) {
                    Ok(frame) => return Some(frame.to_rgb8()),
                    Err(e) => log::warn!("Skipping undecodable frame of {}: {e}", slot.camera_id),
                }
            },
        }
    }
}
