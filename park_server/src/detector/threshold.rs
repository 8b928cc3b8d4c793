//! Pixel-count detector.
//!
//! A slot is occupied when the binarized frame shows more white pixels inside the zone than the
//! configured threshold.
use std::time::Instant;

use anyhow::{bail, Result};
use image::{GrayImage, RgbImage};
use serde_json::json;

use super::{DetectionMode, Detections, Ema, SlotDetector, SlotStatus, ZoneDetail, ZoneResult};
use crate::{
    config::ThresholdConfig,
    draw,
    imgproc::{count_white_pixels, preprocess_for_threshold},
    zone::ParkingZone,
};

const MAX_CONFIDENCE: f32 = 0.95;
const MIN_CONFIDENCE: f32 = 0.1;

/// A labelled frame for threshold calibration.
pub struct CalibrationSample {
    pub frame: RgbImage,
    pub zones: Vec<ParkingZone>,
    /// Expected occupancy in zone order.
    pub expected: Vec<bool>,
}

pub struct ThresholdDetector {
    params: ThresholdConfig,
    processed: Option<GrayImage>,
    processing_time: Ema,
    frames_processed: u64,
}

impl ThresholdDetector {
    pub fn new(params: ThresholdConfig) -> Self {
        log::info!(
            "Threshold detector initialized with threshold {}",
            params.threshold
        );
        Self {
            params,
            processed: None,
            processing_time: Ema::default(),
            frames_processed: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.params.threshold
    }

    pub fn update_threshold(&mut self, threshold: u32) {
        log::info!(
            "Threshold updated from {} to {}",
            self.params.threshold,
            threshold
        );
        self.params.threshold = threshold;
    }

    /// Try thresholds from 1000 to 7500 in steps of 500 and keep the most accurate one.
    pub fn calibrate_threshold(&mut self, samples: &[CalibrationSample]) -> Result<u32> {
        if samples.is_empty() {
            bail!("no calibration samples given");
        }

        // Pixel counts do not depend on the threshold, compute them once
        let mut counts = vec![];
        for sample in samples {
            let (_, mask) = preprocess_for_threshold(&sample.frame, &self.params)?;
            for (zone, expected) in sample.zones.iter().zip(sample.expected.iter()) {
                let zone = zone.scaled(self.params.scale_factor);
                counts.push((count_white_pixels(&mask, &zone), *expected));
            }
        }

        if counts.is_empty() {
            bail!("calibration samples contain no labelled zones");
        }

        let mut best_threshold = self.params.threshold;
        let mut best_accuracy = -1.0_f32;
        for threshold in (1000..8000).step_by(500) {
            let correct = counts
                .iter()
                .filter(|(count, expected)| (*count > threshold) == *expected)
                .count();
            let accuracy = correct as f32 / counts.len() as f32;
            log::debug!("Threshold {threshold}: accuracy {:.1}%", accuracy * 100.0);

            if accuracy > best_accuracy {
                best_accuracy = accuracy;
                best_threshold = threshold;
            }
        }

        log::info!(
            "Calibrated threshold {best_threshold} with accuracy {:.1}%",
            best_accuracy * 100.0
        );
        self.update_threshold(best_threshold);

        Ok(best_threshold)
    }

    fn decide(&self, pixel_count: u32) -> (SlotStatus, f32) {
        let threshold = self.params.threshold.max(1) as f32;
        let count = pixel_count as f32;

        let (status, confidence) = if count > threshold {
            (
                SlotStatus::Occupied,
                0.5 + (count - threshold) / (2.0 * threshold),
            )
        } else {
            (SlotStatus::Free, 0.5 + (threshold - count) / threshold)
        };

        (status, confidence.min(MAX_CONFIDENCE).max(MIN_CONFIDENCE))
    }
}

impl SlotDetector for ThresholdDetector {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Threshold
    }

    fn process_frame(&mut self, frame: &RgbImage, zones: &[ParkingZone]) -> Detections {
        let start = Instant::now();

        let mask = match preprocess_for_threshold(frame, &self.params) {
            Ok((_, mask)) => mask,
            Err(e) => {
                log::error!("Threshold preprocessing failed: {e}");
                return zones
                    .iter()
                    .map(|zone| {
                        (
                            zone.code.clone(),
                            ZoneResult::unknown(zone.id, "threshold", e.to_string()),
                        )
                    })
                    .collect();
            }
        };

        let counts: Vec<_> = zones
            .iter()
            .map(|zone| count_white_pixels(&mask, &zone.scaled(self.params.scale_factor)))
            .collect();

        let processing_time = start.elapsed().as_secs_f64();
        let results = zones
            .iter()
            .zip(counts)
            .map(|(zone, pixel_count)| {
                let (status, confidence) = self.decide(pixel_count);
                (
                    zone.code.clone(),
                    ZoneResult {
                        status,
                        confidence,
                        zone_id: zone.id,
                        method: "threshold".into(),
                        processing_time,
                        detail: ZoneDetail::Threshold {
                            pixel_count,
                            threshold_used: self.params.threshold,
                        },
                        error: None,
                    },
                )
            })
            .collect();

        self.processed = Some(mask);
        self.processing_time.update(processing_time);
        self.frames_processed += 1;

        results
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "method": "threshold",
            "threshold": self.params.threshold,
            "scale_factor": self.params.scale_factor,
            "frames_processed": self.frames_processed,
            "avg_processing_time": self.processing_time.get(),
        })
    }

    fn draw_debug(
        &self,
        frame: &RgbImage,
        zones: &[ParkingZone],
        results: &Detections,
    ) -> RgbImage {
        let mut debug = frame.clone();
        draw::draw_zones(&mut debug, zones, results);
        debug
    }

    fn processed_frame(&self) -> Option<&GrayImage> {
        self.processed.as_ref()
    }
}
