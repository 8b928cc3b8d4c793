//! Slot detectors.
//!
//! Three detectors decide per zone whether a slot is free or occupied: the pixel-count detector on
//! a binarized frame, the YOLO vehicle detector and a hybrid which fuses both.
use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{bail, Error};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::zone::ParkingZone;

pub mod hybrid;
pub mod threshold;
pub mod yolo;

pub use hybrid::HybridDetector;
pub use threshold::ThresholdDetector;
pub use yolo::YoloDetector;

/// Smoothing factor of the moving averages kept in detector statistics.
pub const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Threshold,
    Yolo,
    Hybrid,
}

impl DetectionMode {
    pub const ALL: [DetectionMode; 3] = [
        DetectionMode::Threshold,
        DetectionMode::Yolo,
        DetectionMode::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Threshold => "threshold",
            DetectionMode::Yolo => "yolo",
            DetectionMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "threshold" => Ok(DetectionMode::Threshold),
            "yolo" => Ok(DetectionMode::Yolo),
            "hybrid" => Ok(DetectionMode::Hybrid),
            other => bail!("unknown detection mode '{other}', expected threshold, yolo or hybrid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotStatus {
    Free,
    Occupied,
    Unknown,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Free => "FREE",
            SlotStatus::Occupied => "OCCUPIED",
            SlotStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn from_occupied(occupied: bool) -> Self {
        if occupied {
            SlotStatus::Occupied
        } else {
            SlotStatus::Free
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode-specific details of a zone decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ZoneDetail {
    Threshold {
        pixel_count: u32,
        threshold_used: u32,
    },
    Yolo {
        vehicle_type: Option<String>,
        vehicle_count: usize,
        detections: Vec<yolo::VehicleDetection>,
    },
    Hybrid {
        consensus: bool,
        primary_method: String,
        fusion_strategy: hybrid::FusionStrategy,
        threshold_result: Box<ZoneResult>,
        yolo_result: Box<ZoneResult>,
    },
    None,
}

/// Decision of one detector for one zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneResult {
    pub status: SlotStatus,
    pub confidence: f32,
    pub zone_id: i64,
    /// Name of the method that made the decision. Hybrid results carry the fusion method here.
    pub method: String,
    /// Seconds spent on the whole frame.
    pub processing_time: f64,
    pub detail: ZoneDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ZoneResult {
    /// A result for a zone the detector could not decide on.
    pub fn unknown(zone_id: i64, method: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: SlotStatus::Unknown,
            confidence: 0.0,
            zone_id,
            method: method.into(),
            processing_time: 0.0,
            detail: ZoneDetail::None,
            error: Some(error.into()),
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.status == SlotStatus::Occupied
    }

    pub fn vehicle_type(&self) -> Option<&str> {
        match &self.detail {
            ZoneDetail::Yolo { vehicle_type, .. } => vehicle_type.as_deref(),
            ZoneDetail::Hybrid { yolo_result, .. } => yolo_result.vehicle_type(),
            _ => None,
        }
    }

    pub fn pixel_count(&self) -> Option<u32> {
        match &self.detail {
            ZoneDetail::Threshold { pixel_count, .. } => Some(*pixel_count),
            ZoneDetail::Hybrid {
                threshold_result, ..
            } => threshold_result.pixel_count(),
            _ => None,
        }
    }
}

/// Results of one frame keyed by zone code.
pub type Detections = BTreeMap<String, ZoneResult>;

pub trait SlotDetector: Send {
    fn mode(&self) -> DetectionMode;

    /// Decide on every zone. Failures are reported per zone as `Unknown`, never as error.
    fn process_frame(&mut self, frame: &RgbImage, zones: &[ParkingZone]) -> Detections;

    fn stats(&self) -> serde_json::Value;

    /// Render the detector view of the last decision onto a copy of the frame.
    fn draw_debug(
        &self,
        frame: &RgbImage,
        zones: &[ParkingZone],
        results: &Detections,
    ) -> RgbImage;

    /// Intermediate image of the last frame, if the detector produces one.
    fn processed_frame(&self) -> Option<&GrayImage> {
        None
    }
}

/// Exponential moving average, seeded with the first sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema {
    value: Option<f64>,
}

impl Ema {
    pub fn update(&mut self, sample: f64) -> f64 {
        let value = match self.value {
            None => sample,
            Some(previous) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * previous,
        };
        self.value = Some(value);
        value
    }

    pub fn get(&self) -> f64 {
        self.value.unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mode_parsing() -> anyhow::Result<()> {
        assert_eq!("YOLO".parse::<DetectionMode>()?, DetectionMode::Yolo);
        assert_eq!(" Hybrid ".parse::<DetectionMode>()?, DetectionMode::Hybrid);
        assert!("contour".parse::<DetectionMode>().is_err());
        assert_eq!(DetectionMode::Threshold.to_string(), "threshold");

        Ok(())
    }

    #[test]
    fn test_status_serialization() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&SlotStatus::Occupied)?, "\"OCCUPIED\"");
        assert_eq!(
            serde_json::from_str::<SlotStatus>("\"FREE\"")?,
            SlotStatus::Free
        );

        Ok(())
    }

    #[test]
    fn test_ema() {
        let mut ema = Ema::default();
        assert_eq!(ema.get(), 0.0);
        assert_eq!(ema.update(2.0), 2.0);
        assert!((ema.update(4.0) - 2.2).abs() < 1e-9);
    }
}
