//! Fusion of the pixel-count and YOLO detectors.
use std::{fmt, str::FromStr, time::Instant};

use anyhow::{bail, Error, Result};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    DetectionMode, Detections, Ema, SlotDetector, SlotStatus, ThresholdDetector, YoloDetector,
    ZoneDetail, ZoneResult,
};
use crate::{config::HybridConfig, draw, zone::ParkingZone};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    #[default]
    ConsensusPriority,
    YoloPriority,
    ThresholdPriority,
    WeightedAverage,
    Conservative,
}

impl FusionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionStrategy::ConsensusPriority => "consensus_priority",
            FusionStrategy::YoloPriority => "yolo_priority",
            FusionStrategy::ThresholdPriority => "threshold_priority",
            FusionStrategy::WeightedAverage => "weighted_average",
            FusionStrategy::Conservative => "conservative",
        }
    }
}

impl fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consensus_priority" => Ok(FusionStrategy::ConsensusPriority),
            "yolo_priority" => Ok(FusionStrategy::YoloPriority),
            "threshold_priority" => Ok(FusionStrategy::ThresholdPriority),
            "weighted_average" => Ok(FusionStrategy::WeightedAverage),
            "conservative" => Ok(FusionStrategy::Conservative),
            other => bail!("unknown fusion strategy '{other}'"),
        }
    }
}

/// Outcome of fusing two decisions for a zone.
#[derive(Debug, Clone, PartialEq)]
struct Fused {
    status: SlotStatus,
    confidence: f32,
    method: &'static str,
}

impl Fused {
    fn new(status: SlotStatus, confidence: f32, method: &'static str) -> Self {
        Self {
            status,
            confidence,
            method,
        }
    }
}

fn fuse(params: &HybridConfig, threshold: &ZoneResult, yolo: &ZoneResult) -> Fused {
    let (t_status, t_conf) = (threshold.status, threshold.confidence);
    let (y_status, y_conf) = (yolo.status, yolo.confidence);
    let consensus = t_status == y_status;
    let adjustment = params.confidence_adjustment;

    match params.fusion_strategy {
        FusionStrategy::ConsensusPriority => {
            if consensus {
                Fused::new(t_status, t_conf.min(y_conf) * 0.95, "consensus")
            } else if y_conf > params.yolo_priority_threshold {
                Fused::new(y_status, y_conf * adjustment, "yolo")
            } else if t_conf > params.threshold_priority_threshold {
                Fused::new(t_status, t_conf * adjustment, "threshold")
            } else {
                Fused::new(y_status, y_conf * 0.7, "yolo_fallback")
            }
        }
        FusionStrategy::YoloPriority => {
            let confidence = if consensus {
                (y_conf + 0.1 * t_conf).min(0.95)
            } else {
                y_conf * 0.9
            };
            Fused::new(y_status, confidence, "yolo")
        }
        FusionStrategy::ThresholdPriority => {
            let confidence = if consensus {
                (t_conf + 0.1 * y_conf).min(0.95)
            } else {
                t_conf * 0.9
            };
            Fused::new(t_status, confidence, "threshold")
        }
        FusionStrategy::WeightedAverage => {
            let occupied_score = |status: SlotStatus, conf: f32| {
                if status == SlotStatus::Occupied {
                    conf
                } else {
                    1.0 - conf
                }
            };
            let weighted = params.threshold_weight * occupied_score(t_status, t_conf)
                + params.yolo_weight * occupied_score(y_status, y_conf);

            if weighted > 0.5 {
                Fused::new(SlotStatus::Occupied, weighted, "weighted_average")
            } else {
                Fused::new(SlotStatus::Free, 1.0 - weighted, "weighted_average")
            }
        }
        FusionStrategy::Conservative => {
            let t_occupied = t_status == SlotStatus::Occupied;
            let y_occupied = y_status == SlotStatus::Occupied;
            match (t_occupied, y_occupied) {
                (true, true) => Fused::new(
                    SlotStatus::Occupied,
                    t_conf.max(y_conf),
                    "consensus_occupied",
                ),
                (true, false) => {
                    Fused::new(SlotStatus::Occupied, t_conf * 0.8, "threshold_occupied")
                }
                (false, true) => Fused::new(SlotStatus::Occupied, y_conf * 0.8, "yolo_occupied"),
                (false, false) => {
                    Fused::new(SlotStatus::Free, t_conf.min(y_conf), "consensus_free")
                }
            }
        }
    }
}

pub struct HybridDetector {
    params: HybridConfig,
    threshold: ThresholdDetector,
    yolo: YoloDetector,
    last_threshold: Detections,
    last_yolo: Detections,
    consensus_rate: Ema,
    processing_time: Ema,
    yolo_decisions: u64,
    threshold_decisions: u64,
    frames_processed: u64,
}

impl HybridDetector {
    pub fn new(params: HybridConfig, threshold: ThresholdDetector, yolo: YoloDetector) -> Self {
        log::info!(
            "Hybrid detector initialized with fusion strategy {}",
            params.fusion_strategy
        );
        Self {
            params,
            threshold,
            yolo,
            last_threshold: Detections::new(),
            last_yolo: Detections::new(),
            consensus_rate: Ema::default(),
            processing_time: Ema::default(),
            yolo_decisions: 0,
            threshold_decisions: 0,
            frames_processed: 0,
        }
    }

    pub fn fusion_strategy(&self) -> FusionStrategy {
        self.params.fusion_strategy
    }

    pub fn update_fusion_strategy(&mut self, name: &str) -> Result<()> {
        let strategy = name.parse()?;
        log::info!(
            "Fusion strategy changed from {} to {strategy}",
            self.params.fusion_strategy
        );
        self.params.fusion_strategy = strategy;
        Ok(())
    }

    /// Results of the two underlying detectors for the last frame.
    pub fn individual_results(&self) -> (&Detections, &Detections) {
        (&self.last_threshold, &self.last_yolo)
    }

    pub fn threshold_detector_mut(&mut self) -> &mut ThresholdDetector {
        &mut self.threshold
    }

    pub fn yolo_detector_mut(&mut self) -> &mut YoloDetector {
        &mut self.yolo
    }
}

impl SlotDetector for HybridDetector {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Hybrid
    }

    fn process_frame(&mut self, frame: &RgbImage, zones: &[ParkingZone]) -> Detections {
        let start = Instant::now();

        let threshold_results = self.threshold.process_frame(frame, zones);
        let yolo_results = self.yolo.process_frame(frame, zones);

        let mut fused = Detections::new();
        let mut agreeing = 0;
        for zone in zones {
            let (t_result, y_result) = match (
                threshold_results.get(&zone.code),
                yolo_results.get(&zone.code),
            ) {
                (Some(t), Some(y)) => (t, y),
                _ => {
                    fused.insert(
                        zone.code.clone(),
                        ZoneResult::unknown(zone.id, "none", "detector failure"),
                    );
                    continue;
                }
            };

            let consensus = t_result.status == y_result.status;
            if consensus {
                agreeing += 1;
            }

            let decision = fuse(&self.params, t_result, y_result);
            if decision.method.contains("yolo") {
                self.yolo_decisions += 1;
            } else if decision.method.contains("threshold") {
                self.threshold_decisions += 1;
            }

            fused.insert(
                zone.code.clone(),
                ZoneResult {
                    status: decision.status,
                    confidence: decision.confidence,
                    zone_id: zone.id,
                    method: decision.method.to_owned(),
                    processing_time: 0.0,
                    detail: ZoneDetail::Hybrid {
                        consensus,
                        primary_method: decision.method.to_owned(),
                        fusion_strategy: self.params.fusion_strategy,
                        threshold_result: Box::new(t_result.clone()),
                        yolo_result: Box::new(y_result.clone()),
                    },
                    error: None,
                },
            );
        }

        let processing_time = start.elapsed().as_secs_f64();
        for result in fused.values_mut() {
            result.processing_time = processing_time;
        }

        if !zones.is_empty() {
            self.consensus_rate
                .update(agreeing as f64 / zones.len() as f64);
        }
        self.processing_time.update(processing_time);
        self.frames_processed += 1;
        self.last_threshold = threshold_results;
        self.last_yolo = yolo_results;

        fused
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "method": "hybrid",
            "fusion_strategy": self.params.fusion_strategy.as_str(),
            "frames_processed": self.frames_processed,
            "consensus_rate": self.consensus_rate.get(),
            "yolo_decisions": self.yolo_decisions,
            "threshold_decisions": self.threshold_decisions,
            "avg_processing_time": self.processing_time.get(),
            "threshold_stats": self.threshold.stats(),
            "yolo_stats": self.yolo.stats(),
        })
    }

    fn draw_debug(
        &self,
        frame: &RgbImage,
        zones: &[ParkingZone],
        results: &Detections,
    ) -> RgbImage {
        let mut debug = self.yolo.draw_debug(frame, zones, results);
        for zone in zones {
            if let Some(ZoneDetail::Hybrid {
                consensus,
                primary_method,
                ..
            }) = results.get(&zone.code).map(|r| &r.detail)
            {
                draw::draw_consensus(&mut debug, zone, *consensus, primary_method);
            }
        }
        debug
    }

    fn processed_frame(&self) -> Option<&GrayImage> {
        self.threshold.processed_frame()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::{ThresholdConfig, YoloConfig},
        detector::yolo::{test::FakeModel, VehicleDetection},
    };

    fn result(status: SlotStatus, confidence: f32) -> ZoneResult {
        ZoneResult {
            status,
            confidence,
            zone_id: 1,
            method: "test".into(),
            processing_time: 0.0,
            detail: ZoneDetail::None,
            error: None,
        }
    }

    fn params(strategy: FusionStrategy) -> HybridConfig {
        HybridConfig {
            fusion_strategy: strategy,
            ..Default::default()
        }
    }

    fn assert_fused(fused: Fused, status: SlotStatus, confidence: f32, method: &str) {
        assert_eq!(fused.status, status);
        assert!(
            (fused.confidence - confidence).abs() < 1e-5,
            "confidence {} != {confidence}",
            fused.confidence
        );
        assert_eq!(fused.method, method);
    }

    use SlotStatus::{Free, Occupied};

    #[test]
    fn test_consensus_priority() {
        let p = params(FusionStrategy::ConsensusPriority);

        let fused = fuse(&p, &result(Occupied, 0.8), &result(Occupied, 0.9));
        assert_fused(fused, Occupied, 0.76, "consensus");

        let fused = fuse(&p, &result(Free, 0.6), &result(Occupied, 0.75));
        assert_fused(fused, Occupied, 0.6, "yolo");

        let fused = fuse(&p, &result(Free, 0.95), &result(Occupied, 0.5));
        assert_fused(fused, Free, 0.76, "threshold");

        let fused = fuse(&p, &result(Free, 0.6), &result(Occupied, 0.5));
        assert_fused(fused, Occupied, 0.35, "yolo_fallback");
    }

    #[test]
    fn test_priority_strategies() {
        let p = params(FusionStrategy::YoloPriority);
        let fused = fuse(&p, &result(Occupied, 0.6), &result(Occupied, 0.9));
        assert_fused(fused, Occupied, 0.95, "yolo");
        let fused = fuse(&p, &result(Free, 0.6), &result(Occupied, 0.5));
        assert_fused(fused, Occupied, 0.45, "yolo");

        let p = params(FusionStrategy::ThresholdPriority);
        let fused = fuse(&p, &result(Free, 0.5), &result(Free, 0.5));
        assert_fused(fused, Free, 0.55, "threshold");
        let fused = fuse(&p, &result(Free, 0.5), &result(Occupied, 0.9));
        assert_fused(fused, Free, 0.45, "threshold");
    }

    #[test]
    fn test_weighted_average() {
        let p = params(FusionStrategy::WeightedAverage);

        // 0.4 * 0.9 + 0.6 * 0.8
        let fused = fuse(&p, &result(Occupied, 0.9), &result(Occupied, 0.8));
        assert_fused(fused, Occupied, 0.84, "weighted_average");

        // 0.4 * 0.9 + 0.6 * (1 - 0.8)
        let fused = fuse(&p, &result(Occupied, 0.9), &result(Free, 0.8));
        assert_fused(fused, Free, 0.52, "weighted_average");
    }

    #[test]
    fn test_conservative() {
        let p = params(FusionStrategy::Conservative);

        let fused = fuse(&p, &result(Occupied, 0.6), &result(Occupied, 0.9));
        assert_fused(fused, Occupied, 0.9, "consensus_occupied");

        let fused = fuse(&p, &result(Occupied, 0.5), &result(Free, 0.9));
        assert_fused(fused, Occupied, 0.4, "threshold_occupied");

        let fused = fuse(&p, &result(Free, 0.5), &result(Occupied, 0.9));
        assert_fused(fused, Occupied, 0.72, "yolo_occupied");

        let fused = fuse(&p, &result(Free, 0.5), &result(Free, 0.9));
        assert_fused(fused, Free, 0.5, "consensus_free");
    }

    #[test]
    fn test_strategy_names() -> Result<()> {
        assert_eq!(
            "weighted_average".parse::<FusionStrategy>()?,
            FusionStrategy::WeightedAverage
        );
        assert!("majority_vote".parse::<FusionStrategy>().is_err());

        Ok(())
    }

    fn hybrid(detections: Vec<VehicleDetection>) -> HybridDetector {
        let threshold = ThresholdDetector::new(ThresholdConfig {
            scale_factor: 1.0,
            ..Default::default()
        });
        let yolo =
            YoloDetector::with_model(YoloConfig::default(), Arc::new(FakeModel::new(detections)));
        HybridDetector::new(HybridConfig::default(), threshold, yolo)
    }

    #[test]
    fn test_process_frame() {
        // An even gray frame gives no white pixels, so the threshold detector says free
        let frame = RgbImage::from_pixel(400, 300, image::Rgb([128, 128, 128]));
        let zones = vec![
            ParkingZone::new("A1", 1, 100, 100, 100, 100),
            ParkingZone::new("A2", 2, 250, 100, 100, 100),
        ];
        let mut detector = hybrid(vec![VehicleDetection::new(
            [110.0, 110.0, 190.0, 190.0],
            0.9,
            2,
        )]);

        let results = detector.process_frame(&frame, &zones);

        let disagreed = &results["A1"];
        assert_eq!(disagreed.status, SlotStatus::Occupied);
        assert_eq!(disagreed.method, "yolo");
        assert_eq!(disagreed.vehicle_type(), Some("car"));

        let agreed = &results["A2"];
        assert_eq!(agreed.status, SlotStatus::Free);
        assert_eq!(agreed.method, "consensus");
        assert!(matches!(
            agreed.detail,
            ZoneDetail::Hybrid {
                consensus: true,
                ..
            }
        ));

        let (threshold_results, yolo_results) = detector.individual_results();
        assert_eq!(threshold_results.len(), 2);
        assert_eq!(yolo_results.len(), 2);

        let stats = detector.stats();
        assert_eq!(stats["yolo_decisions"], 1);
        assert_eq!(stats["threshold_decisions"], 0);
        assert!((stats["consensus_rate"].as_f64().unwrap_or_default() - 0.5).abs() < 1e-9);

        assert!(detector.update_fusion_strategy("conservative").is_ok());
        assert!(detector.update_fusion_strategy("majority").is_err());
        assert_eq!(detector.fusion_strategy(), FusionStrategy::Conservative);
    }

    #[test]
    fn test_model_switch_reaches_hybrid() {
        let frame = RgbImage::from_pixel(400, 300, image::Rgb([128, 128, 128]));
        let zones = vec![ParkingZone::new("A1", 1, 100, 100, 100, 100)];

        let mut yolo =
            YoloDetector::with_model(YoloConfig::default(), Arc::new(FakeModel::new(vec![])));
        let threshold = ThresholdDetector::new(ThresholdConfig {
            scale_factor: 1.0,
            ..Default::default()
        });
        let mut detector = HybridDetector::new(
            HybridConfig::default(),
            threshold,
            YoloDetector::with_shared_model(YoloConfig::default(), yolo.shared_model()),
        );
        assert_eq!(detector.process_frame(&frame, &zones)["A1"].status, Free);

        let car = VehicleDetection::new([110.0, 110.0, 190.0, 190.0], 0.9, 2);
        yolo.replace_model(Arc::new(FakeModel::new(vec![car])), "yolov8s.onnx".into());

        assert_eq!(yolo.process_frame(&frame, &zones)["A1"].status, Occupied);
        let results = detector.process_frame(&frame, &zones);
        assert_eq!(results["A1"].status, Occupied);
        assert_eq!(results["A1"].vehicle_type(), Some("car"));
    }
}
