//! YOLOv8 vehicle detector.
use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};

use anyhow::{bail, Result};
use image::RgbImage;
use ndarray::{Array4, ArrayView3, Ix3};
use serde::Serialize;
use serde_json::json;
use tract_onnx::prelude::*;

use super::{DetectionMode, Detections, Ema, SlotDetector, SlotStatus, ZoneDetail, ZoneResult};
use crate::{
    config::YoloConfig,
    draw,
    zone::{overlap_ratio, Bbox, ParkingZone},
};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Minimum overlap of a vehicle box with a zone to count the vehicle in that zone.
const MIN_ZONE_OVERLAP: f32 = 0.3;
const FREE_CONFIDENCE: f32 = 0.95;

/// COCO name of the vehicle classes.
pub fn vehicle_class_name(class_id: u32) -> &'static str {
    match class_id {
        2 => "car",
        3 => "motorcycle",
        5 => "bus",
        7 => "truck",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleDetection {
    pub bbox: Bbox,
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
    pub center: (f32, f32),
}

impl VehicleDetection {
    pub fn new(bbox: Bbox, confidence: f32, class_id: u32) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            class_name: vehicle_class_name(class_id).to_owned(),
            center: ((bbox[0] + bbox[2]) / 2.0, (bbox[1] + bbox[3]) / 2.0),
        }
    }
}

/// Anything which finds vehicles in a frame.
pub trait VehicleModel: Send + Sync {
    fn detect(&self, frame: &RgbImage, params: &YoloConfig) -> Result<Vec<VehicleDetection>>;

    fn name(&self) -> String {
        "custom".to_owned()
    }
}

/// Vehicle model which can be shared between detectors.
///
/// Clones point to the same slot, so replacing the model through one handle replaces it for all.
#[derive(Clone)]
pub struct SharedModel(Arc<RwLock<Arc<dyn VehicleModel>>>);

impl SharedModel {
    pub fn new(model: Arc<dyn VehicleModel>) -> Self {
        Self(Arc::new(RwLock::new(model)))
    }

    pub fn get(&self) -> Arc<dyn VehicleModel> {
        let model = self.0.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&model)
    }

    pub fn replace(&self, model: Arc<dyn VehicleModel>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = model;
    }
}

/// YOLOv8 ONNX export run with tract on the CPU.
pub struct OnnxYolo {
    model: NnModel,
    path: PathBuf,
    input_size: u32,
}

impl OnnxYolo {
    pub fn load(path: impl AsRef<Path>, input_size: u32) -> Result<Self> {
        let path = path.as_ref();
        let size = input_size as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        log::info!("Loaded YOLO model {}", path.display());

        Ok(Self {
            model,
            path: path.to_owned(),
            input_size,
        })
    }

    fn preproc(&self, frame: &RgbImage) -> Tensor {
        let size = self.input_size;
        let resized: RgbImage =
            image::imageops::resize(frame, size, size, image::imageops::FilterType::Triangle);

        Array4::from_shape_fn((1, 3, size as usize, size as usize), |(_, c, y, x)| {
            resized[(x as _, y as _)][c] as f32 / 255.0
        })
        .into()
    }
}

impl VehicleModel for OnnxYolo {
    fn detect(&self, frame: &RgbImage, params: &YoloConfig) -> Result<Vec<VehicleDetection>> {
        let input = self.preproc(frame);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;

        let output = raw_nn_out[0]
            .to_array_view::<f32>()?
            .into_dimensionality::<Ix3>()?;

        let (width, height) = frame.dimensions();
        let scale = (
            width as f32 / self.input_size as f32,
            height as f32 / self.input_size as f32,
        );

        decode_yolov8(output, scale, params)
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Turn the raw YOLOv8 output into vehicle detections in frame coordinates.
///
/// The output has the shape `[1, 4 + classes, anchors]`. The first four rows hold the box as
/// center x, center y, width and height in input pixels, the other rows hold one score per class.
pub fn decode_yolov8(
    output: ArrayView3<f32>,
    scale: (f32, f32),
    params: &YoloConfig,
) -> Result<Vec<VehicleDetection>> {
    let (_, rows, anchors) = output.dim();
    if rows <= 4 {
        bail!("unexpected YOLO output shape {:?}", output.shape());
    }

    let mut candidates = vec![];
    for anchor in 0..anchors {
        let (class_id, score) = (4..rows)
            .map(|row| (row - 4, output[[0, row, anchor]]))
            .fold((0, f32::MIN), |best, (class_id, score)| {
                if score > best.1 {
                    (class_id, score)
                } else {
                    best
                }
            });

        let class_id = class_id as u32;
        if score < params.confidence || !params.vehicle_classes.contains(&class_id) {
            continue;
        }

        let (cx, cy) = (output[[0, 0, anchor]], output[[0, 1, anchor]]);
        let (w, h) = (output[[0, 2, anchor]], output[[0, 3, anchor]]);
        let bbox = [
            (cx - w / 2.0) * scale.0,
            (cy - h / 2.0) * scale.1,
            (cx + w / 2.0) * scale.0,
            (cy + h / 2.0) * scale.1,
        ];

        candidates.push(VehicleDetection::new(bbox, score, class_id));
    }

    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));
    let mut selected = non_maximum_suppression(candidates, params.iou_threshold);
    selected.truncate(params.max_det);

    Ok(selected)
}

/// Run non-maximum-suppression on candidates sorted by ascending confidence.
///
/// Candidates are taken from the back, so the most confident box comes first. A candidate is kept
/// only if it does not overlap any already selected box by more than `max_iou`.
fn non_maximum_suppression(
    mut sorted_candidates: Vec<VehicleDetection>,
    max_iou: f32,
) -> Vec<VehicleDetection> {
    let mut selected: Vec<VehicleDetection> = vec![];
    'candidates: while let Some(candidate) = sorted_candidates.pop() {
        for chosen in selected.iter() {
            if overlap_ratio(&candidate.bbox, &chosen.bbox) > max_iou {
                continue 'candidates;
            }
        }

        selected.push(candidate);
    }

    selected
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub avg_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub avg_fps: f64,
    pub avg_detections: f64,
    pub total_tests: usize,
}

pub struct YoloDetector {
    params: YoloConfig,
    model: SharedModel,
    last_detections: Vec<VehicleDetection>,
    processing_time: Ema,
    frames_processed: u64,
    total_detections: u64,
}

impl YoloDetector {
    /// Load an ONNX model from a file.
    pub fn load(params: YoloConfig, model_path: impl AsRef<Path>) -> Result<Self> {
        let model = OnnxYolo::load(model_path, params.imgsz)?;
        Ok(Self::with_model(params, Arc::new(model)))
    }

    pub fn with_model(params: YoloConfig, model: Arc<dyn VehicleModel>) -> Self {
        Self::with_shared_model(params, SharedModel::new(model))
    }

    /// A detector running the same model as other detectors holding `model`.
    pub fn with_shared_model(params: YoloConfig, model: SharedModel) -> Self {
        log::info!(
            "YOLO detector initialized with model {} (confidence {})",
            model.get().name(),
            params.confidence
        );
        Self {
            params,
            model,
            last_detections: vec![],
            processing_time: Ema::default(),
            frames_processed: 0,
            total_detections: 0,
        }
    }

    pub fn model(&self) -> Arc<dyn VehicleModel> {
        self.model.get()
    }

    pub fn shared_model(&self) -> SharedModel {
        self.model.clone()
    }

    pub fn last_detections(&self) -> &[VehicleDetection] {
        &self.last_detections
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.params.confidence
    }

    pub fn update_confidence_threshold(&mut self, confidence: f32) {
        self.params.confidence = confidence.clamp(0.0, 1.0);
        log::info!(
            "YOLO confidence threshold updated to {}",
            self.params.confidence
        );
    }

    /// Load another model file. The current model stays in place if loading fails.
    pub fn switch_model(&mut self, model_path: impl AsRef<Path>) -> Result<()> {
        let model_path = model_path.as_ref();
        match OnnxYolo::load(model_path, self.params.imgsz) {
            Ok(model) => {
                self.replace_model(Arc::new(model), model_path.display().to_string());
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "Failed to switch to model {}, keeping {}: {e}",
                    model_path.display(),
                    self.model.get().name()
                );
                Err(e)
            }
        }
    }

    /// Run `model` from now on, in this detector and every detector sharing its model.
    pub fn replace_model(&mut self, model: Arc<dyn VehicleModel>, model_name: String) {
        log::info!("YOLO model switched to {}", model.name());
        self.model.replace(model);
        self.params.model = model_name;
    }

    /// Time the vehicle detection on a set of frames.
    pub fn benchmark(&self, frames: &[RgbImage], iterations: usize) -> Result<BenchmarkReport> {
        if frames.is_empty() || iterations == 0 {
            bail!("benchmark needs at least one frame and one iteration");
        }

        let model = self.model.get();
        let mut times = vec![];
        let mut detections = 0;
        for _ in 0..iterations {
            for frame in frames {
                let start = Instant::now();
                detections += model.detect(frame, &self.params)?.len();
                times.push(start.elapsed().as_secs_f64());
            }
        }

        let total_tests = times.len();
        let avg_time = times.iter().sum::<f64>() / total_tests as f64;
        let min_time = times.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_time = times.iter().cloned().fold(0.0, f64::max);

        Ok(BenchmarkReport {
            avg_time,
            min_time,
            max_time,
            avg_fps: if avg_time > 0.0 { 1.0 / avg_time } else { 0.0 },
            avg_detections: detections as f64 / total_tests as f64,
            total_tests,
        })
    }

    fn analyze_zone(
        &self,
        zone: &ParkingZone,
        detections: &[VehicleDetection],
        processing_time: f64,
    ) -> ZoneResult {
        let zone_bbox = zone.bbox();
        let in_zone: Vec<VehicleDetection> = detections
            .iter()
            .filter(|d| {
                zone.contains_point(d.center.0, d.center.1)
                    || overlap_ratio(&d.bbox, &zone_bbox) > MIN_ZONE_OVERLAP
            })
            .cloned()
            .collect();

        let best = in_zone
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

        let (status, confidence, vehicle_type) = match best {
            Some(best) => (
                SlotStatus::Occupied,
                best.confidence,
                Some(best.class_name.clone()),
            ),
            None => (SlotStatus::Free, FREE_CONFIDENCE, None),
        };

        ZoneResult {
            status,
            confidence,
            zone_id: zone.id,
            method: "yolo".into(),
            processing_time,
            detail: ZoneDetail::Yolo {
                vehicle_type,
                vehicle_count: in_zone.len(),
                detections: in_zone,
            },
            error: None,
        }
    }
}

impl SlotDetector for YoloDetector {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Yolo
    }

    fn process_frame(&mut self, frame: &RgbImage, zones: &[ParkingZone]) -> Detections {
        let start = Instant::now();

        let detections = match self.model.get().detect(frame, &self.params) {
            Ok(detections) => detections,
            Err(e) => {
                log::error!("YOLO detection failed: {e}");
                return zones
                    .iter()
                    .map(|zone| {
                        (
                            zone.code.clone(),
                            ZoneResult::unknown(zone.id, "yolo", e.to_string()),
                        )
                    })
                    .collect();
            }
        };

        let processing_time = start.elapsed().as_secs_f64();
        let results = zones
            .iter()
            .map(|zone| {
                (
                    zone.code.clone(),
                    self.analyze_zone(zone, &detections, processing_time),
                )
            })
            .collect();

        self.processing_time.update(processing_time);
        self.frames_processed += 1;
        self.total_detections += detections.len() as u64;
        self.last_detections = detections;

        results
    }

    fn stats(&self) -> serde_json::Value {
        let avg_detections = match self.frames_processed {
            0 => 0.0,
            frames => self.total_detections as f64 / frames as f64,
        };
        json!({
            "method": "yolo",
            "model": self.model.get().name(),
            "confidence_threshold": self.params.confidence,
            "iou_threshold": self.params.iou_threshold,
            "frames_processed": self.frames_processed,
            "avg_processing_time": self.processing_time.get(),
            "avg_detections_per_frame": avg_detections,
            "last_detections": self.last_detections.len(),
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
        draw::draw_vehicles(&mut debug, &self.last_detections);
        debug
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;
    use super::*;

    /// Returns prepared detections, or an error once `fail` is set.
    pub(crate) struct FakeModel {
        pub detections: Mutex<Vec<VehicleDetection>>,
        pub fail: Mutex<bool>,
    }

    impl FakeModel {
        pub fn new(detections: Vec<VehicleDetection>) -> Self {
            Self {
                detections: Mutex::new(detections),
                fail: Mutex::new(false),
            }
        }
    }

    impl VehicleModel for FakeModel {
        fn detect(&self, _frame: &RgbImage, _params: &YoloConfig) -> Result<Vec<VehicleDetection>> {
            if *self.fail.lock().unwrap() {
                bail!("inference failed");
            }
            Ok(self.detections.lock().unwrap().clone())
        }
    }

    fn zones() -> Vec<ParkingZone> {
        vec![
            ParkingZone::new("A1", 1, 100, 100, 100, 100),
            ParkingZone::new("A2", 2, 250, 100, 100, 100),
        ]
    }

    #[test]
    fn test_class_names() {
        assert_eq!(vehicle_class_name(2), "car");
        assert_eq!(vehicle_class_name(7), "truck");
        assert_eq!(vehicle_class_name(0), "unknown");
    }

    #[test]
    fn test_decode_yolov8() -> Result<()> {
        // 3 anchors, 8 classes
        let mut output = ndarray::Array3::<f32>::zeros((1, 12, 3));
        let anchors = [
            // cx, cy, w, h, class, score
            (100.0, 100.0, 40.0, 20.0, 2, 0.9),
            (102.0, 100.0, 40.0, 20.0, 7, 0.6),
            (300.0, 300.0, 50.0, 50.0, 0, 0.99),
        ];
        for (i, (cx, cy, w, h, class, score)) in anchors.iter().enumerate() {
            output[[0, 0, i]] = *cx;
            output[[0, 1, i]] = *cy;
            output[[0, 2, i]] = *w;
            output[[0, 3, i]] = *h;
            output[[0, 4 + class, i]] = *score;
        }

        let detections = decode_yolov8(output.view(), (2.0, 1.0), &YoloConfig::default())?;

        // The person is filtered, the truck is suppressed by the overlapping car
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "car");
        assert_eq!(detections[0].bbox, [160.0, 90.0, 240.0, 110.0]);
        assert_eq!(detections[0].center, (200.0, 100.0));

        Ok(())
    }

    #[test]
    fn test_zone_analysis() {
        let model = Arc::new(FakeModel::new(vec![
            VehicleDetection::new([110.0, 110.0, 190.0, 190.0], 0.6, 2),
            VehicleDetection::new([120.0, 120.0, 180.0, 180.0], 0.8, 7),
        ]));
        let mut detector = YoloDetector::with_model(YoloConfig::default(), model);

        let results = detector.process_frame(&RgbImage::new(400, 300), &zones());

        let occupied = &results["A1"];
        assert_eq!(occupied.status, SlotStatus::Occupied);
        assert!((occupied.confidence - 0.8).abs() < 1e-6);
        assert_eq!(occupied.vehicle_type(), Some("truck"));

        let free = &results["A2"];
        assert_eq!(free.status, SlotStatus::Free);
        assert!((free.confidence - 0.95).abs() < 1e-6);

        assert_eq!(detector.last_detections().len(), 2);
        assert_eq!(detector.stats()["frames_processed"], 1);
    }

    #[test]
    fn test_model_failure_gives_unknown() {
        let model = Arc::new(FakeModel::new(vec![]));
        *model.fail.lock().unwrap() = true;
        let mut detector = YoloDetector::with_model(YoloConfig::default(), model);

        let results = detector.process_frame(&RgbImage::new(400, 300), &zones());
        assert!(results
            .values()
            .all(|r| r.status == SlotStatus::Unknown && r.error.is_some()));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let mut detector =
            YoloDetector::with_model(YoloConfig::default(), Arc::new(FakeModel::new(vec![])));
        detector.update_confidence_threshold(1.5);
        assert_eq!(detector.confidence_threshold(), 1.0);
        detector.update_confidence_threshold(-0.5);
        assert_eq!(detector.confidence_threshold(), 0.0);
    }

    #[test]
    fn test_switch_model_keeps_old_one() {
        let mut detector =
            YoloDetector::with_model(YoloConfig::default(), Arc::new(FakeModel::new(vec![])));
        assert!(detector.switch_model("/nonexistent/yolov8x.onnx").is_err());
        assert_eq!(detector.model().name(), "custom");
    }

    #[test]
    fn test_benchmark() -> Result<()> {
        let detector = YoloDetector::with_model(
            YoloConfig::default(),
            Arc::new(FakeModel::new(vec![VehicleDetection::new(
                [0.0, 0.0, 10.0, 10.0],
                0.9,
                2,
            )])),
        );

        let report = detector.benchmark(&[RgbImage::new(8, 8), RgbImage::new(8, 8)], 3)?;
        assert_eq!(report.total_tests, 6);
        assert_eq!(report.avg_detections, 1.0);
        assert!(report.min_time <= report.max_time);
        assert!(detector.benchmark(&[], 3).is_err());

        Ok(())
    }
}
