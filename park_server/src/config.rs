//! Configuration of the park server.
//!
//! The configuration lives in a TOML file. Every section carries defaults, so a partial file only
//! overrides the keys it names and a missing file runs the server on defaults.
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    detector::{hybrid::FusionStrategy, DetectionMode},
    models::resolve_model_path,
    zone::ParkingZone,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub video: VideoConfig,
    pub detectors: DetectorsConfig,
    pub logging: LoggingConfig,
    pub debug: DebugConfig,
    pub server: ServerConfig,
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub hardware_code: String,
    pub lot_id: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: f64,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    /// Credentials for token authentication. Requests go out unauthenticated when unset.
    pub username: Option<String>,
    pub password: Option<String>,
    pub endpoints: EndpointsConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            api_key: String::new(),
            hardware_code: "CAM-DEMO-01".into(),
            lot_id: String::new(),
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 1.0,
            batch_size: 10,
            flush_interval_secs: 30,
            username: None,
            password: None,
            endpoints: EndpointsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub slot_status: String,
    pub heartbeat: String,
    pub health_check: String,
    pub login: String,
    pub refresh: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            slot_status: "/api/hardware/events/slot-status/".into(),
            heartbeat: "/api/hardware/heartbeats/".into(),
            health_check: "/health/".into(),
            login: "/api/accounts/auth/login/".into(),
            refresh: "/api/accounts/auth/refresh/".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Directory of frames, a single image, or `socket` to receive frames from camera senders.
    pub source: String,
    pub fps: f32,
    pub loop_video: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source: "socket".into(),
            fps: 30.0,
            loop_video: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorsConfig {
    pub threshold: ThresholdConfig,
    pub yolo: YoloConfig,
    pub hybrid: HybridConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveMethod {
    #[default]
    Gaussian,
    Mean,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    #[default]
    BinaryInv,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Number of white pixels above which a zone counts as occupied.
    pub threshold: u32,
    pub scale_factor: f32,
    pub adaptive_threshold_max_val: u8,
    pub adaptive_threshold_method: AdaptiveMethod,
    pub threshold_type: ThresholdType,
    pub block_size: u32,
    pub c_constant: i32,
    pub median_blur_ksize: u32,
    pub dilate_kernel_size: [u32; 2],
    pub dilate_iterations: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            threshold: 3000,
            scale_factor: 0.67,
            adaptive_threshold_max_val: 255,
            adaptive_threshold_method: AdaptiveMethod::Gaussian,
            threshold_type: ThresholdType::BinaryInv,
            block_size: 25,
            c_constant: 16,
            median_blur_ksize: 5,
            dilate_kernel_size: [3, 3],
            dilate_iterations: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YoloConfig {
    /// File name (looked up in `models_dir` first) or path of a YOLOv8 ONNX export.
    pub model: String,
    pub models_dir: PathBuf,
    pub confidence: f32,
    pub iou_threshold: f32,
    pub imgsz: u32,
    pub max_det: usize,
    /// COCO class ids counted as vehicles.
    pub vehicle_classes: Vec<u32>,
    /// Base URL to fetch missing model files from.
    pub download_url: Option<String>,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            model: "yolov8n.onnx".into(),
            models_dir: PathBuf::from("models"),
            confidence: 0.5,
            iou_threshold: 0.45,
            imgsz: 640,
            max_det: 300,
            vehicle_classes: vec![2, 5, 7],
            download_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub fusion_strategy: FusionStrategy,
    pub confidence_adjustment: f32,
    pub yolo_priority_threshold: f32,
    pub threshold_priority_threshold: f32,
    pub yolo_weight: f32,
    pub threshold_weight: f32,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            fusion_strategy: FusionStrategy::ConsensusPriority,
            confidence_adjustment: 0.8,
            yolo_priority_threshold: 0.7,
            threshold_priority_threshold: 0.9,
            yolo_weight: 0.6,
            threshold_weight: 0.4,
        }
    }
}

/// A parking slot as drawn on the camera image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Slot id in the backend database.
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// Polygon corners in frame pixels.
    #[serde(default)]
    pub coords: Vec<[i32; 2]>,
    #[serde(default = "default_zone_type", rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_zone_type() -> String {
    "regular".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Render debug frames for the MJPEG stream.
    pub enabled: bool,
    pub show_zones: bool,
    pub show_detections: bool,
    pub jpeg_quality: u8,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            show_zones: true,
            show_detections: true,
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_address: String,
    pub socket_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_address: "127.0.0.1:3000".into(),
            socket_address: "127.0.0.1:3001".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            video: VideoConfig::default(),
            detectors: DetectorsConfig::default(),
            logging: LoggingConfig::default(),
            debug: DebugConfig::default(),
            server: ServerConfig::default(),
            zones: vec![
                ZoneConfig {
                    id: 1,
                    name: "Vaga A1".into(),
                    coords: vec![[100, 100], [200, 100], [200, 200], [100, 200]],
                    kind: default_zone_type(),
                    enabled: true,
                },
                ZoneConfig {
                    id: 2,
                    name: "Vaga A2".into(),
                    coords: vec![[250, 100], [350, 100], [350, 200], [250, 200]],
                    kind: default_zone_type(),
                    enabled: true,
                },
            ],
        }
    }
}

impl Config {
    /// Load the configuration from a TOML file, falling back to defaults if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("failed to write config {}", path.display()))?;

        Ok(())
    }

    /// Check the configuration and list everything that is wrong with it.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];

        if self.api.base_url.trim().is_empty() {
            errors.push("API base URL is not configured".to_owned());
        }

        if self.zones.is_empty() {
            errors.push("no detection zones configured".to_owned());
        }

        let mut seen = HashSet::new();
        if self.zones.iter().any(|zone| !seen.insert(zone.id)) {
            errors.push("duplicate zone ids found".to_owned());
        }

        // Zero reads frames as fast as they decode
        if !self.video.fps.is_finite() || self.video.fps < 0.0 {
            errors.push(format!(
                "video fps must be a finite number >= 0, got {}",
                self.video.fps
            ));
        }

        for zone in self.zones.iter().filter(|zone| zone.coords.len() < 3) {
            errors.push(format!(
                "zone {} needs at least 3 corner points, got {}",
                zone.id,
                zone.coords.len()
            ));
        }

        errors
    }

    /// Like `validate`, plus the requirements of a specific detection mode.
    pub fn validate_for_mode(&self, mode: DetectionMode) -> Vec<String> {
        let mut errors = self.validate();

        if matches!(mode, DetectionMode::Yolo | DetectionMode::Hybrid) {
            let yolo = &self.detectors.yolo;
            if resolve_model_path(&yolo.models_dir, &yolo.model).is_none()
                && yolo.download_url.is_none()
            {
                errors.push(format!(
                    "YOLO model {} not found in {} and no download URL configured",
                    yolo.model,
                    yolo.models_dir.display()
                ));
            }
        }

        errors
    }

    /// Enabled zones as detection geometry.
    pub fn parking_zones(&self) -> Vec<ParkingZone> {
        self.zones
            .iter()
            .filter(|zone| zone.enabled)
            .map(ParkingZone::from_config)
            .collect()
    }

    /// Map of zone code to backend slot id.
    pub fn zone_mapping(&self) -> HashMap<String, i64> {
        self.parking_zones()
            .into_iter()
            .map(|zone| (zone.code, zone.id))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.parking_zones().len(), 2);
        assert_eq!(config.zone_mapping().get("Vaga A2"), Some(&2));
    }

    #[test]
    fn test_default_zones() {
        let zones = Config::default().zones;
        assert_eq!(zones.len(), 2);
        assert_eq!((zones[0].id, zones[0].name.as_str()), (1, "Vaga A1"));
        assert_eq!(zones[0].coords, vec![[100, 100], [200, 100], [200, 200], [100, 200]]);
        assert_eq!((zones[1].id, zones[1].name.as_str()), (2, "Vaga A2"));
        assert!(zones.iter().all(|zone| zone.enabled));
    }

    #[test]
    fn test_fps_must_be_finite() -> Result<()> {
        for fps in ["inf", "nan", "-5.0"] {
            let config: Config = toml::from_str(&format!("[video]\nfps = {fps}"))?;
            let errors = config.validate();
            assert_eq!(errors.len(), 1, "fps = {fps}");
            assert!(errors[0].contains("fps"));
        }

        let unpaced: Config = toml::from_str("[video]\nfps = 0.0")?;
        assert!(unpaced.validate().is_empty());

        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            [api]
            base_url = "http://backend:9000"

            [detectors.threshold]
            threshold = 1200
            adaptive_threshold_method = "mean"
            "#,
        )?;

        assert_eq!(config.api.base_url, "http://backend:9000");
        assert_eq!(config.api.retry_attempts, 3);
        assert_eq!(config.detectors.threshold.threshold, 1200);
        assert_eq!(
            config.detectors.threshold.adaptive_threshold_method,
            AdaptiveMethod::Mean
        );
        assert_eq!(config.detectors.threshold.block_size, 25);
        assert_eq!(config.zones.len(), 2);

        Ok(())
    }

    #[test]
    fn test_validation_errors() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            [api]
            base_url = ""

            [[zones]]
            id = 7
            name = "B1"
            coords = [[0, 0], [10, 0], [10, 10]]

            [[zones]]
            id = 7
            name = "B2"
            coords = [[0, 0], [10, 0]]
            "#,
        )?;

        let errors = config.validate();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("base URL")));
        assert!(errors.iter().any(|e| e.contains("duplicate")));
        assert!(errors.iter().any(|e| e.contains("at least 3")));

        Ok(())
    }

    #[test]
    fn test_disabled_zones_are_skipped() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            [[zones]]
            id = 1
            name = "A"
            coords = [[0, 0], [10, 0], [10, 10], [0, 10]]

            [[zones]]
            id = 2
            name = "B"
            coords = [[20, 0], [30, 0], [30, 10], [20, 10]]
            enabled = false
            "#,
        )?;

        let zones = config.parking_zones();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].code, "A");
        assert_eq!(config.zones[1].kind, "regular");

        Ok(())
    }

    #[test]
    fn test_yolo_mode_requires_model() {
        let mut config = Config::default();
        config.detectors.yolo.models_dir = PathBuf::from("/nonexistent/models");

        assert!(config.validate_for_mode(DetectionMode::Threshold).is_empty());
        assert_eq!(config.validate_for_mode(DetectionMode::Hybrid).len(), 1);

        config.detectors.yolo.download_url = Some("http://models.local".into());
        assert!(config.validate_for_mode(DetectionMode::Yolo).is_empty());
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("smartpark.toml");

        let mut config = Config::default();
        config.api.username = Some("camera".into());
        config.detectors.hybrid.fusion_strategy = FusionStrategy::Conservative;
        config.save(&path)?;

        assert_eq!(Config::load(&path)?, config);

        Ok(())
    }

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let config = Config::load("/nonexistent/smartpark.toml")?;
        assert_eq!(config, Config::default());

        Ok(())
    }

    #[test]
    fn test_broken_file_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[api\nbase_url = ")?;

        assert!(Config::load(&path).is_err());

        Ok(())
    }
}
