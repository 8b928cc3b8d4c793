//! The park monitor ties detectors, backend reporting and performance tracking together.
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::{bail, Context, Result};
use image::{GrayImage, RgbImage};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch, Mutex};

use crate::{
    api_client::{vehicle_type_id, ApiClient, ApiResponse, ApiStats},
    config::Config,
    detector::{
        DetectionMode, Detections, HybridDetector, SlotDetector, SlotStatus, ThresholdDetector,
        YoloDetector,
    },
    draw::{self, Summary},
    meter::METER,
    models::ensure_model,
    tracker::{format_timestamp, ModeSummary, PerformanceTracker, RealTimeStats},
    unix_now,
    zone::ParkingZone,
};

const CHANGES_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub enable_api: bool,
    pub enable_tracking: bool,
    /// Where the final metrics are written on close.
    pub metrics_dir: PathBuf,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            enable_api: true,
            enable_tracking: true,
            metrics_dir: PathBuf::from("logs"),
        }
    }
}

/// A zone which switched between free and occupied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub zone_code: String,
    pub zone_id: i64,
    pub old_status: SlotStatus,
    pub new_status: SlotStatus,
    pub confidence: f32,
    pub vehicle_type: Option<String>,
    pub timestamp: f64,
}

/// Outcome of one analyzed frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub results: Detections,
    pub changes: Vec<StatusChange>,
}

/// Handle to the backend client, usable without holding the monitor.
///
/// Requests to a slow backend only block the caller of the reporter. Statistics are read from the
/// last snapshot the client published, so they never wait for a request in flight.
#[derive(Clone)]
pub struct Reporter {
    api: Arc<Mutex<ApiClient>>,
    zone_mapping: Arc<HashMap<String, i64>>,
    stats_rx: watch::Receiver<ApiStats>,
}

impl Reporter {
    pub fn new(api: ApiClient, zone_mapping: HashMap<String, i64>) -> Self {
        Self {
            stats_rx: api.subscribe_stats(),
            api: Arc::new(Mutex::new(api)),
            zone_mapping: Arc::new(zone_mapping),
        }
    }

    pub fn statistics(&self) -> ApiStats {
        self.stats_rx.borrow().clone()
    }

    /// Send status changes of mapped zones right away. Returns the number of delivered events.
    pub async fn report_changes(&self, changes: &[StatusChange]) -> usize {
        if changes.is_empty() {
            return 0;
        }

        let mut api = self.api.lock().await;
        let mut delivered = 0;
        for change in changes {
            let Some(slot_id) = self.zone_mapping.get(&change.zone_code) else {
                continue;
            };
            let vehicle_type = change.vehicle_type.as_deref().and_then(vehicle_type_id);
            let response = api
                .send_slot_status_event(
                    *slot_id,
                    change.new_status,
                    change.confidence,
                    vehicle_type,
                    true,
                )
                .await;
            if response.success {
                delivered += 1;
            } else {
                log::warn!(
                    "Status change of {} not delivered: {}",
                    change.zone_code,
                    response.error_message.unwrap_or_default()
                );
            }
        }

        delivered
    }

    /// Queue the state of every mapped zone for bulk delivery.
    pub async fn report_results(&self, results: &Detections) -> usize {
        self.api
            .lock()
            .await
            .send_detection_results(results, &self.zone_mapping)
            .await
            .len()
    }

    pub async fn send_heartbeat(&self, payload: Map<String, Value>) -> ApiResponse {
        self.api.lock().await.send_heartbeat(payload).await
    }

    pub async fn close(&self) {
        self.api.lock().await.close().await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Occupancy {
    pub mode: DetectionMode,
    pub free: usize,
    pub occupied: usize,
    pub unknown: usize,
    pub total: usize,
    pub last_detection: Option<f64>,
    pub results: Detections,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub mode: DetectionMode,
    pub available_modes: Vec<DetectionMode>,
    pub frame_count: u64,
    pub uptime_secs: f64,
    pub fps: f64,
    pub zones: usize,
    pub detector: serde_json::Value,
    pub api: Option<ApiStats>,
    pub performance: Option<Vec<ModeSummary>>,
    pub real_time: Option<RealTimeStats>,
}

/// Build every detector the configuration allows. Modes which fail to initialize are left out.
pub async fn build_detectors(config: &Config) -> Vec<Box<dyn SlotDetector>> {
    let mut detectors: Vec<Box<dyn SlotDetector>> = vec![Box::new(ThresholdDetector::new(
        config.detectors.threshold.clone(),
    ))];

    let yolo_params = &config.detectors.yolo;
    let yolo = match ensure_model(yolo_params).await {
        Ok(path) => YoloDetector::load(yolo_params.clone(), path),
        Err(e) => Err(e),
    };

    match yolo {
        Ok(yolo) => {
            // The hybrid detector shares the loaded network
            let hybrid = HybridDetector::new(
                config.detectors.hybrid.clone(),
                ThresholdDetector::new(config.detectors.threshold.clone()),
                YoloDetector::with_shared_model(yolo_params.clone(), yolo.shared_model()),
            );
            detectors.push(Box::new(yolo));
            detectors.push(Box::new(hybrid));
        }
        Err(e) => log::warn!("YOLO and hybrid modes unavailable: {e:#}"),
    }

    detectors
}

pub struct ParkMonitor {
    config: Config,
    mode: DetectionMode,
    zones: Vec<ParkingZone>,
    detectors: BTreeMap<DetectionMode, Box<dyn SlotDetector>>,
    reporter: Option<Reporter>,
    tracker: Option<PerformanceTracker>,
    metrics_dir: PathBuf,
    last_results: Detections,
    last_frame: Option<RgbImage>,
    last_detection: Option<f64>,
    frame_count: u64,
    start_time: Instant,
    changes_tx: broadcast::Sender<Vec<StatusChange>>,
}

impl ParkMonitor {
    pub async fn new(config: Config, mode: DetectionMode, options: MonitorOptions) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            bail!("invalid configuration: {}", errors.join("; "));
        }

        let detectors = build_detectors(&config).await;

        let api = if options.enable_api {
            let mut api = ApiClient::new(config.api.clone())?;
            let response = api.test_connection().await;
            if !response.success {
                log::warn!("Continuing without a backend connection for now");
            }
            Some(api)
        } else {
            None
        };

        Self::with_detectors(config, mode, detectors, api, options)
    }

    /// Assemble a monitor from prepared parts.
    pub fn with_detectors(
        config: Config,
        mode: DetectionMode,
        detectors: Vec<Box<dyn SlotDetector>>,
        api: Option<ApiClient>,
        options: MonitorOptions,
    ) -> Result<Self> {
        let detectors: BTreeMap<_, _> = detectors.into_iter().map(|d| (d.mode(), d)).collect();
        if !detectors.contains_key(&mode) {
            bail!(
                "detection mode {mode} is not available, available modes: {}",
                detectors
                    .keys()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let (changes_tx, _) = broadcast::channel(CHANGES_CAPACITY);
        let zones = config.parking_zones();
        log::info!("Park monitor started in {mode} mode with {} zones", zones.len());

        let reporter = api.map(|api| Reporter::new(api, config.zone_mapping()));

        Ok(Self {
            zones,
            config,
            mode,
            detectors,
            reporter,
            tracker: options.enable_tracking.then(PerformanceTracker::new),
            metrics_dir: options.metrics_dir,
            last_results: Detections::new(),
            last_frame: None,
            last_detection: None,
            frame_count: 0,
            start_time: Instant::now(),
            changes_tx,
        })
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn zones(&self) -> &[ParkingZone] {
        &self.zones
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn last_results(&self) -> &Detections {
        &self.last_results
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<StatusChange>> {
        self.changes_tx.subscribe()
    }

    /// The backend handle, `None` if reporting is disabled.
    pub fn reporter(&self) -> Option<Reporter> {
        self.reporter.clone()
    }

    /// Detect slot states in a frame and report changes.
    pub async fn process_frame(&mut self, frame: RgbImage, send_to_api: bool) -> Result<Detections> {
        let report = self.analyze_frame(frame)?;
        if send_to_api {
            if let Some(reporter) = self.reporter() {
                reporter.report_changes(&report.changes).await;
            }
        }

        Ok(report.results)
    }

    /// Detect slot states in a frame and publish the changes to subscribers.
    ///
    /// Nothing is sent to the backend here. Callers sharing the monitor hand the changes to the
    /// reporter after releasing it.
    pub fn analyze_frame(&mut self, frame: RgbImage) -> Result<FrameReport> {
        let detector = self
            .detectors
            .get_mut(&self.mode)
            .with_context(|| format!("no detector for mode {}", self.mode))?;

        let start = Instant::now();
        let results = detector.process_frame(&frame, &self.zones);
        let processing_time = start.elapsed().as_secs_f64();

        let changes = self.detect_changes(&results);

        if let Some(tracker) = self.tracker.as_mut() {
            tracker.log_detection_metrics(self.mode, processing_time, &results);
            for (code, result) in results.iter() {
                if let Some(error) = &result.error {
                    tracker.log_error(self.mode, "detection", &format!("{code}: {error}"));
                }
            }
        }

        for change in changes.iter() {
            log::info!(
                "Zone {} changed {} -> {} ({:.2})",
                change.zone_code,
                change.old_status,
                change.new_status,
                change.confidence
            );
        }
        if !changes.is_empty() {
            // Nobody listening is fine
            self.changes_tx.send(changes.clone()).ok();
        }

        self.last_results = results.clone();
        self.last_frame = Some(frame);
        self.last_detection = Some(unix_now());
        self.frame_count += 1;
        METER.tick_processed();

        Ok(FrameReport { results, changes })
    }

    fn detect_changes(&self, results: &Detections) -> Vec<StatusChange> {
        let timestamp = unix_now();
        results
            .iter()
            .filter_map(|(code, result)| {
                let previous = self.last_results.get(code)?;
                if previous.status == result.status || result.status == SlotStatus::Unknown {
                    return None;
                }
                Some(StatusChange {
                    zone_code: code.clone(),
                    zone_id: result.zone_id,
                    old_status: previous.status,
                    new_status: result.status,
                    confidence: result.confidence,
                    vehicle_type: result.vehicle_type().map(str::to_owned),
                    timestamp,
                })
            })
            .collect()
    }

    pub fn available_modes(&self) -> Vec<DetectionMode> {
        self.detectors.keys().cloned().collect()
    }

    pub fn switch_mode(&mut self, mode: DetectionMode) -> bool {
        if !self.detectors.contains_key(&mode) {
            log::warn!("Cannot switch to unavailable mode {mode}");
            return false;
        }

        if mode != self.mode {
            log::info!("Detection mode switched from {} to {mode}", self.mode);
            self.mode = mode;
            // Results of another detector are no baseline for changes
            self.last_results.clear();
        }
        true
    }

    fn fps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.frame_count as f64 / elapsed
        } else {
            0.0
        }
    }

    /// The last frame with the overlay of the current detector.
    pub fn debug_frame(&self, show_info: bool) -> Option<RgbImage> {
        let frame = self.last_frame.as_ref()?;
        let detector = self.detectors.get(&self.mode)?;

        let debug = &self.config.debug;
        let mut annotated = if debug.show_zones || debug.show_detections {
            detector.draw_debug(frame, &self.zones, &self.last_results)
        } else {
            frame.clone()
        };

        if show_info {
            let occupancy = self.occupancy();
            let avg_processing_ms = self
                .tracker
                .as_ref()
                .and_then(|t| t.mode_summary(self.mode, 1.0))
                .map(|s| s.avg_processing_time * 1000.0)
                .unwrap_or_default();

            draw::draw_summary(
                &mut annotated,
                &Summary {
                    free: occupancy.free,
                    occupied: occupancy.occupied,
                    total: occupancy.total,
                    mode: self.mode,
                    fps: self.fps(),
                    avg_processing_ms,
                    timestamp: format_timestamp(unix_now()),
                },
            );
        }

        Some(annotated)
    }

    /// Intermediate image of the current detector, e.g. the binary mask of the pixel counter.
    pub fn processed_frame(&self) -> Option<GrayImage> {
        self.detectors.get(&self.mode)?.processed_frame().cloned()
    }

    pub fn occupancy(&self) -> Occupancy {
        let count = |status: SlotStatus| {
            self.last_results
                .values()
                .filter(|r| r.status == status)
                .count()
        };

        Occupancy {
            mode: self.mode,
            free: count(SlotStatus::Free),
            occupied: count(SlotStatus::Occupied),
            unknown: count(SlotStatus::Unknown),
            total: self.last_results.len(),
            last_detection: self.last_detection,
            results: self.last_results.clone(),
        }
    }

    pub fn statistics(&self) -> MonitorStats {
        MonitorStats {
            mode: self.mode,
            available_modes: self.available_modes(),
            frame_count: self.frame_count,
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
            fps: self.fps(),
            zones: self.zones.len(),
            detector: self
                .detectors
                .get(&self.mode)
                .map(|d| d.stats())
                .unwrap_or_default(),
            api: self.reporter.as_ref().map(Reporter::statistics),
            performance: self.tracker.as_ref().map(|t| t.compare_modes(60.0)),
            real_time: self.tracker.as_ref().map(|t| t.real_time_stats(self.mode)),
        }
    }

    /// Monitor state sent along with a heartbeat.
    pub fn heartbeat_payload(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("detection_mode".into(), json!(self.mode.as_str()));
        extra.insert("frames_processed".into(), json!(self.frame_count));
        extra.insert(
            "uptime".into(),
            json!(self.start_time.elapsed().as_secs_f64()),
        );
        extra.insert("last_detection".into(), json!(self.last_detection));
        extra
    }

    /// Tell the backend this camera is alive. `None` if reporting is disabled.
    pub async fn send_heartbeat(&self) -> Option<ApiResponse> {
        let reporter = self.reporter.as_ref()?;
        Some(reporter.send_heartbeat(self.heartbeat_payload()).await)
    }

    /// Queue the current state of every mapped zone for bulk delivery.
    pub async fn report_all(&self) -> usize {
        match &self.reporter {
            Some(reporter) => reporter.report_results(&self.last_results).await,
            None => 0,
        }
    }

    pub fn export_performance_metrics(&self, path: impl AsRef<Path>, hours: f64) -> Result<()> {
        match &self.tracker {
            Some(tracker) => tracker.export_metrics(path, None, hours),
            None => bail!("performance tracking is disabled"),
        }
    }

    /// Flush pending events and write the final metrics.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(reporter) = &self.reporter {
            reporter.close().await;
        }

        if self.tracker.is_some() {
            let file_name = format!(
                "final_metrics_{}.json",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            );
            self.export_performance_metrics(self.metrics_dir.join(file_name), 24.0)?;
        }

        log::info!(
            "Park monitor closed after {} frames in {:.0}s",
            self.frame_count,
            self.start_time.elapsed().as_secs_f64()
        );

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use image::Rgb;

    use super::*;
    use crate::{
        config::YoloConfig,
        detector::yolo::{test::FakeModel, VehicleDetection},
    };

    fn monitor(dir: &Path) -> Result<(ParkMonitor, Arc<FakeModel>)> {
        let mut config = Config::default();
        config.detectors.threshold.scale_factor = 1.0;

        let model = Arc::new(FakeModel::new(vec![]));
        let detectors: Vec<Box<dyn SlotDetector>> = vec![
            Box::new(ThresholdDetector::new(config.detectors.threshold.clone())),
            Box::new(YoloDetector::with_model(YoloConfig::default(), model.clone())),
        ];
        let options = MonitorOptions {
            enable_api: false,
            enable_tracking: true,
            metrics_dir: dir.to_owned(),
        };

        let monitor =
            ParkMonitor::with_detectors(config, DetectionMode::Yolo, detectors, None, options)?;
        Ok((monitor, model))
    }

    fn gray_frame() -> RgbImage {
        RgbImage::from_pixel(400, 300, Rgb([128, 128, 128]))
    }

    #[tokio::test]
    async fn test_status_changes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut monitor, model) = monitor(dir.path())?;
        let mut changes_rx = monitor.subscribe();

        // First frame sets the baseline, no changes
        let results = monitor.process_frame(gray_frame(), true).await?;
        assert_eq!(results.len(), 2);
        assert!(changes_rx.try_recv().is_err());

        *model.detections.lock().unwrap() = vec![VehicleDetection::new(
            [110.0, 110.0, 190.0, 190.0],
            0.9,
            2,
        )];
        monitor.process_frame(gray_frame(), true).await?;

        let changes = changes_rx.try_recv()?;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].zone_code, "Vaga A1");
        assert_eq!(changes[0].old_status, SlotStatus::Free);
        assert_eq!(changes[0].new_status, SlotStatus::Occupied);
        assert_eq!(changes[0].vehicle_type.as_deref(), Some("car"));

        // Unknown is never a change
        *model.fail.lock().unwrap() = true;
        monitor.process_frame(gray_frame(), true).await?;
        assert!(changes_rx.try_recv().is_err());

        let occupancy = monitor.occupancy();
        assert_eq!(occupancy.unknown, 2);
        assert_eq!(monitor.frame_count(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_switch_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut monitor, _) = monitor(dir.path())?;

        assert_eq!(
            monitor.available_modes(),
            vec![DetectionMode::Threshold, DetectionMode::Yolo]
        );
        assert!(!monitor.switch_mode(DetectionMode::Hybrid));
        assert!(monitor.switch_mode(DetectionMode::Threshold));

        let results = monitor.process_frame(gray_frame(), false).await?;
        assert!(results.values().all(|r| r.method == "threshold"));
        assert!(monitor.processed_frame().is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_debug_frame_and_close() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut monitor, _) = monitor(dir.path())?;
        assert!(monitor.debug_frame(true).is_none());

        monitor.process_frame(gray_frame(), false).await?;
        let debug = monitor.debug_frame(true).context("no debug frame")?;
        assert_eq!(debug.dimensions(), (400, 300));

        let stats = serde_json::to_value(monitor.statistics())?;
        assert_eq!(stats["mode"], "yolo");
        assert_eq!(stats["frame_count"], 1);
        assert!(stats["api"].is_null());

        assert!(monitor.send_heartbeat().await.is_none());
        monitor.close().await?;

        let exported = std::fs::read_dir(dir.path())?.count();
        assert_eq!(exported, 1);

        Ok(())
    }

    #[test]
    fn test_unavailable_mode_is_an_error() {
        let result = ParkMonitor::with_detectors(
            Config::default(),
            DetectionMode::Hybrid,
            vec![Box::new(ThresholdDetector::new(Default::default()))],
            None,
            MonitorOptions::default(),
        );
        assert!(result.is_err());
    }
}
