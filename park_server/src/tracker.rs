//! Performance tracking per detection mode.
use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use serde::Serialize;
use serde_json::json;

use crate::{
    detector::{DetectionMode, Detections, SlotStatus},
    unix_now,
};

const HISTORY_SIZE: usize = 1000;
const FPS_WINDOW: usize = 30;
const ACTIVE_WINDOW_SECS: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct DetectionMetrics {
    pub timestamp: f64,
    pub mode: DetectionMode,
    pub processing_time: f64,
    pub total_slots: usize,
    pub occupied_slots: usize,
    pub free_slots: usize,
    pub unknown_slots: usize,
    pub avg_confidence: f32,
    pub min_confidence: f32,
    pub max_confidence: f32,
    pub fps: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: f64,
    pub mode: DetectionMode,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeSummary {
    pub mode: DetectionMode,
    pub detections: usize,
    pub avg_processing_time: f64,
    pub min_processing_time: f64,
    pub max_processing_time: f64,
    pub avg_fps: f64,
    pub avg_confidence: f32,
    pub avg_occupied: f64,
    pub avg_free: f64,
    pub errors: usize,
    pub uptime_percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criteria {
    Fps,
    Accuracy,
    ProcessingTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealTimeStats {
    pub mode: DetectionMode,
    pub is_active: bool,
    pub current_fps: f64,
    pub last_processing_time: f64,
    pub total_detections: usize,
    pub last_detection: Option<f64>,
}

#[derive(Debug, Default)]
pub struct PerformanceTracker {
    history: BTreeMap<DetectionMode, VecDeque<DetectionMetrics>>,
    frame_times: BTreeMap<DetectionMode, VecDeque<f64>>,
    /// Latest errors of all modes, bounded like the metric history.
    errors: VecDeque<ErrorRecord>,
    error_counts: BTreeMap<DetectionMode, usize>,
    start_time: f64,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            start_time: unix_now(),
            ..Default::default()
        }
    }

    pub fn log_detection_metrics(
        &mut self,
        mode: DetectionMode,
        processing_time: f64,
        results: &Detections,
    ) -> DetectionMetrics {
        self.log_detection_metrics_at(mode, processing_time, results, unix_now())
    }

    pub(crate) fn log_detection_metrics_at(
        &mut self,
        mode: DetectionMode,
        processing_time: f64,
        results: &Detections,
        timestamp: f64,
    ) -> DetectionMetrics {
        let count = |status: SlotStatus| results.values().filter(|r| r.status == status).count();
        let confidences: Vec<f32> = results.values().map(|r| r.confidence).collect();

        let (avg_confidence, min_confidence, max_confidence) = if confidences.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                confidences.iter().sum::<f32>() / confidences.len() as f32,
                confidences.iter().cloned().fold(f32::INFINITY, f32::min),
                confidences.iter().cloned().fold(f32::NEG_INFINITY, f32::max),
            )
        };

        let frame_times = self.frame_times.entry(mode).or_default();
        frame_times.push_back(timestamp);
        while frame_times.len() > FPS_WINDOW {
            frame_times.pop_front();
        }
        let fps = fps_of(frame_times);

        let metrics = DetectionMetrics {
            timestamp,
            mode,
            processing_time,
            total_slots: results.len(),
            occupied_slots: count(SlotStatus::Occupied),
            free_slots: count(SlotStatus::Free),
            unknown_slots: count(SlotStatus::Unknown),
            avg_confidence,
            min_confidence,
            max_confidence,
            fps,
        };

        log::debug!(
            target: "smartpark::metrics",
            "mode={} proc_ms={:.1} fps={:.1} occupied={} free={} unknown={} avg_conf={:.3}",
            mode,
            processing_time * 1000.0,
            fps,
            metrics.occupied_slots,
            metrics.free_slots,
            metrics.unknown_slots,
            avg_confidence,
        );

        let history = self.history.entry(mode).or_default();
        history.push_back(metrics.clone());
        while history.len() > HISTORY_SIZE {
            history.pop_front();
        }

        metrics
    }

    pub fn log_error(&mut self, mode: DetectionMode, kind: &str, message: &str) {
        log::error!(target: "smartpark::metrics", "mode={mode} error={kind}: {message}");
        *self.error_counts.entry(mode).or_default() += 1;
        self.errors.push_back(ErrorRecord {
            timestamp: unix_now(),
            mode,
            kind: kind.to_owned(),
            message: message.to_owned(),
        });
        while self.errors.len() > HISTORY_SIZE {
            self.errors.pop_front();
        }
    }

    pub fn mode_summary(&self, mode: DetectionMode, minutes: f64) -> Option<ModeSummary> {
        self.mode_summary_at(mode, minutes, unix_now())
    }

    fn mode_summary_at(&self, mode: DetectionMode, minutes: f64, now: f64) -> Option<ModeSummary> {
        let cutoff = now - minutes * 60.0;
        let recent: Vec<&DetectionMetrics> = self
            .history
            .get(&mode)?
            .iter()
            .filter(|m| m.timestamp >= cutoff)
            .collect();

        if recent.is_empty() {
            return None;
        }

        let n = recent.len();
        let times: Vec<f64> = recent.iter().map(|m| m.processing_time).collect();
        let avg_processing_time = times.iter().sum::<f64>() / n as f64;

        let errors = self
            .errors
            .iter()
            .filter(|e| e.mode == mode && e.timestamp >= cutoff)
            .count();

        let elapsed = (now - cutoff.max(self.start_time)).max(0.001);
        let uptime_percentage = (n as f64 * avg_processing_time / elapsed * 100.0).min(100.0);

        Some(ModeSummary {
            mode,
            detections: n,
            avg_processing_time,
            min_processing_time: times.iter().cloned().fold(f64::INFINITY, f64::min),
            max_processing_time: times.iter().cloned().fold(0.0, f64::max),
            avg_fps: recent.iter().map(|m| m.fps).sum::<f64>() / n as f64,
            avg_confidence: recent.iter().map(|m| m.avg_confidence).sum::<f32>() / n as f32,
            avg_occupied: recent.iter().map(|m| m.occupied_slots as f64).sum::<f64>() / n as f64,
            avg_free: recent.iter().map(|m| m.free_slots as f64).sum::<f64>() / n as f64,
            errors,
            uptime_percentage,
        })
    }

    /// Summaries of all modes with data, fastest first.
    pub fn compare_modes(&self, minutes: f64) -> Vec<ModeSummary> {
        self.compare_modes_at(minutes, unix_now())
    }

    fn compare_modes_at(&self, minutes: f64, now: f64) -> Vec<ModeSummary> {
        let mut summaries: Vec<ModeSummary> = DetectionMode::ALL
            .iter()
            .filter_map(|mode| self.mode_summary_at(*mode, minutes, now))
            .collect();
        summaries.sort_by(|a, b| b.avg_fps.total_cmp(&a.avg_fps));
        summaries
    }

    pub fn best_mode(&self, criteria: Criteria, minutes: f64) -> Option<DetectionMode> {
        let summaries = self.compare_modes(minutes);
        let best = match criteria {
            Criteria::Fps => summaries
                .iter()
                .max_by(|a, b| a.avg_fps.total_cmp(&b.avg_fps)),
            Criteria::Accuracy => summaries
                .iter()
                .max_by(|a, b| a.avg_confidence.total_cmp(&b.avg_confidence)),
            Criteria::ProcessingTime => summaries
                .iter()
                .min_by(|a, b| a.avg_processing_time.total_cmp(&b.avg_processing_time)),
        };
        best.map(|summary| summary.mode)
    }

    /// Write the metrics of the last `hours` as JSON, for one mode or all of them.
    pub fn export_metrics(
        &self,
        path: impl AsRef<Path>,
        mode: Option<DetectionMode>,
        hours: f64,
    ) -> Result<()> {
        let path = path.as_ref();
        let now = unix_now();
        let cutoff = now - hours * 3600.0;

        let modes: Vec<DetectionMode> = match mode {
            Some(mode) => vec![mode],
            None => DetectionMode::ALL.to_vec(),
        };

        let mut per_mode = serde_json::Map::new();
        for mode in modes {
            let metrics: Vec<&DetectionMetrics> = self
                .history
                .get(&mode)
                .map(|h| h.iter().filter(|m| m.timestamp >= cutoff).collect())
                .unwrap_or_default();
            let errors = self
                .errors
                .iter()
                .filter(|e| e.mode == mode && e.timestamp >= cutoff)
                .count();

            per_mode.insert(
                mode.as_str().to_owned(),
                json!({
                    "metrics": metrics,
                    "summary": self.mode_summary_at(mode, hours * 60.0, now),
                    "error_count": errors,
                }),
            );
        }

        let export = json!({
            "export_timestamp": format_timestamp(now),
            "period_hours": hours,
            "modes": per_mode,
        });

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&export)?)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;

        log::info!("Metrics exported to {}", path.display());

        Ok(())
    }

    pub fn real_time_stats(&self, mode: DetectionMode) -> RealTimeStats {
        let last = self.history.get(&mode).and_then(|h| h.back());
        let last_detection = last.map(|m| m.timestamp);

        RealTimeStats {
            mode,
            is_active: last_detection
                .map(|t| unix_now() - t < ACTIVE_WINDOW_SECS)
                .unwrap_or(false),
            current_fps: self.frame_times.get(&mode).map(fps_of).unwrap_or_default(),
            last_processing_time: last.map(|m| m.processing_time).unwrap_or_default(),
            total_detections: self.history.get(&mode).map(|h| h.len()).unwrap_or_default(),
            last_detection,
        }
    }

    /// Errors logged since the start, including those dropped from the error log.
    pub fn error_count(&self) -> usize {
        self.error_counts.values().sum()
    }

    pub fn mode_error_count(&self, mode: DetectionMode) -> usize {
        self.error_counts.get(&mode).cloned().unwrap_or_default()
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter()
    }
}

fn fps_of(frame_times: &VecDeque<f64>) -> f64 {
    match (frame_times.front(), frame_times.back()) {
        (Some(first), Some(last)) if frame_times.len() > 1 => {
            frame_times.len() as f64 / (last - first).max(0.001)
        }
        _ => 0.0,
    }
}

/// Local time in ISO 8601 for a unix timestamp.
pub fn format_timestamp(timestamp: f64) -> String {
    Local
        .timestamp_opt(timestamp as i64, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::detector::{ZoneDetail, ZoneResult};

    fn results(statuses: &[(SlotStatus, f32)]) -> Detections {
        statuses
            .iter()
            .enumerate()
            .map(|(i, (status, confidence))| {
                (
                    format!("Z{i}"),
                    ZoneResult {
                        status: *status,
                        confidence: *confidence,
                        zone_id: i as i64,
                        method: "threshold".into(),
                        processing_time: 0.0,
                        detail: ZoneDetail::None,
                        error: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_metrics_and_fps() {
        let mut tracker = PerformanceTracker::new();
        let frame = results(&[
            (SlotStatus::Occupied, 0.9),
            (SlotStatus::Free, 0.5),
            (SlotStatus::Unknown, 0.0),
        ]);
        let now = unix_now();

        let first = tracker.log_detection_metrics_at(DetectionMode::Threshold, 0.02, &frame, now);
        assert_eq!(first.fps, 0.0);
        assert_eq!(
            (first.occupied_slots, first.free_slots, first.unknown_slots),
            (1, 1, 1)
        );
        assert_eq!(first.max_confidence, 0.9);
        assert_eq!(first.min_confidence, 0.0);

        tracker.log_detection_metrics_at(DetectionMode::Threshold, 0.02, &frame, now + 0.5);
        let third =
            tracker.log_detection_metrics_at(DetectionMode::Threshold, 0.02, &frame, now + 1.0);
        assert!((third.fps - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tracker = PerformanceTracker::new();
        let frame = results(&[(SlotStatus::Free, 0.9)]);
        for _ in 0..(HISTORY_SIZE + 20) {
            tracker.log_detection_metrics(DetectionMode::Yolo, 0.01, &frame);
        }
        assert_eq!(
            tracker.real_time_stats(DetectionMode::Yolo).total_detections,
            HISTORY_SIZE
        );
        assert!(tracker.real_time_stats(DetectionMode::Yolo).is_active);
        assert!(!tracker.real_time_stats(DetectionMode::Hybrid).is_active);
    }

    #[test]
    fn test_error_log_is_bounded() {
        let mut tracker = PerformanceTracker::new();
        for i in 0..(HISTORY_SIZE + 50) {
            tracker.log_error(DetectionMode::Yolo, "detection", &format!("Z{i}: no model"));
        }
        tracker.log_error(DetectionMode::Hybrid, "detection", "fusion failed");

        assert_eq!(tracker.recent_errors().count(), HISTORY_SIZE);
        assert_eq!(tracker.mode_error_count(DetectionMode::Yolo), HISTORY_SIZE + 50);
        assert_eq!(tracker.mode_error_count(DetectionMode::Hybrid), 1);
        assert_eq!(tracker.mode_error_count(DetectionMode::Threshold), 0);
        assert_eq!(tracker.error_count(), HISTORY_SIZE + 51);

        // Oldest entries go first
        let oldest = tracker.recent_errors().next().map(|e| e.message.clone());
        assert_eq!(oldest.as_deref(), Some("Z51: no model"));
    }

    #[test]
    fn test_summary_window_and_comparison() {
        let mut tracker = PerformanceTracker::new();
        let frame = results(&[(SlotStatus::Occupied, 0.8)]);
        let now = unix_now();

        // Outside of a one minute window
        tracker.log_detection_metrics_at(DetectionMode::Yolo, 1.0, &frame, now - 120.0);
        assert!(tracker
            .mode_summary_at(DetectionMode::Yolo, 1.0, now)
            .is_none());

        for i in 0..5 {
            let t = now - 5.0 + i as f64;
            tracker.log_detection_metrics_at(DetectionMode::Yolo, 0.2, &frame, t);
            tracker.log_detection_metrics_at(DetectionMode::Threshold, 0.01, &frame, t);
            tracker.log_detection_metrics_at(DetectionMode::Threshold, 0.01, &frame, t + 0.5);
        }

        let summary = tracker
            .mode_summary_at(DetectionMode::Threshold, 1.0, now)
            .unwrap();
        assert_eq!(summary.detections, 10);
        assert!((summary.avg_processing_time - 0.01).abs() < 1e-9);
        assert!(summary.uptime_percentage <= 100.0);

        let compared = tracker.compare_modes_at(1.0, now);
        assert_eq!(compared.len(), 2);
        assert_eq!(compared[0].mode, DetectionMode::Threshold);

        assert_eq!(
            tracker.best_mode(Criteria::ProcessingTime, 1.0),
            Some(DetectionMode::Threshold)
        );
        assert_eq!(tracker.best_mode(Criteria::Fps, 1.0), Some(DetectionMode::Threshold));
    }

    #[test]
    fn test_export_metrics() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logs").join("metrics.json");

        let mut tracker = PerformanceTracker::new();
        tracker.log_detection_metrics(
            DetectionMode::Hybrid,
            0.1,
            &results(&[(SlotStatus::Free, 0.7)]),
        );
        tracker.log_error(DetectionMode::Hybrid, "inference", "model crashed");
        tracker.export_metrics(&path, None, 1.0)?;

        let exported: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(exported["period_hours"], 1.0);
        assert_eq!(exported["modes"]["hybrid"]["error_count"], 1);
        assert_eq!(
            exported["modes"]["hybrid"]["metrics"]
                .as_array()
                .map(|m| m.len()),
            Some(1)
        );
        assert!(exported["modes"]["yolo"]["summary"].is_null());

        Ok(())
    }
}
