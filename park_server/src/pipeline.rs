//! Tasks driving a shared monitor: the detection loop and the heartbeat.
//!
//! The monitor lock is only held while a frame is analyzed. Backend requests go out through the
//! monitor's reporter after the lock is released, so a slow backend never stalls the endpoints.
use std::time::Duration;

use tokio::{task::JoinHandle, time::interval};

use crate::{
    api_client::ApiResponse,
    as_jpeg_stream_item, encode_jpeg,
    endpoints::{DebugSender, SharedMonitor},
    monitor::ParkMonitor,
    sources::FrameSource,
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

fn publish_debug_frame(monitor: &ParkMonitor, debug_tx: &DebugSender) {
    let debug = &monitor.config().debug;
    if !debug.enabled || debug_tx.receiver_count() == 0 {
        return;
    }

    if let Some(annotated) = monitor.debug_frame(true) {
        match encode_jpeg(&annotated, debug.jpeg_quality) {
            // Receivers may have left since the check
            Ok(jpeg) => {
                debug_tx.send(as_jpeg_stream_item(&jpeg)).ok();
            }
            Err(e) => log::warn!("Failed to encode debug frame: {e}"),
        }
    }
}

/// Analyze frames until the source runs dry and report status changes to the backend.
pub async fn run_detection(monitor: SharedMonitor, mut source: FrameSource, debug_tx: DebugSender) {
    while let Some(frame) = source.next_frame().await {
        let (report, reporter) = {
            let mut monitor = monitor.lock().await;
            let report = match monitor.analyze_frame(frame) {
                Ok(report) => report,
                Err(e) => {
                    log::error!("Detection failed: {e:#}");
                    continue;
                }
            };
            publish_debug_frame(&monitor, &debug_tx);
            (report, monitor.reporter())
        };

        if let Some(reporter) = reporter {
            reporter.report_changes(&report.changes).await;
        }
    }

    log::info!("Frame source exhausted, detection stopped");
}

/// Send a heartbeat with the current monitor state. `None` if reporting is disabled.
pub async fn send_heartbeat(monitor: &SharedMonitor) -> Option<ApiResponse> {
    let (reporter, payload) = {
        let monitor = monitor.lock().await;
        (monitor.reporter()?, monitor.heartbeat_payload())
    };

    Some(reporter.send_heartbeat(payload).await)
}

pub fn spawn_heartbeat(monitor: SharedMonitor, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut heartbeat_interval = interval(period);
        heartbeat_interval.tick().await;

        loop {
            heartbeat_interval.tick().await;
            if let Some(response) = send_heartbeat(&monitor).await {
                if !response.success {
                    log::warn!(
                        "Heartbeat failed: {}",
                        response.error_message.unwrap_or_default()
                    );
                }
            }
        }
    })
}
