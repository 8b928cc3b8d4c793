//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    extract::Query,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    detector::DetectionMode,
    encode_jpeg,
    meter::METER,
    monitor::{MonitorStats, Occupancy, ParkMonitor},
    pipeline,
};

pub type SharedMonitor = Arc<Mutex<ParkMonitor>>;
/// Sender of MJPEG stream items of annotated frames.
pub type DebugSender = broadcast::Sender<Bytes>;

/// Parameters of the mode switch.
#[derive(Debug, Deserialize)]
pub struct ModeParams {
    name: String,
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

pub async fn status(Extension(monitor): Extension<SharedMonitor>) -> Json<Occupancy> {
    Json(monitor.lock().await.occupancy())
}

pub async fn stats(Extension(monitor): Extension<SharedMonitor>) -> Json<MonitorStats> {
    Json(monitor.lock().await.statistics())
}

pub async fn switch_mode(
    Extension(monitor): Extension<SharedMonitor>,
    Query(params): Query<ModeParams>,
) -> impl IntoResponse {
    let mode: DetectionMode = match params.name.parse() {
        Ok(mode) => mode,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    };

    let mut monitor = monitor.lock().await;
    if monitor.switch_mode(mode) {
        (StatusCode::OK, Json(json!({ "mode": mode })))
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("mode {mode} is not available"),
                "available_modes": monitor.available_modes(),
            })),
        )
    }
}

pub async fn heartbeat(Extension(monitor): Extension<SharedMonitor>) -> impl IntoResponse {
    match pipeline::send_heartbeat(&monitor).await {
        Some(response) => (StatusCode::OK, Json(json!(response))),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "backend reporting is disabled" })),
        ),
    }
}

/// Intermediate image of the current detector as JPEG.
pub async fn processed(Extension(monitor): Extension<SharedMonitor>) -> impl IntoResponse {
    let Some(gray) = monitor.lock().await.processed_frame() else {
        return Err((StatusCode::NOT_FOUND, "no processed frame available"));
    };

    let rgb = image::DynamicImage::ImageLuma8(gray).to_rgb8();
    match encode_jpeg(&rgb, 90) {
        Ok(jpeg) => Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg)),
        Err(e) => {
            log::error!("Failed to encode processed frame: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "encoding failed"))
        }
    }
}

/// MJPEG stream of annotated frames.
pub async fn debug_stream(Extension(debug_tx): Extension<DebugSender>) -> impl IntoResponse {
    log::info!("Debug stream requested");

    // Lagging clients skip frames instead of ending the stream
    let stream = BroadcastStream::new(debug_tx.subscribe()).filter_map(|item| async move {
        item.ok().map(|data| {
            METER.tick_streamed();
            Ok::<_, std::io::Error>(data)
        })
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

pub fn router(monitor: SharedMonitor, debug_tx: DebugSender) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route("/mode", post(switch_mode))
        .route("/heartbeat", post(heartbeat))
        .route("/processed", get(processed))
        .route("/debug_stream", get(debug_stream))
        .layer(Extension(monitor))
        .layer(Extension(debug_tx))
}
