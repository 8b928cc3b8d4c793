//! Parking slot occupancy detection.
//!
//! Frames arrive from camera senders over the data socket (or from image files), run through one
//! of the slot detectors, and status changes are reported to the SmartPark backend. An HTTP
//! server exposes the current occupancy together with an MJPEG debug stream.
use std::io::Cursor;

use anyhow::Result;
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, ColorType, RgbImage};

pub mod api_client;
pub mod config;
pub mod data_socket;
pub mod detector;
pub mod draw;
pub mod endpoints;
pub mod imgproc;
pub mod meter;
pub mod models;
pub mod monitor;
pub mod pipeline;
pub mod sources;
pub mod tracker;
pub mod zone;

/// Seconds since the unix epoch as float, the timestamp format used by the backend.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Encode an RGB frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let (width, height) = frame.dimensions();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        frame.as_raw(),
        width,
        height,
        ColorType::Rgb8,
    )?;

    Ok(buf.into_inner())
}

/// Wrap a JPEG image as one part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}
