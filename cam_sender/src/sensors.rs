//! Sensors module.
//!
use std::pin::Pin;

use bytes::Bytes;
use futures_core::{
    task::{Context, Poll},
    Stream,
};
use rscam::{Camera, Config};
use simple_error::simple_error;

use crate::Error;

pub type CaptureFn = Box<dyn Fn() -> Option<Bytes> + Send + Sync>;

/// Get a capture function to a video device.
///
/// Without an explicit resolution or frame rate, the highest one the camera offers for the format
/// is used.
pub fn get_capture_fn(
    device_name: &str,
    format: &str,
    resolution: Option<(u32, u32)>,
    fps: Option<u32>,
) -> Result<CaptureFn, Error> {
    let mut cam = Camera::new(device_name)?;
    log_supported_formats(&cam, format);
    let format = format.as_bytes();

    let resolution = resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam, format))?;

    let interval = fps
        .map(|fps| Ok((1, fps)))
        .unwrap_or_else(|| get_max_frame_rate(&cam, format, resolution))?;

    log::info!(
        "Using camera {} at {}x{}, interval {}/{}",
        device_name,
        resolution.0,
        resolution.1,
        interval.0,
        interval.1
    );

    cam.start(&Config {
        interval,
        resolution,
        format,
        ..Default::default()
    })?;

    let callback = move || cam.capture().ok().map(|frame| Bytes::copy_from_slice(&frame[..]));
    Ok(Box::new(callback))
}

/// Initialized, streamable camera.
///
/// The stream ends after `max_misses` captures in a row failed.
pub struct StreamableCamera {
    capture_fn: CaptureFn,
    max_misses: u32,
}

impl StreamableCamera {
    /// Create a new instance.
    pub fn new(capture: CaptureFn, max_misses: u32) -> StreamableCamera {
        StreamableCamera {
            capture_fn: capture,
            max_misses,
        }
    }
}

impl Stream for StreamableCamera {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        for miss in 1..=self.max_misses {
            match (*self.capture_fn)() {
                Some(frame) => {
                    log::trace!("Captured frame ({} bytes)", frame.len());
                    return Poll::Ready(Some(frame));
                }
                None => log::warn!("Unable to capture frame ({miss}/{})", self.max_misses),
            }
        }

        log::error!("Camera stopped delivering frames");
        Poll::Ready(None)
    }
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), Error> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .into_iter()
            // Highest resolution in terms of number of pixels
            .max_by_key(|(width, height)| width * height),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the shortest frame interval for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), Error> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame intervals: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .into_iter()
            .filter(|(numerator, _)| *numerator > 0)
            // Interval is numerator / denominator seconds, the frame rate its inverse
            .max_by(|a, b| (a.1 as f64 / a.0 as f64).total_cmp(&(b.1 as f64 / b.0 as f64))),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use futures::StreamExt;

    use super::*;

    #[test]
    fn get_cam_info_if_available() -> Result<(), Error> {
        let cam_name = "/dev/video0";
        let cam = Camera::new(cam_name);

        match cam {
            Err(err) => println!("Could not initialize camera (maybe non available): {err}"),
            Ok(cam) => {
                let formats: Vec<_> = cam.formats().collect();
                println!("Supported formats: {formats:?}");

                let format = b"MJPG";

                let resolutions = cam.resolutions(format)?;
                println!("Supported resolutions: {resolutions:?}");

                let selected_resolution = get_max_resolution(&cam, format)?;
                let frame_rates = cam.intervals(format, selected_resolution)?;
                println!("Supported frame rates: {frame_rates:?}");
            }
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_ends_after_misses() {
        // Every third capture succeeds for six calls, then nothing works any more
        let calls = Arc::new(AtomicU32::new(0));
        let capture_fn: CaptureFn = {
            let calls = calls.clone();
            Box::new(move || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                (call <= 6 && call % 3 == 0).then(|| Bytes::from_static(b"jpeg"))
            })
        };

        let frames: Vec<_> = StreamableCamera::new(capture_fn, 3).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 9);
    }
}
