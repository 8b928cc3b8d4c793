use cam_sender::{
    sender::{connect, send_frames, Backoff},
    sensors::{get_capture_fn, StreamableCamera},
    Error,
};
use clap::Parser;
use env_logger::TimestampPrecision;

/// Consecutive failed captures after which the camera counts as gone.
const MAX_MISSES: u32 = 30;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// FourCC pixel format, the server expects JPEG frames
    #[clap(long, default_value = "MJPG")]
    format: String,

    /// Resolution as WIDTHxHEIGHT, defaults to the highest available
    #[clap(long, value_parser = parse_resolution)]
    resolution: Option<(u32, u32)>,

    /// Frames per second, defaults to the highest available
    #[clap(long)]
    fps: Option<u32>,

    /// Address of the park server data socket
    #[clap(long, default_value = "127.0.0.1:3001")]
    address: String,

    /// Camera id announced to the server
    #[clap(long, default_value = "CAM-DEMO-01")]
    camera_id: String,
}

fn parse_resolution(s: &str) -> Result<(u32, u32), String> {
    let (width, height) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
    let width = width.trim().parse().map_err(|_| format!("bad width in {s}"))?;
    let height = height.trim().parse().map_err(|_| format!("bad height in {s}"))?;
    Ok((width, height))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    log::info!("Launching camera sender {}", &args.camera_id);

    // Initialize webcam to send image stream
    let capture_fn = get_capture_fn(&args.device, &args.format, args.resolution, args.fps)?;
    let mut camera = StreamableCamera::new(capture_fn, MAX_MISSES);
    let mut backoff = Backoff::default();

    loop {
        match connect(&args.address).await {
            Ok(mut transport) => {
                backoff.reset();
                match send_frames(&mut transport, &args.camera_id, &mut camera).await {
                    Ok(sent) => {
                        log::info!("Camera closed after {sent} frames on this connection");
                        break;
                    }
                    Err(err) => log::warn!("Connection to {} lost: {err}", &args.address),
                }
            }
            Err(err) => log::warn!("Error connecting to {}: {err}", &args.address),
        }

        let delay = backoff.next_delay();
        log::info!("Reconnecting in {}s", delay.as_secs());
        tokio::time::sleep(delay).await;
    }

    Ok(())
}
