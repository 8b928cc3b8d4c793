use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Frame counters shared by the socket, the detection loop and the debug stream.
#[derive(Default)]
pub struct Meter {
    received_frames: AtomicU64,
    processed_frames: AtomicU64,
    streamed_frames: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterSnapshot {
    pub received: u64,
    pub processed: u64,
    pub streamed: u64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            received_frames: AtomicU64::new(0),
            processed_frames: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_received(&self) {
        self.received_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_processed(&self) {
        self.processed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_reset(&self) -> MeterSnapshot {
        MeterSnapshot {
            received: self.received_frames.swap(0, Ordering::Relaxed),
            processed: self.processed_frames.swap(0, Ordering::Relaxed),
            streamed: self.streamed_frames.swap(0, Ordering::Relaxed),
        }
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let counts = METER.snapshot_reset();
            let elapsed = start.elapsed().as_secs_f32();

            if counts.received > 0 {
                log::info!(
                    "Received frames per second: {:.2}",
                    counts.received as f32 / elapsed
                );
            }
            if counts.processed > 0 {
                log::info!(
                    "Processed frames per second: {:.2}",
                    counts.processed as f32 / elapsed
                );
            }
            if counts.streamed > 0 {
                log::debug!(
                    "Streamed debug frames per second: {:.2}",
                    counts.streamed as f32 / elapsed
                );
            }
        }
    })
}
