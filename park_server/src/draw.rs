//! Debug overlays.
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::{Font, Scale};

use crate::{
    detector::{yolo::VehicleDetection, DetectionMode, Detections, SlotStatus},
    zone::ParkingZone,
};

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const LINE_HEIGHT: i32 = 20;

lazy_static! {
    static ref DEJAVU_MONO: Font<'static> = {
        let font_data: &[u8] = include_bytes!("../resources/DejaVuSansMono.ttf");
        Font::try_from_bytes(font_data).expect("failed to load font")
    };
}

fn text(frame: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, size: f32, line: &str) {
    draw_text_mut(
        frame,
        color,
        x,
        y,
        Scale { x: size, y: size },
        &DEJAVU_MONO,
        line,
    );
}

fn colored_rect(
    frame: &mut RgbImage,
    color: Rgb<u8>,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    thickness: u32,
) {
    for t in 0..thickness {
        let rect = Rect::at(x - t as i32, y - t as i32)
            .of_size((width + 2 * t).max(1), (height + 2 * t).max(1));
        draw_hollow_rect_mut(frame, rect, color);
    }
}

/// Zone rectangles colored by status with labels stacked above the zone.
pub fn draw_zones(frame: &mut RgbImage, zones: &[ParkingZone], results: &Detections) {
    for zone in zones {
        let result = results.get(&zone.code);
        let status = result.map(|r| r.status).unwrap_or(SlotStatus::Unknown);

        let (color, thickness) = match status {
            SlotStatus::Occupied => (RED, 3),
            SlotStatus::Free => (GREEN, 2),
            SlotStatus::Unknown => (YELLOW, 2),
        };
        colored_rect(frame, color, zone.x, zone.y, zone.width, zone.height, thickness);

        let mut lines = vec![zone.code.clone(), status.to_string()];
        if let Some(result) = result {
            lines.push(format!("{:.2}", result.confidence));
            if let Some(pixel_count) = result.pixel_count() {
                lines.push(format!("px: {pixel_count}"));
            }
        }

        let n = lines.len() as i32;
        for (i, line) in lines.iter().enumerate() {
            let y = zone.y - 5 - (n - i as i32) * LINE_HEIGHT;
            text(frame, color, zone.x, y, 16.0, line);
        }
    }
}

/// Vehicle boxes with class and confidence.
pub fn draw_vehicles(frame: &mut RgbImage, detections: &[VehicleDetection]) {
    for detection in detections {
        let [x1, y1, x2, y2] = detection.bbox;
        let width = (x2 - x1).max(1.0) as u32;
        let height = (y2 - y1).max(1.0) as u32;
        colored_rect(frame, BLUE, x1 as i32, y1 as i32, width, height, 2);
        text(
            frame,
            BLUE,
            x1 as i32,
            y1 as i32 - LINE_HEIGHT,
            16.0,
            &format!("{}: {:.2}", detection.class_name, detection.confidence),
        );
    }
}

/// Dot in the corner of the zone showing whether both detectors agreed, with the deciding method.
pub fn draw_consensus(frame: &mut RgbImage, zone: &ParkingZone, consensus: bool, method: &str) {
    let color = if consensus { GREEN } else { ORANGE };
    let center = (zone.x + zone.width as i32 - 10, zone.y + 10);
    draw_filled_circle_mut(frame, center, 6, color);
    text(
        frame,
        color,
        zone.x,
        zone.y + zone.height as i32 + 5,
        14.0,
        method,
    );
}

pub struct Summary {
    pub free: usize,
    pub occupied: usize,
    pub total: usize,
    pub mode: DetectionMode,
    pub fps: f64,
    pub avg_processing_ms: f64,
    pub timestamp: String,
}

/// Dimmed band at the top of the frame with the occupancy summary.
pub fn draw_summary(frame: &mut RgbImage, summary: &Summary) {
    let (width, height) = frame.dimensions();
    let x_end = width.saturating_sub(10);
    let y_end = height.min(120);

    for y in 10..y_end {
        for x in 10..x_end {
            let pixel = frame.get_pixel_mut(x, y);
            for c in 0..3 {
                pixel[c] = (0.7 * 50.0 + 0.3 * pixel[c] as f32) as u8;
            }
        }
    }

    let lines = [
        format!(
            "LIVRE: {}/{} | OCUPADO: {}",
            summary.free, summary.total, summary.occupied
        ),
        format!(
            "MODO: {} | FPS: {:.1} | PROC: {:.1}ms",
            summary.mode.as_str().to_uppercase(),
            summary.fps,
            summary.avg_processing_ms
        ),
        summary.timestamp.clone(),
    ];
    for (i, line) in lines.iter().enumerate() {
        text(frame, WHITE, 20, 20 + i as i32 * 30, 20.0, line);
    }
}
