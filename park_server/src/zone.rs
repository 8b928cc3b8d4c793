//! Parking zone geometry.
use serde::Serialize;

use crate::config::ZoneConfig;

/// Axis-aligned box `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`.
pub type Bbox = [f32; 4];

/// A parking slot reduced to the bounding box of its polygon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParkingZone {
    pub code: String,
    pub id: i64,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ParkingZone {
    pub fn new(code: impl Into<String>, id: i64, x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            code: code.into(),
            id,
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_config(zone: &ZoneConfig) -> Self {
        let code = if zone.name.is_empty() {
            format!("zone_{}", zone.id)
        } else {
            zone.name.clone()
        };

        if zone.coords.is_empty() {
            return Self::new(code, zone.id, 0, 0, 100, 100);
        }

        let x_min = zone.coords.iter().map(|p| p[0]).min().unwrap_or_default();
        let x_max = zone.coords.iter().map(|p| p[0]).max().unwrap_or_default();
        let y_min = zone.coords.iter().map(|p| p[1]).min().unwrap_or_default();
        let y_max = zone.coords.iter().map(|p| p[1]).max().unwrap_or_default();

        Self::new(
            code,
            zone.id,
            x_min,
            y_min,
            (x_max - x_min) as u32,
            (y_max - y_min) as u32,
        )
    }

    pub fn bbox(&self) -> Bbox {
        [
            self.x as f32,
            self.y as f32,
            (self.x + self.width as i32) as f32,
            (self.y + self.height as i32) as f32,
        ]
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.x + self.width as i32 / 2,
            self.y + self.height as i32 / 2,
        )
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Edges count as inside.
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        let [x1, y1, x2, y2] = self.bbox();
        x >= x1 && x <= x2 && y >= y1 && y <= y2
    }

    /// The zone in the coordinates of an image resized by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            code: self.code.clone(),
            id: self.id,
            x: (self.x as f32 * factor) as i32,
            y: (self.y as f32 * factor) as i32,
            width: (self.width as f32 * factor) as u32,
            height: (self.height as f32 * factor) as u32,
        }
    }
}

/// Intersection-over-union of two boxes.
pub fn overlap_ratio(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // For disjoint boxes the corner points of the overlap box are swapped, which gives zero area.
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);
    let union_area = bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area;
    if overlap_area <= 0.0 || union_area <= 0.0 {
        return 0.0;
    }

    overlap_area / union_area
}

/// Area enclosed by a box, zero if the bottom-right corner lies above or left of the top-left one.
pub fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

#[cfg(test)]
mod test {
    use super::*;

    fn zone_config(name: &str, coords: Vec<[i32; 2]>) -> ZoneConfig {
        ZoneConfig {
            id: 5,
            name: name.into(),
            coords,
            kind: "regular".into(),
            enabled: true,
        }
    }

    #[test]
    fn test_zone_from_polygon() {
        let zone = ParkingZone::from_config(&zone_config(
            "B3",
            vec![[120, 40], [180, 50], [170, 140], [110, 130]],
        ));

        assert_eq!(zone, ParkingZone::new("B3", 5, 110, 40, 70, 100));
        assert_eq!(zone.bbox(), [110.0, 40.0, 180.0, 140.0]);
        assert_eq!(zone.center(), (145, 90));
        assert_eq!(zone.area(), 7000);
    }

    #[test]
    fn test_zone_fallbacks() {
        let zone = ParkingZone::from_config(&zone_config("", vec![]));
        assert_eq!(zone, ParkingZone::new("zone_5", 5, 0, 0, 100, 100));
    }

    #[test]
    fn test_contains_point_is_inclusive() {
        let zone = ParkingZone::new("A", 1, 10, 10, 20, 20);
        assert!(zone.contains_point(10.0, 10.0));
        assert!(zone.contains_point(30.0, 30.0));
        assert!(!zone.contains_point(30.5, 20.0));
    }

    #[test]
    fn test_scaled() {
        let zone = ParkingZone::new("A", 1, 100, 50, 30, 10).scaled(0.5);
        assert_eq!((zone.x, zone.y, zone.width, zone.height), (50, 25, 15, 5));
    }

    #[test]
    fn test_overlap_ratio() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [5.0, 0.0, 15.0, 10.0];
        assert!((overlap_ratio(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(overlap_ratio(&a, &a), 1.0);
        assert_eq!(overlap_ratio(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert_eq!(overlap_ratio(&[0.0; 4], &[0.0; 4]), 0.0);
    }
}
