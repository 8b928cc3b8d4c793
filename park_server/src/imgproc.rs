//! Image preprocessing for the pixel-count detector.
use anyhow::{bail, Result};
use image::{imageops::FilterType, GrayImage, Luma, RgbImage};
use imageproc::{
    distance_transform::Norm,
    filter::{box_filter, gaussian_blur_f32, median_filter},
    morphology::dilate,
};

use crate::{
    config::{AdaptiveMethod, ThresholdConfig, ThresholdType},
    zone::ParkingZone,
};

/// Resize a frame by a factor, truncating the new dimensions.
pub fn resize_frame(frame: &RgbImage, scale: f32) -> RgbImage {
    if (scale - 1.0).abs() < f32::EPSILON {
        return frame.clone();
    }

    let (width, height) = frame.dimensions();
    let new_width = ((width as f32 * scale) as u32).max(1);
    let new_height = ((height as f32 * scale) as u32).max(1);

    image::imageops::resize(frame, new_width, new_height, FilterType::Triangle)
}

/// Resize, binarize, denoise and dilate a frame.
///
/// Returns the resized color frame together with the binary mask. Edges and texture such as a
/// parked car end up white in the mask while an empty, evenly lit slot stays mostly black.
pub fn preprocess_for_threshold(
    frame: &RgbImage,
    params: &ThresholdConfig,
) -> Result<(RgbImage, GrayImage)> {
    if params.block_size < 3 || params.block_size % 2 == 0 {
        bail!(
            "adaptive threshold block size must be odd and >= 3, got {}",
            params.block_size
        );
    }
    if params.median_blur_ksize < 3 || params.median_blur_ksize % 2 == 0 {
        bail!(
            "median blur kernel size must be odd and >= 3, got {}",
            params.median_blur_ksize
        );
    }
    if params.scale_factor <= 0.0 {
        bail!("scale factor must be positive, got {}", params.scale_factor);
    }

    let resized = resize_frame(frame, params.scale_factor);
    let gray = image::imageops::grayscale(&resized);

    let binary = adaptive_threshold(&gray, params);

    let radius = params.median_blur_ksize / 2;
    let mut mask = median_filter(&binary, radius, radius);

    let [kernel_w, kernel_h] = params.dilate_kernel_size;
    for _ in 0..params.dilate_iterations {
        mask = dilate_rect(&mask, kernel_w, kernel_h);
    }

    Ok((resized, mask))
}

fn adaptive_threshold(gray: &GrayImage, params: &ThresholdConfig) -> GrayImage {
    let block_size = params.block_size;
    let local_mean = match params.adaptive_threshold_method {
        AdaptiveMethod::Mean => box_filter(gray, block_size / 2, block_size / 2),
        AdaptiveMethod::Gaussian => {
            // Sigma OpenCV derives from the block size when none is given
            let sigma = 0.3 * ((block_size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
            gaussian_blur_f32(gray, sigma)
        }
    };

    let max_val = params.adaptive_threshold_max_val;
    let (width, height) = gray.dimensions();

    GrayImage::from_fn(width, height, |x, y| {
        let src = gray.get_pixel(x, y)[0] as i32;
        let threshold = local_mean.get_pixel(x, y)[0] as i32 - params.c_constant;
        let above = src > threshold;
        let white = match params.threshold_type {
            ThresholdType::Binary => above,
            ThresholdType::BinaryInv => !above,
        };
        Luma([if white { max_val } else { 0 }])
    })
}

/// Dilation with a rectangular kernel anchored at its center.
fn dilate_rect(mask: &GrayImage, kernel_w: u32, kernel_h: u32) -> GrayImage {
    let (kernel_w, kernel_h) = (kernel_w.max(1), kernel_h.max(1));
    if kernel_w == kernel_h && kernel_w % 2 == 1 && kernel_w / 2 <= u8::MAX as u32 {
        return dilate(mask, Norm::LInf, (kernel_w / 2) as u8);
    }

    let horizontal = max_filter(mask, kernel_w, true);
    max_filter(&horizontal, kernel_h, false)
}

fn max_filter(mask: &GrayImage, size: u32, horizontal: bool) -> GrayImage {
    let (width, height) = mask.dimensions();
    let before = size / 2;
    let after = size - 1 - before;

    GrayImage::from_fn(width, height, |x, y| {
        let (pos, len) = if horizontal { (x, width) } else { (y, height) };
        let start = pos.saturating_sub(before);
        let end = (pos + after).min(len - 1);

        let max = (start..=end)
            .map(|i| {
                if horizontal {
                    mask.get_pixel(i, y)[0]
                } else {
                    mask.get_pixel(x, i)[0]
                }
            })
            .max()
            .unwrap_or_default();
        Luma([max])
    })
}

/// Count the non-zero pixels of a binary mask inside a zone, clipped to the mask.
pub fn count_white_pixels(binary: &GrayImage, zone: &ParkingZone) -> u32 {
    let (width, height) = binary.dimensions();

    let x_start = zone.x.clamp(0, width as i32) as u32;
    let y_start = zone.y.clamp(0, height as i32) as u32;
    let x_end = (zone.x + zone.width as i32).clamp(0, width as i32) as u32;
    let y_end = (zone.y + zone.height as i32).clamp(0, height as i32) as u32;

    let mut count = 0;
    for y in y_start..y_end {
        for x in x_start..x_end {
            if binary.get_pixel(x, y)[0] > 0 {
                count += 1;
            }
        }
    }

    count
}
