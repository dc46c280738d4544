//! Region cropping with optional polygon mask compositing.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::error::{GlmOcrError, Result};
use crate::imaging::PageImage;

/// Crop a region out of a page.
///
/// `bbox` is `[x1, y1, x2, y2]` normalized to `[0, 1000]`. When a polygon
/// with at least three vertices is supplied (same normalization), pixels of
/// the crop outside the polygon are composited to white so the recognizer
/// sees only the region's own content.
pub fn crop_region(
    page: &PageImage,
    bbox: [f32; 4],
    polygon: &[[f32; 2]],
) -> Result<PageImage> {
    let w = page.width() as f32;
    let h = page.height() as f32;
    let x1 = (bbox[0] / 1000.0 * w).floor().max(0.0) as u32;
    let y1 = (bbox[1] / 1000.0 * h).floor().max(0.0) as u32;
    let x2 = (bbox[2] / 1000.0 * w).ceil() as u32;
    let y2 = (bbox[3] / 1000.0 * h).ceil() as u32;
    let mut crop = page.crop(x1, y1, x2, y2)?;

    if polygon.len() >= 3 {
        // Polygon in crop-local pixel coordinates.
        let poly: Vec<[f32; 2]> = polygon
            .iter()
            .map(|p| {
                [
                    p[0] / 1000.0 * w - x1 as f32,
                    p[1] / 1000.0 * h - y1 as f32,
                ]
            })
            .collect();
        for y in 0..crop.height() {
            for x in 0..crop.width() {
                let inside = point_in_polygon(x as f32 + 0.5, y as f32 + 0.5, &poly);
                if !inside {
                    crop.set_pixel(x, y, [255, 255, 255]);
                }
            }
        }
    }
    Ok(crop)
}

/// Even-odd ray casting.
fn point_in_polygon(px: f32, py: f32, polygon: &[[f32; 2]]) -> bool {
    let n = polygon.len();
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (polygon[i][0], polygon[i][1]);
        let (xj, yj) = (polygon[j][0], polygon[j][1]);
        if ((yi > py) != (yj > py))
            && (px < (xj - xi) * (py - yi) / (yj - yi) + xi)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Validate a crop request before spending a recognition slot on it.
pub fn validate_bbox(bbox: [f32; 4]) -> Result<()> {
    if !(bbox[0] < bbox[2] && bbox[1] < bbox[3]) {
        return Err(GlmOcrError::config(format!(
            "degenerate region bbox {bbox:?}"
        )));
    }
    if bbox.iter().any(|v| !(0.0..=1000.0).contains(v)) {
        return Err(GlmOcrError::config(format!(
            "region bbox {bbox:?} outside [0, 1000]"
        )));
    }
    Ok(())
}
