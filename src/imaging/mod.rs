//! Page bitmaps and model-input preprocessing.

mod preprocess;

pub use preprocess::{
    normalize_to_chw, resize_rgb, smart_resize_dims, ResampleFilter, IMAGE_FACTOR,
};

use crate::error::{GlmOcrError, Result};

/// An RGB page bitmap.
///
/// Created by the page loader, immutable afterwards, owned by the
/// orchestrator for the duration of one parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl PageImage {
    /// Wrap raw RGB8 row-major pixel data.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(GlmOcrError::config(format!(
                "pixel buffer length {} does not match {}x{} RGB ({expected})",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decode encoded image bytes (PNG/JPEG) into an RGB bitmap.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).map_err(|e| GlmOcrError::config(format!("failed to decode image bytes: {e}")))?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self {
            width,
            height,
            pixels: rgb.into_raw(),
        })
    }

    /// A solid-color page, used for white PDF backgrounds.
    #[must_use]
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    #[inline]
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[inline]
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    #[inline]
    pub(crate) fn set_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        self.pixels[i..i + 3].copy_from_slice(&rgb);
    }

    /// Crop a pixel-space rectangle, clamped to the page bounds.
    ///
    /// Returns an error when the clamped rectangle is empty.
    pub fn crop(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Self> {
        let x0 = x0.min(self.width);
        let y0 = y0.min(self.height);
        let x1 = x1.min(self.width);
        let y1 = y1.min(self.height);
        if x1 <= x0 || y1 <= y0 {
            return Err(GlmOcrError::config(format!(
                "empty crop [{x0},{y0},{x1},{y1}] on {}x{} page",
                self.width, self.height
            )));
        }
        let (cw, ch) = (x1 - x0, y1 - y0);
        let mut pixels = Vec::with_capacity(cw as usize * ch as usize * 3);
        for y in y0..y1 {
            let row = (y as usize * self.width as usize + x0 as usize) * 3;
            pixels.extend_from_slice(&self.pixels[row..row + cw as usize * 3]);
        }
        Ok(Self {
            width: cw,
            height: ch,
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_validates_length() {
        assert!(PageImage::from_rgb(2, 2, vec![0; 12]).is_ok());
        assert!(PageImage::from_rgb(2, 2, vec![0; 11]).is_err());
    }

    #[test]
    fn test_filled_and_pixel() {
        let page = PageImage::filled(3, 2, [255, 128, 0]);
        assert_eq!(page.pixel(2, 1), [255, 128, 0]);
        assert_eq!(page.pixels().len(), 18);
    }

    #[test]
    fn test_crop_clamps_and_copies() {
        let mut page = PageImage::filled(4, 4, [0, 0, 0]);
        page.set_pixel(2, 2, [9, 9, 9]);
        let crop = page.crop(2, 2, 10, 10).unwrap();
        assert_eq!(crop.width(), 2);
        assert_eq!(crop.height(), 2);
        assert_eq!(crop.pixel(0, 0), [9, 9, 9]);
    }

    #[test]
    fn test_crop_empty_is_error() {
        let page = PageImage::filled(4, 4, [0, 0, 0]);
        assert!(page.crop(3, 3, 3, 4).is_err());
        assert!(page.crop(5, 0, 9, 2).is_err());
    }
}
