//! Page loading: turn an input document into an ordered list of page bitmaps.
//!
//! PDF rasterization itself is an opaque collaborator behind the
//! [`PdfRenderer`] trait; this module owns the scale rule, the page cap, and
//! the input-variant dispatch.

use crate::error::{GlmOcrError, Result};
use crate::imaging::PageImage;

/// Input accepted by [`crate::pipeline::OcrPipeline::parse`].
#[derive(Debug, Clone)]
pub enum InputDocument {
    /// An already decoded page bitmap.
    Image(PageImage),
    /// Encoded image bytes (PNG/JPEG).
    ImageBytes(Vec<u8>),
    /// A PDF document.
    PdfBytes(Vec<u8>),
}

/// Rasterization contract for PDF inputs.
///
/// Implementations rasterize one page at the given scale factor (1.0 = 72
/// dpi) onto a white background. The pipeline ships without a concrete
/// renderer; hosts inject one at construction time.
pub trait PdfRenderer: Send + Sync {
    /// Number of pages in the document.
    fn page_count(&self, bytes: &[u8]) -> Result<usize>;

    /// Media-box size of a page in points.
    fn page_size_points(&self, bytes: &[u8], index: usize) -> Result<(f32, f32)>;

    /// Rasterize a page to RGB at `scale` times its point size.
    fn render_page(&self, bytes: &[u8], index: usize, scale: f32) -> Result<PageImage>;
}

/// Compute the rasterization scale for one page.
///
/// The long side is capped at `max_long_side` pixels: the scale is the
/// smaller of the dpi-derived factor and the cap-derived factor.
#[must_use]
pub fn page_render_scale(dpi: f32, max_long_side: u32, long_side_points: f32) -> f32 {
    let dpi_scale = dpi / 72.0;
    if long_side_points <= 0.0 {
        return dpi_scale;
    }
    let cap_scale = max_long_side as f32 / long_side_points;
    dpi_scale.min(cap_scale)
}

/// Load the ordered page list for an input document.
///
/// `effective_cap` applies to PDF inputs only. A PDF with zero requested
/// pages is an invalid-configuration error; a PDF input without an injected
/// renderer is `NotImplemented`.
pub fn load_pages(
    input: &InputDocument,
    effective_cap: Option<u32>,
    dpi: f32,
    max_long_side: u32,
    renderer: Option<&dyn PdfRenderer>,
) -> Result<Vec<PageImage>> {
    match input {
        InputDocument::Image(page) => Ok(vec![page.clone()]),
        InputDocument::ImageBytes(bytes) => Ok(vec![PageImage::decode(bytes)?]),
        InputDocument::PdfBytes(bytes) => {
            let renderer = renderer.ok_or_else(|| GlmOcrError::NotImplemented {
                feature: "PDF rasterization (no renderer injected)".to_string(),
            })?;
            let total = renderer.page_count(bytes)?;
            let requested = match effective_cap {
                Some(cap) => total.min(cap as usize),
                None => total,
            };
            if requested == 0 {
                return Err(GlmOcrError::config(format!(
                    "requested page count is zero (document has {total} pages)"
                )));
            }
            let mut pages = Vec::with_capacity(requested);
            for index in 0..requested {
                let (w_pts, h_pts) = renderer.page_size_points(bytes, index)?;
                let scale = page_render_scale(dpi, max_long_side, w_pts.max(h_pts));
                let page = renderer.render_page(bytes, index, scale)?;
                log::debug!(
                    "loaded pdf page {index}: {}x{} px at scale {scale:.3}",
                    page.width(),
                    page.height()
                );
                pages.push(page);
            }
            Ok(pages)
        }
    }
}
