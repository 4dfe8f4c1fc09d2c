//! PNG previews of raw pixel buffers.
//!
//! Raw buffers carry no color information, so the channel count alone
//! picks the PNG color type: 1 = gray, 2 = gray + alpha, 3 = RGB,
//! 4 = RGBA. Other channel counts cannot be previewed.

use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat};

use crate::pixel::PixelBuffer;
use crate::types::PipelineError;

/// Wrap a copy of the buffer in an [`image::DynamicImage`].
///
/// # Errors
///
/// Returns [`PipelineError::UnsupportedChannels`] for channel counts
/// other than 1 to 4.
pub fn to_dynamic_image(buffer: &PixelBuffer) -> Result<DynamicImage, PipelineError> {
    let (w, h) = (buffer.width(), buffer.height());
    let raw = buffer.as_bytes().to_vec();
    let image = match buffer.channels() {
        1 => ImageBuffer::from_raw(w, h, raw).map(DynamicImage::ImageLuma8),
        2 => ImageBuffer::from_raw(w, h, raw).map(DynamicImage::ImageLumaA8),
        3 => ImageBuffer::from_raw(w, h, raw).map(DynamicImage::ImageRgb8),
        4 => ImageBuffer::from_raw(w, h, raw).map(DynamicImage::ImageRgba8),
        other => return Err(PipelineError::UnsupportedChannels(other)),
    };
    image.ok_or(PipelineError::UnsupportedChannels(buffer.channels()))
}

/// Encode the buffer as PNG bytes.
///
/// # Errors
///
/// Returns [`PipelineError::UnsupportedChannels`] as for
/// [`to_dynamic_image`], or [`PipelineError::ImageEncode`] if PNG
/// encoding fails.
pub fn encode_png(buffer: &PixelBuffer) -> Result<Vec<u8>, PipelineError> {
    let image = to_dynamic_image(buffer)?;
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
