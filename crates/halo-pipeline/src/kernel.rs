//! Weighted-sum convolution over a range of rows.
//!
//! For an output pixel at `(r, c)` and a filter of radius `s`, each
//! channel accumulates
//!
//! ```text
//! acc = Σ_{p=-s..=s} Σ_{q=-s..=s} input[r - p][c - q] * filter[p + s][q + s]
//! ```
//!
//! over neighbours that fall inside the input. Neighbours outside the
//! buffer contribute nothing (zero padding). Accumulation is in `f64`;
//! the result is truncated toward zero and clamped to `0..=255` only
//! when it is stored. A sum within `1e-9` of an integer counts
//! as that integer, so `9 * (10 / 9)` stores 10 rather than 9.
//!
//! The kernel never normalizes the filter. Callers pass a filter that
//! has already been through [`FilterMatrix::normalize`].

use crate::filter::FilterMatrix;
use crate::partition::RowBand;
use crate::pixel::PixelBuffer;
use crate::types::PipelineError;

/// Convolve the rows of `band` from `input` into the same rows of
/// `output`.
///
/// Rows of `output` outside `band` are not touched. A band reaching
/// past the bottom of the image is clipped to it.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if `input` and `output`
/// differ in shape, or [`PipelineError::InvalidFilter`] if the filter
/// is not an odd-sized square.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
pub fn convolve_rows(
    input: &PixelBuffer,
    band: RowBand,
    output: &mut PixelBuffer,
    normalized_filter: &FilterMatrix,
) -> Result<(), PipelineError> {
    if input.dimensions() != output.dimensions() {
        return Err(PipelineError::DimensionMismatch {
            left: input.dimensions(),
            right: output.dimensions(),
        });
    }
    let radius = normalized_filter.kernel_radius()?;
    let Some(band) = band.clamp_to(input.height()) else {
        return Ok(());
    };

    let dims = input.dimensions();
    let channels = dims.channels as usize;
    let width = i64::from(dims.width);
    let height = i64::from(dims.height);
    let s = i64::from(radius);
    let side = normalized_filter.width() as usize;
    let weights = normalized_filter.values();

    let mut acc = vec![0.0f64; channels];

    for row in band.start..band.end() {
        let r = i64::from(row);
        let mut out_row = vec![0u8; dims.row_stride()];

        for (col, out_pixel) in out_row.chunks_exact_mut(channels).enumerate() {
            let c = col as i64;
            acc.fill(0.0);

            for p in -s..=s {
                let in_r = r - p;
                if in_r < 0 || in_r >= height {
                    continue;
                }
                let Some(in_row) = input.row(in_r as u32) else {
                    continue;
                };
                let weight_row = &weights[(p + s) as usize * side..][..side];

                for q in -s..=s {
                    let in_c = c - q;
                    if in_c < 0 || in_c >= width {
                        continue;
                    }
                    let w = weight_row[(q + s) as usize];
                    let in_pixel = &in_row[in_c as usize * channels..][..channels];
                    for (a, &byte) in acc.iter_mut().zip(in_pixel) {
                        *a += f64::from(byte) * w;
                    }
                }
            }

            for (dst, &a) in out_pixel.iter_mut().zip(&acc) {
                *dst = clamp_channel(a);
            }
        }

        if let Some(dst) = output.row_mut(row) {
            dst.copy_from_slice(&out_row);
        }
    }

    Ok(())
}

/// Largest distance from an integer still treated as f64 noise.
const SNAP_EPSILON: f64 = 1e-9;

/// Truncate an accumulated channel value toward zero and clamp it to a
/// byte.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_channel(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    let nearest = value.round();
    let whole = if (value - nearest).abs() < SNAP_EPSILON {
        nearest
    } else {
        value.trunc()
    };
    whole.clamp(0.0, 255.0) as u8
}
