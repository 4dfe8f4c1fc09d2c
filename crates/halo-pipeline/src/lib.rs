//! halo-pipeline: Pure convolution core (sans-IO).
//!
//! Applies a 2-D weighted-sum filter to a raw pixel buffer:
//! parse filter -> normalize -> convolve rows -> clamp to bytes.
//!
//! The same row-range kernel serves a whole image in one process and a
//! single halo-extended band on a worker; [`partition`] computes those
//! bands. This crate has **no transport or process dependencies**. It
//! operates on in-memory buffers and caller-supplied readers/writers;
//! distribution lives in `halo-cluster`.

pub mod diagnostics;
pub mod filter;
pub mod kernel;
pub mod partition;
pub mod pixel;
pub mod preview;
pub mod types;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use filter::FilterMatrix;
pub use kernel::convolve_rows;
pub use partition::{BandAssignment, PartitionPlan, RowBand, compute_bands};
pub use pixel::PixelBuffer;
pub use types::{Dimensions, PipelineError, RunConfig};

/// Convolve a whole image in one pass.
///
/// The filter is normalized first (see [`FilterMatrix::normalize`]).
/// This is the reference result a distributed run must reproduce byte
/// for byte.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidFilter`] if the filter is not an
/// odd-sized square, or [`PipelineError::Allocation`] if the output
/// cannot be allocated.
pub fn convolve(image: &PixelBuffer, filter: &FilterMatrix) -> Result<PixelBuffer, PipelineError> {
    let normalized = filter.normalize();
    let mut output = PixelBuffer::allocate(image.dimensions())?;
    convolve_rows(
        image,
        RowBand::new(0, image.height()),
        &mut output,
        &normalized,
    )?;
    Ok(output)
}

/// Outcome of [`convolve_until_stable`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    /// Passes run (always at least one).
    pub iterations: u32,
    /// Euclidean distance between the last input and output.
    pub final_distance: f64,
}

/// Re-apply the filter until successive images are within
/// `config.convergence_threshold` of each other or
/// `config.max_iterations` passes have run.
///
/// One pass always runs, even when `max_iterations` is zero.
///
/// # Errors
///
/// Propagates any error from [`convolve`].
pub fn convolve_until_stable(
    image: &PixelBuffer,
    filter: &FilterMatrix,
    config: &RunConfig,
) -> Result<(PixelBuffer, ConvergenceReport), PipelineError> {
    let mut current = convolve(image, filter)?;
    let mut distance = image.euclidean_distance(&current)?;
    let mut iterations = 1;
    debug!(iterations, distance, "convolution pass");

    while distance > config.convergence_threshold && iterations < config.max_iterations {
        let next = convolve(&current, filter)?;
        distance = current.euclidean_distance(&next)?;
        current = next;
        iterations += 1;
        debug!(iterations, distance, "convolution pass");
    }

    Ok((
        current,
        ConvergenceReport {
            iterations,
            final_distance: distance,
        },
    ))
}
