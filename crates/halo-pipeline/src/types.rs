//! Shared types for the halo convolution core.

use serde::{Deserialize, Serialize};

/// Declared shape of a raw pixel buffer.
///
/// A pixel is an opaque tuple of `channels` bytes; no color space is
/// implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels (number of rows).
    pub height: u32,
    /// Bytes per pixel.
    pub channels: u32,
}

impl Dimensions {
    /// Create a new shape.
    #[must_use]
    pub const fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Number of bytes in one row (`width * channels`).
    #[must_use]
    pub const fn row_stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Total byte length of a buffer with this shape, or `None` if it
    /// does not fit in `usize`.
    #[must_use]
    pub const fn byte_len(&self) -> Option<usize> {
        match (self.width as usize).checked_mul(self.channels as usize) {
            Some(stride) => stride.checked_mul(self.height as usize),
            None => None,
        }
    }

    /// Same width and channel count, different number of rows.
    #[must_use]
    pub const fn with_height(self, height: u32) -> Self {
        Self { height, ..self }
    }

    /// Reject shapes with a zero width, height or channel count.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidDimensions`] naming the first
    /// zero field.
    pub const fn validate(&self) -> Result<(), PipelineError> {
        if self.width == 0 {
            return Err(PipelineError::InvalidDimensions("width is zero"));
        }
        if self.height == 0 {
            return Err(PipelineError::InvalidDimensions("height is zero"));
        }
        if self.channels == 0 {
            return Err(PipelineError::InvalidDimensions("channel count is zero"));
        }
        Ok(())
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// Configuration for iterative re-filtering.
///
/// A single pass is the default; raising `max_iterations` repeats the
/// convolution until two successive images are within
/// `convergence_threshold` of each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound on convolution passes. At least one pass always runs.
    pub max_iterations: u32,

    /// Stop once the Euclidean distance between the previous and the
    /// new image is at or below this value.
    pub convergence_threshold: f64,
}

impl RunConfig {
    /// Default number of passes.
    pub const DEFAULT_MAX_ITERATIONS: u32 = 1;
    /// Default convergence distance.
    pub const DEFAULT_CONVERGENCE_THRESHOLD: f64 = 1.0;
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            convergence_threshold: Self::DEFAULT_CONVERGENCE_THRESHOLD,
        }
    }
}

/// Errors produced by the convolution core.
///
/// Every variant is terminal for a run: partial convolution output is
/// never meaningful on its own.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Memory for a buffer could not be reserved.
    #[error("failed to allocate {bytes} bytes")]
    Allocation {
        /// Requested size (saturated at `usize::MAX` on overflow).
        bytes: usize,
    },

    /// The source held fewer bytes than the declared shape requires.
    #[error("truncated input: expected {expected} bytes, got {actual}")]
    TruncatedInput {
        /// Bytes required by the declared dimensions.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Two buffers that must share a shape do not.
    #[error("dimension mismatch: {left} vs {right}")]
    DimensionMismatch {
        /// Shape of the receiver.
        left: Dimensions,
        /// Shape of the argument.
        right: Dimensions,
    },

    /// A requested rectangle or coordinate lies outside the buffer.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Band partitioning was asked for an impossible layout.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// The filter cannot be applied (empty, non-square or even-sized).
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A declared dimension is zero.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(&'static str),

    /// A preview was requested for a channel count with no PNG color
    /// type.
    #[error("cannot preview {0}-channel pixels")]
    UnsupportedChannels(u32),

    /// PNG encoding of a preview failed.
    #[error("failed to encode preview: {0}")]
    ImageEncode(#[from] image::ImageError),

    /// Reading or writing an external byte stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn row_stride_and_byte_len() {
        let dims = Dimensions::new(4, 3, 3);
        assert_eq!(dims.row_stride(), 12);
        assert_eq!(dims.byte_len(), Some(36));
    }

    #[test]
    fn validate_rejects_zero_fields() {
        assert!(Dimensions::new(1, 1, 1).validate().is_ok());
        assert!(matches!(
            Dimensions::new(0, 1, 1).validate(),
            Err(PipelineError::InvalidDimensions("width is zero"))
        ));
        assert!(matches!(
            Dimensions::new(1, 0, 1).validate(),
            Err(PipelineError::InvalidDimensions("height is zero"))
        ));
        assert!(matches!(
            Dimensions::new(1, 1, 0).validate(),
            Err(PipelineError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(Dimensions::new(640, 480, 3).to_string(), "640x480x3");
    }

    #[test]
    fn run_config_defaults_to_single_pass() {
        let config = RunConfig::default();
        assert_eq!(config.max_iterations, 1);
        assert!((config.convergence_threshold - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn run_config_partial_json_uses_defaults() {
        let config: RunConfig = serde_json::from_str(r#"{"max_iterations": 8}"#).unwrap();
        assert_eq!(config.max_iterations, 8);
        assert!(
            (config.convergence_threshold - RunConfig::DEFAULT_CONVERGENCE_THRESHOLD).abs()
                < f64::EPSILON
        );
    }
}
