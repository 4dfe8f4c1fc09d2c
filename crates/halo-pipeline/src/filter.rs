//! Convolution filter matrices.
//!
//! Filters are parsed from a plain text format: one row per line,
//! whitespace-separated decimal weights. Weights may be negative or
//! fractional.
//!
//! # Row widths
//!
//! The declared width is the **longest** row seen and the declared
//! height is the number of non-empty rows. Weights are stored as one
//! flat list and laid out row-major using the declared width, so a file
//! whose rows have unequal lengths ends up with its weights shifted
//! into neighbouring rows rather than padded in place. Missing trailing
//! weights are zero. This matches the established file semantics and is
//! logged as a warning rather than rejected.

use std::io::BufRead;
use std::str::FromStr;

use tracing::warn;

use crate::types::PipelineError;

/// A dense grid of real-valued filter weights, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterMatrix {
    width: u32,
    height: u32,
    values: Vec<f64>,
}

impl FilterMatrix {
    /// Build a filter from row-major weights.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidFilter`] if `values` does not
    /// hold exactly `width * height` weights.
    pub fn new(width: u32, height: u32, values: Vec<f64>) -> Result<Self, PipelineError> {
        let expected = width as usize * height as usize;
        if values.len() != expected {
            return Err(PipelineError::InvalidFilter(format!(
                "{width}x{height} filter needs {expected} weights, got {}",
                values.len()
            )));
        }
        Ok(Self {
            width,
            height,
            values,
        })
    }

    /// Parse a filter from its text representation.
    ///
    /// Each line is split on whitespace and tokens are parsed as `f64`
    /// until the first token that is not a number; the rest of that
    /// line is ignored. Lines that yield no numbers (including trailing
    /// blank lines) do not count as rows. A token must be a whole
    /// number, so `1.5,` stops the line rather than contributing `1.5`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if reading the source fails.
    pub fn parse_from_text<R: BufRead>(source: R) -> Result<Self, PipelineError> {
        let mut flat = Vec::new();
        let mut max_row_width = 0usize;
        let mut min_row_width = usize::MAX;
        let mut rows = 0u32;

        for line in source.lines() {
            let line = line?;
            let before = flat.len();
            for token in line.split_whitespace() {
                match token.parse::<f64>() {
                    Ok(v) => flat.push(v),
                    Err(_) => break,
                }
            }
            let row_width = flat.len() - before;
            if row_width > 0 {
                rows += 1;
                max_row_width = max_row_width.max(row_width);
                min_row_width = min_row_width.min(row_width);
            }
        }

        if rows > 0 && min_row_width != max_row_width {
            warn!(
                min_row_width,
                max_row_width, "filter rows have unequal widths; weights will shift across rows"
            );
        }

        let width = u32::try_from(max_row_width)
            .map_err(|_| PipelineError::InvalidFilter(format!("row of {max_row_width} weights is too wide")))?;
        flat.resize(max_row_width * rows as usize, 0.0);

        Ok(Self {
            width,
            height: rows,
            values: flat,
        })
    }

    /// Declared width (longest parsed row).
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Declared height (number of non-empty rows).
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// All weights, row-major.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Weight at `(row, column)`.
    #[must_use]
    pub fn weight(&self, row: u32, column: u32) -> Option<f64> {
        if row >= self.height || column >= self.width {
            return None;
        }
        self.values
            .get(row as usize * self.width as usize + column as usize)
            .copied()
    }

    /// Support radius `(height - 1) / 2`: the largest row or column
    /// offset a weight can reach from the filter centre.
    #[must_use]
    pub const fn radius(&self) -> u32 {
        self.height.saturating_sub(1) / 2
    }

    /// Sum of all weights.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Radius of a filter that can be applied by the kernel.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidFilter`] unless the filter is
    /// non-empty, square and has an odd side length.
    pub fn kernel_radius(&self) -> Result<u32, PipelineError> {
        if self.height == 0 || self.width == 0 {
            return Err(PipelineError::InvalidFilter("filter has no weights".into()));
        }
        if self.width != self.height {
            return Err(PipelineError::InvalidFilter(format!(
                "filter must be square, got {}x{}",
                self.width, self.height
            )));
        }
        if self.height % 2 == 0 {
            return Err(PipelineError::InvalidFilter(format!(
                "filter side must be odd, got {}",
                self.height
            )));
        }
        Ok(self.radius())
    }

    /// Produce a copy whose weights are divided by their sum.
    ///
    /// When the weights sum to exactly zero (edge-detection kernels, for
    /// instance) the copy keeps the original weights unchanged.
    #[must_use = "returns the normalized filter"]
    pub fn normalize(&self) -> Self {
        let sum = self.sum();
        if sum == 0.0 {
            warn!("filter weights sum to zero; using them unnormalized");
            return self.clone();
        }
        Self {
            width: self.width,
            height: self.height,
            values: self.values.iter().map(|w| w / sum).collect(),
        }
    }
}

impl FromStr for FilterMatrix {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_from_text(s.as_bytes())
    }
}
