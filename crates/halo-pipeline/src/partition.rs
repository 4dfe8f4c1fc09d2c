//! Row-band partitioning with halo rows.
//!
//! An image of `height` rows is split into `workers` contiguous interior
//! bands of `ceil(height / workers)` rows each; the last bands take
//! whatever remains and may be shorter or empty. Each band is then
//! widened by the filter radius on both sides (the halo) so that a
//! worker holding only its halo band can evaluate every pixel of its
//! interior band exactly as a whole-image pass would.
//!
//! ```text
//! height = 10, workers = 3, radius = 1
//!
//!   interior  [0,4)  [4,8)  [8,10)
//!   halo      [0,5)  [3,9)  [7,10)
//! ```
//!
//! Halos are clamped to `[0, height)`, never wrapped. An empty interior
//! band has an empty halo, so neither side of a transfer moves any rows
//! for it.

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// A contiguous range of rows `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowBand {
    /// First row of the band.
    pub start: u32,
    /// Number of rows in the band.
    pub count: u32,
}

impl RowBand {
    /// Create a band.
    #[must_use]
    pub const fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// One past the last row.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start.saturating_add(self.count)
    }

    /// Whether the band covers no rows.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Clip the band to a buffer of `height` rows.
    ///
    /// Returns `None` when the band starts at or beyond `height`;
    /// otherwise the band with its row count shortened to fit.
    #[must_use]
    pub const fn clamp_to(self, height: u32) -> Option<Self> {
        if self.start >= height {
            return None;
        }
        let available = height - self.start;
        let count = if self.count < available {
            self.count
        } else {
            available
        };
        Some(Self::new(self.start, count))
    }
}

impl std::fmt::Display for RowBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// The rows one worker computes and the rows it must receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandAssignment {
    /// Zero-based worker index (worker rank minus one).
    pub worker: usize,
    /// Rows this worker produces output for.
    pub interior: RowBand,
    /// Interior plus up to `radius` rows on each side, clamped to the
    /// image. This is what travels over the wire to the worker.
    pub halo: RowBand,
}

impl BandAssignment {
    /// The interior band in the coordinates of a buffer holding only
    /// the halo band.
    #[must_use]
    pub const fn local_interior(&self) -> RowBand {
        RowBand::new(self.interior.start - self.halo.start, self.interior.count)
    }
}

/// Band layout for one image over a fixed worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    /// Height of the partitioned image.
    pub image_height: u32,
    /// Filter radius used to size the halos.
    pub filter_radius: u32,
    /// Rows per interior band (all but the trailing bands).
    pub rows_per_band: u32,
    /// One assignment per worker, in worker order.
    pub assignments: Vec<BandAssignment>,
}

impl PartitionPlan {
    /// Assignment for worker index `worker`.
    #[must_use]
    pub fn assignment(&self, worker: usize) -> Option<&BandAssignment> {
        self.assignments.get(worker)
    }

    /// Number of workers with a non-empty interior band.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.assignments
            .iter()
            .filter(|a| !a.interior.is_empty())
            .count()
    }
}

/// Split `image_height` rows across `worker_count` workers with halos
/// of `filter_radius` rows.
///
/// The filter radius is unsigned, so a negative radius cannot be
/// expressed; a worker count of zero is rejected.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidPartition`] if `worker_count` is zero
/// or does not fit in a row index.
pub fn compute_bands(
    image_height: u32,
    worker_count: usize,
    filter_radius: u32,
) -> Result<PartitionPlan, PipelineError> {
    if worker_count == 0 {
        return Err(PipelineError::InvalidPartition(
            "worker count must be positive".into(),
        ));
    }
    let workers = u32::try_from(worker_count).map_err(|_| {
        PipelineError::InvalidPartition(format!("{worker_count} workers exceed the row index range"))
    })?;

    let rows_per_band = image_height.div_ceil(workers);

    let assignments = (0..workers)
        .map(|i| {
            let start = rows_per_band.saturating_mul(i).min(image_height);
            let end = start.saturating_add(rows_per_band).min(image_height);
            let interior = RowBand::new(start, end - start);

            let halo = if interior.is_empty() {
                interior
            } else {
                let halo_start = start.saturating_sub(filter_radius);
                let halo_end = end.saturating_add(filter_radius).min(image_height);
                RowBand::new(halo_start, halo_end - halo_start)
            };

            BandAssignment {
                worker: i as usize,
                interior,
                halo,
            }
        })
        .collect();

    Ok(PartitionPlan {
        image_height,
        filter_radius,
        rows_per_band,
        assignments,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn interiors(plan: &PartitionPlan) -> Vec<(u32, u32)> {
        plan.assignments
            .iter()
            .map(|a| (a.interior.start, a.interior.end()))
            .collect()
    }

    fn halos(plan: &PartitionPlan) -> Vec<(u32, u32)> {
        plan.assignments
            .iter()
            .map(|a| (a.halo.start, a.halo.end()))
            .collect()
    }

    #[test]
    fn even_split_without_radius_has_no_halo() {
        let plan = compute_bands(100, 4, 0).unwrap();
        let expected = vec![(0, 25), (25, 50), (50, 75), (75, 100)];
        assert_eq!(interiors(&plan), expected);
        assert_eq!(halos(&plan), expected);
        assert_eq!(plan.rows_per_band, 25);
    }

    #[test]
    fn radius_two_extends_and_clamps_halos() {
        let plan = compute_bands(100, 4, 2).unwrap();
        assert_eq!(
            halos(&plan),
            vec![(0, 27), (23, 52), (48, 77), (73, 100)]
        );
    }

    #[test]
    fn last_band_takes_remainder() {
        let plan = compute_bands(10, 3, 1).unwrap();
        assert_eq!(interiors(&plan), vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(halos(&plan), vec![(0, 5), (3, 9), (7, 10)]);
    }

    #[test]
    fn surplus_workers_get_empty_bands() {
        let plan = compute_bands(5, 4, 1).unwrap();
        assert_eq!(interiors(&plan), vec![(0, 2), (2, 4), (4, 5), (5, 5)]);
        let last = plan.assignment(3).unwrap();
        assert!(last.interior.is_empty());
        assert!(last.halo.is_empty());
        assert_eq!(plan.active_workers(), 3);
    }

    #[test]
    fn interiors_tile_the_image_exactly() {
        for height in 1..40 {
            for workers in 1..9 {
                let plan = compute_bands(height, workers, 3).unwrap();
                let mut next = 0;
                for a in &plan.assignments {
                    assert_eq!(a.interior.start, next.min(height));
                    next = a.interior.end();
                    assert!(a.halo.end() <= height);
                    assert!(a.halo.start <= a.interior.start);
                    assert!(a.halo.end() >= a.interior.end());
                }
                assert_eq!(next, height, "height={height} workers={workers}");
            }
        }
    }

    #[test]
    fn local_interior_is_relative_to_halo() {
        let plan = compute_bands(100, 4, 2).unwrap();
        assert_eq!(plan.assignments[0].local_interior(), RowBand::new(0, 25));
        assert_eq!(plan.assignments[2].local_interior(), RowBand::new(2, 25));
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(matches!(
            compute_bands(10, 0, 1),
            Err(PipelineError::InvalidPartition(_))
        ));
    }

    #[test]
    fn clamp_to_height() {
        assert_eq!(RowBand::new(8, 5).clamp_to(10), Some(RowBand::new(8, 2)));
        assert_eq!(RowBand::new(2, 3).clamp_to(10), Some(RowBand::new(2, 3)));
        assert_eq!(RowBand::new(10, 1).clamp_to(10), None);
    }
}
