//! Moves filter, shape and row bands between the leader and its
//! workers.
//!
//! Message sequence for one run (every broadcast is rooted at
//! [`LEADER`]):
//!
//! 1. broadcast filter width and height
//! 2. broadcast filter weights, row-major
//! 3. broadcast image width, height and channel count
//! 4. leader sends worker `i` (rank `i + 1`) its halo band, tag
//!    [`Tag::IMAGE_DATA`]
//! 5. worker `i` sends back its interior band, tag [`Tag::RESULT`]
//!
//! Both sides derive the same [`PartitionPlan`] from the broadcast
//! values, so band layout never travels. Workers with an empty interior
//! band exchange nothing in steps 4 and 5.

use halo_pipeline::{
    BandAssignment, Dimensions, FilterMatrix, PartitionPlan, PixelBuffer, RowBand, compute_bands,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::codec;
use crate::comm::{Communicator, LEADER, Rank, Source, Tag, TagMatch};
use crate::error::{ClusterError, Result};

/// Filter shape as broadcast ahead of the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FilterShape {
    width: u32,
    height: u32,
}

/// Inputs every worker learns from the leader's broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedInputs {
    /// The un-normalized filter.
    pub filter: FilterMatrix,
    /// Shape of the full image.
    pub dimensions: Dimensions,
}

/// Send the rows of `image` covered by `band` to `dest`.
///
/// The band is clipped to the image first. A band starting at or past
/// the last row sends nothing, and the matching [`recv_rows`] receives
/// nothing.
///
/// # Errors
///
/// Propagates transport errors from [`Communicator::send`].
pub fn send_rows<C: Communicator + ?Sized>(
    comm: &mut C,
    image: &PixelBuffer,
    band: RowBand,
    dest: Rank,
    tag: Tag,
) -> Result<()> {
    let Some(band) = band.clamp_to(image.height()) else {
        trace!(dest, %band, "band outside image; nothing sent");
        return Ok(());
    };
    comm.send(dest, tag, image.band_bytes(band)?)
}

/// Receive rows into the part of `image` covered by `band`, clipped as
/// in [`send_rows`]. Returns the sender's rank, or `None` when the
/// clipped band is empty and nothing was received.
///
/// # Errors
///
/// Returns [`ClusterError::PayloadMismatch`] if the message does not
/// fill the band exactly, or a transport error.
pub fn recv_rows<C: Communicator + ?Sized>(
    comm: &mut C,
    image: &mut PixelBuffer,
    band: RowBand,
    source: Source,
    tag: TagMatch,
) -> Result<Option<Rank>> {
    let Some(band) = band.clamp_to(image.height()) else {
        trace!(%band, "band outside image; nothing received");
        return Ok(None);
    };
    let envelope = comm.recv(source, tag)?;
    let target = image.band_bytes_mut(band)?;
    if envelope.payload.len() != target.len() {
        return Err(ClusterError::PayloadMismatch {
            expected: target.len(),
            actual: envelope.payload.len(),
        });
    }
    target.copy_from_slice(&envelope.payload);
    Ok(Some(envelope.source))
}

/// Rank of worker index `worker`.
#[must_use]
pub const fn worker_rank(worker: usize) -> Rank {
    worker + 1
}

/// Drives the message sequence over one communicator.
pub struct DistributionCoordinator<'c, C: Communicator + ?Sized> {
    comm: &'c mut C,
}

impl<'c, C: Communicator + ?Sized> DistributionCoordinator<'c, C> {
    pub fn new(comm: &'c mut C) -> Self {
        Self { comm }
    }

    /// Workers in the pool (every rank but the leader).
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.comm.size().saturating_sub(1)
    }

    /// The band layout both sides use for an image of `dimensions` and a
    /// filter of `radius`.
    ///
    /// # Errors
    ///
    /// Returns [`halo_pipeline::PipelineError::InvalidPartition`] when the
    /// pool has no workers.
    pub fn plan(&self, dimensions: Dimensions, radius: u32) -> Result<PartitionPlan> {
        Ok(compute_bands(dimensions.height, self.worker_count(), radius)?)
    }

    /// Leader: broadcast the filter shape, weights and image shape.
    ///
    /// # Errors
    ///
    /// Propagates codec and transport errors.
    pub fn share_inputs(&mut self, filter: &FilterMatrix, dimensions: Dimensions) -> Result<()> {
        let shape = FilterShape {
            width: filter.width(),
            height: filter.height(),
        };
        self.comm.broadcast(LEADER, &mut codec::encode(&shape)?)?;
        self.comm
            .broadcast(LEADER, &mut codec::encode(&filter.values())?)?;
        self.comm.broadcast(LEADER, &mut codec::encode(&dimensions)?)?;
        debug!(
            filter_width = shape.width,
            filter_height = shape.height,
            %dimensions,
            "inputs broadcast"
        );
        Ok(())
    }

    /// Worker: receive what [`share_inputs`](Self::share_inputs) sent.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Codec`] for undecodable broadcasts, a
    /// pipeline error if the weights do not match the shape, or a
    /// transport error.
    pub fn receive_inputs(&mut self) -> Result<SharedInputs> {
        let mut buffer = Vec::new();
        self.comm.broadcast(LEADER, &mut buffer)?;
        let shape: FilterShape = codec::decode(&buffer)?;
        self.comm.broadcast(LEADER, &mut buffer)?;
        let weights: Vec<f64> = codec::decode(&buffer)?;
        self.comm.broadcast(LEADER, &mut buffer)?;
        let dimensions: Dimensions = codec::decode(&buffer)?;

        let filter = FilterMatrix::new(shape.width, shape.height, weights)?;
        debug!(
            filter_width = shape.width,
            filter_height = shape.height,
            %dimensions,
            "inputs received"
        );
        Ok(SharedInputs { filter, dimensions })
    }

    /// Leader: send every worker its halo band.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub fn scatter(&mut self, image: &PixelBuffer, plan: &PartitionPlan) -> Result<()> {
        for assignment in &plan.assignments {
            if assignment.halo.is_empty() {
                continue;
            }
            let dest = worker_rank(assignment.worker);
            send_rows(&mut *self.comm, image, assignment.halo, dest, Tag::IMAGE_DATA)?;
            trace!(dest, halo = %assignment.halo, "band sent");
        }
        Ok(())
    }

    /// Worker: receive this worker's halo band into a buffer sized to
    /// it. Returns `None` for an empty band.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if the band buffer cannot be allocated,
    /// [`ClusterError::PayloadMismatch`] for a short band, or a
    /// transport error.
    pub fn receive_band(
        &mut self,
        dimensions: Dimensions,
        assignment: &BandAssignment,
    ) -> Result<Option<PixelBuffer>> {
        if assignment.halo.is_empty() {
            return Ok(None);
        }
        let mut band = PixelBuffer::allocate(dimensions.with_height(assignment.halo.count))?;
        let whole = RowBand::new(0, assignment.halo.count);
        recv_rows(
            &mut *self.comm,
            &mut band,
            whole,
            Source::Rank(LEADER),
            Tag::IMAGE_DATA.into(),
        )?;
        Ok(Some(band))
    }

    /// Worker: send the interior rows of a computed band back to the
    /// leader. `output` is band-sized, as returned by
    /// [`receive_band`](Self::receive_band).
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub fn return_band(&mut self, output: &PixelBuffer, assignment: &BandAssignment) -> Result<()> {
        if assignment.interior.is_empty() {
            return Ok(());
        }
        send_rows(
            &mut *self.comm,
            output,
            assignment.local_interior(),
            LEADER,
            Tag::RESULT,
        )
    }

    /// Leader: receive every worker's interior band into `output`, in
    /// band order.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::PayloadMismatch`] for a short band, or a
    /// transport error.
    pub fn gather(&mut self, output: &mut PixelBuffer, plan: &PartitionPlan) -> Result<()> {
        for assignment in &plan.assignments {
            if assignment.interior.is_empty() {
                continue;
            }
            let source = worker_rank(assignment.worker);
            recv_rows(
                &mut *self.comm,
                output,
                assignment.interior,
                Source::Rank(source),
                Tag::RESULT.into(),
            )?;
            trace!(source, interior = %assignment.interior, "band received");
        }
        Ok(())
    }
}
