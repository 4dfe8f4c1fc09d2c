//! halo-cluster: leader/worker distribution of the halo convolution.
//!
//! A pool of ranks exchanges frames through a [`Communicator`]. The
//! [`coordinator`] defines what travels (filter, image shape, halo
//! bands, results) and the [`orchestrator`] runs each participant
//! through its phases. Two transports are provided: [`local`] for
//! threads in one process and [`tcp`] for separate processes.
//!
//! The distributed result is byte-identical to
//! [`halo_pipeline::convolve`] on the whole image, for any number of
//! workers.

pub mod codec;
pub mod comm;
pub mod coordinator;
pub mod error;
pub mod local;
pub mod orchestrator;
pub mod tcp;

pub use comm::{
    ANY_SOURCE, ANY_TAG, Communicator, Envelope, LEADER, Rank, Source, Tag, TagMatch, Traffic,
};
pub use coordinator::{DistributionCoordinator, SharedInputs, recv_rows, send_rows};
pub use error::{ClusterError, Result};
pub use local::{LocalCluster, LocalCommunicator};
pub use orchestrator::{LeaderJob, LocalRun, Phase, Role, RunReport, run, run_local};
pub use tcp::{LeaderListener, TcpCommunicator};
