use halo_pipeline::PipelineError;

use crate::comm::Rank;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("rank {rank} disconnected")]
    Disconnected { rank: Rank },

    #[error("every peer disconnected")]
    PoolClosed,

    #[error("run aborted by rank {rank}")]
    Aborted { rank: Rank },

    #[error("participant thread for rank {rank} panicked")]
    Panicked { rank: Rank },

    #[error("rank {rank} cannot act as {role}")]
    RoleMismatch { rank: Rank, role: &'static str },

    #[error("rank {rank} is outside a pool of {size}")]
    UnknownRank { rank: Rank, size: usize },

    #[error("no route from rank {from} to rank {to}")]
    Unroutable { from: Rank, to: Rank },

    #[error("payload mismatch: expected {expected} bytes, got {actual}")]
    PayloadMismatch { expected: usize, actual: usize },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid wildcard sentinel {0}")]
    InvalidSentinel(i32),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ClusterError>;
