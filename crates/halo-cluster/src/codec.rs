//! Byte encodings for frames and the small structs the coordinator
//! broadcasts.
//!
//! Values are serialized with bincode's standard configuration. On a
//! stream, each frame is preceded by its encoded length as a big-endian
//! `u32`.

use std::io::{ErrorKind, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::comm::Frame;
use crate::error::{ClusterError, Result};

/// Largest encoded frame accepted from a stream (1 GiB).
pub const MAX_FRAME_BYTES: usize = 1 << 30;

/// Encode any serde value.
///
/// # Errors
///
/// Returns [`ClusterError::Codec`] if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ClusterError::Codec(e.to_string()))
}

/// Decode a serde value from the front of `data`.
///
/// # Errors
///
/// Returns [`ClusterError::Codec`] if the bytes are not a valid
/// encoding of `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| ClusterError::Codec(e.to_string()))?;
    Ok(value)
}

/// Write one length-prefixed frame and flush.
///
/// # Errors
///
/// Returns [`ClusterError::FrameTooLarge`] if the encoding exceeds
/// [`MAX_FRAME_BYTES`], or any write error.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = encode(frame)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|_| body.len() <= MAX_FRAME_BYTES)
        .ok_or(ClusterError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_BYTES,
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean end of
/// stream before the length prefix.
///
/// # Errors
///
/// Returns [`ClusterError::FrameTooLarge`] for an oversized prefix,
/// [`ClusterError::Io`] if the stream ends mid-frame, or
/// [`ClusterError::Codec`] for an undecodable body.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ClusterError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode(&body).map(Some)
}
