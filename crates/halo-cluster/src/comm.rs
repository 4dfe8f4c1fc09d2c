//! Rank-addressed message passing.
//!
//! A pool of `size` participants is numbered `0..size`; rank
//! [`LEADER`] owns the inputs. Transports implement only two
//! primitives, [`Communicator::deliver`] and [`Communicator::mailbox`];
//! point-to-point send/receive, broadcast and abort are built on top of
//! them here, so every transport matches messages the same way:
//!
//! - A receive names a [`Source`] and a [`TagMatch`], either of which
//!   may be a wildcard. Frames that arrive but do not match are queued
//!   and handed to a later matching receive, oldest first.
//! - Collective frames (broadcasts) are never matched by a
//!   point-to-point receive, wildcard or not.
//! - An abort frame from any peer fails the pending receive.
//!
//! All operations block the calling thread until they complete. There
//! are no timeouts: a participant that never sends stalls its receiver.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, Result};

/// Participant index within a pool.
pub type Rank = usize;

/// The rank that owns the image and filter and drives distribution.
pub const LEADER: Rank = 0;

/// Raw sentinel meaning "receive from any source".
pub const ANY_SOURCE: i32 = -1;

/// Raw sentinel meaning "receive with any tag".
pub const ANY_TAG: i32 = -1;

/// Application label attached to point-to-point messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub u32);

impl Tag {
    /// Halo-extended band rows, leader to worker.
    pub const IMAGE_DATA: Self = Self(0);
    /// Computed interior rows, worker to leader.
    pub const RESULT: Self = Self(1);
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which sender a receive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Any rank.
    Any,
    /// Exactly this rank.
    Rank(Rank),
}

impl Source {
    /// Map a raw rank, where [`ANY_SOURCE`] is the wildcard.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InvalidSentinel`] for any other negative
    /// value.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            ANY_SOURCE => Ok(Self::Any),
            r if r >= 0 => Ok(Self::Rank(r.unsigned_abs() as Rank)),
            other => Err(ClusterError::InvalidSentinel(other)),
        }
    }

    const fn accepts(self, rank: Rank) -> bool {
        match self {
            Self::Any => true,
            Self::Rank(r) => r == rank,
        }
    }
}

/// Which tags a receive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMatch {
    /// Any tag.
    Any,
    /// Exactly this tag.
    Exact(Tag),
}

impl TagMatch {
    /// Map a raw tag, where [`ANY_TAG`] is the wildcard.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InvalidSentinel`] for any other negative
    /// value.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            ANY_TAG => Ok(Self::Any),
            t if t >= 0 => Ok(Self::Exact(Tag(t.unsigned_abs()))),
            other => Err(ClusterError::InvalidSentinel(other)),
        }
    }

    fn accepts(self, tag: Tag) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(t) => t == tag,
        }
    }
}

impl From<Tag> for TagMatch {
    fn from(tag: Tag) -> Self {
        Self::Exact(tag)
    }
}

/// Traffic class of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Tagged send/receive.
    PointToPoint,
    /// Broadcast from a root.
    Collective,
    /// The sender gave up; every receiver should fail.
    Abort,
    /// Transport setup (rank assignment).
    Handshake,
}

/// Unit of transfer between participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub source: Rank,
    pub tag: Tag,
    pub channel: Channel,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub const fn new(source: Rank, tag: Tag, channel: Channel, payload: Vec<u8>) -> Self {
        Self {
            source,
            tag,
            channel,
            payload,
        }
    }
}

/// A received point-to-point message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Rank that sent the message.
    pub source: Rank,
    /// Tag it was sent with.
    pub tag: Tag,
    /// Message bytes.
    pub payload: Vec<u8>,
}

/// Message and byte counts for one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

impl Traffic {
    /// Counts accumulated since `earlier`.
    #[must_use]
    pub const fn since(&self, earlier: &Self) -> Self {
        Self {
            messages_sent: self.messages_sent - earlier.messages_sent,
            bytes_sent: self.bytes_sent - earlier.bytes_sent,
            messages_received: self.messages_received - earlier.messages_received,
            bytes_received: self.bytes_received - earlier.bytes_received,
        }
    }
}

/// Incoming frames for one participant, with the queue of frames that
/// arrived before anyone asked for them.
#[derive(Debug)]
pub struct Mailbox {
    incoming: Receiver<Frame>,
    pending: VecDeque<Frame>,
    traffic: Traffic,
}

impl Mailbox {
    #[must_use]
    pub const fn new(incoming: Receiver<Frame>) -> Self {
        Self {
            incoming,
            pending: VecDeque::new(),
            traffic: Traffic {
                messages_sent: 0,
                bytes_sent: 0,
                messages_received: 0,
                bytes_received: 0,
            },
        }
    }

    /// Block until a frame on `channel` from an accepted source with an
    /// accepted tag is available. Collective frames ignore the tag.
    fn take(&mut self, source: Source, tag: TagMatch, channel: Channel) -> Result<Frame> {
        let matches = |f: &Frame| {
            f.channel == channel
                && source.accepts(f.source)
                && (channel == Channel::Collective || tag.accepts(f.tag))
        };

        let queued = self.pending.iter().position(&matches);
        if let Some(frame) = queued.and_then(|i| self.pending.remove(i)) {
            return Ok(self.count_received(frame));
        }

        loop {
            let frame = self.incoming.recv().map_err(|_| match source {
                Source::Rank(rank) => ClusterError::Disconnected { rank },
                Source::Any => ClusterError::PoolClosed,
            })?;
            if frame.channel == Channel::Abort {
                return Err(ClusterError::Aborted { rank: frame.source });
            }
            if matches(&frame) {
                return Ok(self.count_received(frame));
            }
            debug!(
                source = frame.source,
                tag = %frame.tag,
                channel = ?frame.channel,
                "queueing unmatched frame"
            );
            self.pending.push_back(frame);
        }
    }

    fn count_received(&mut self, frame: Frame) -> Frame {
        self.traffic.messages_received += 1;
        self.traffic.bytes_received += frame.payload.len() as u64;
        frame
    }

    fn count_sent(&mut self, bytes: usize) {
        self.traffic.messages_sent += 1;
        self.traffic.bytes_sent += bytes as u64;
    }
}

/// A participant's handle on the pool.
pub trait Communicator {
    /// This participant's rank.
    fn rank(&self) -> Rank;

    /// Number of participants, leader included.
    fn size(&self) -> usize;

    /// Hand a frame to the transport for delivery to `dest`, which is
    /// never this participant's own rank.
    ///
    /// # Errors
    ///
    /// Transport-specific: the peer is gone or unreachable.
    fn deliver(&mut self, dest: Rank, frame: Frame) -> Result<()>;

    /// This participant's incoming frames.
    fn mailbox(&mut self) -> &mut Mailbox;

    /// Counts of everything sent and received so far.
    fn traffic(&mut self) -> Traffic {
        self.mailbox().traffic
    }

    /// Reject ranks outside the pool.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownRank`].
    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.size() {
            return Err(ClusterError::UnknownRank {
                rank,
                size: self.size(),
            });
        }
        Ok(())
    }

    /// Send `payload` to `dest` with `tag`. Blocks until the transport
    /// has accepted the bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownRank`] for a rank outside the pool,
    /// or a transport error.
    fn send(&mut self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        self.check_rank(dest)?;
        let frame = Frame::new(self.rank(), tag, Channel::PointToPoint, payload.to_vec());
        if dest == self.rank() {
            self.mailbox().pending.push_back(frame);
        } else {
            self.deliver(dest, frame)?;
        }
        self.mailbox().count_sent(payload.len());
        Ok(())
    }

    /// Block until a point-to-point message matching `source` and `tag`
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Disconnected`] / [`ClusterError::PoolClosed`]
    /// if no matching sender remains, or [`ClusterError::Aborted`] if a
    /// peer aborted the run.
    fn recv(&mut self, source: Source, tag: TagMatch) -> Result<Envelope> {
        if let Source::Rank(rank) = source {
            self.check_rank(rank)?;
        }
        let frame = self.mailbox().take(source, tag, Channel::PointToPoint)?;
        Ok(Envelope {
            source: frame.source,
            tag: frame.tag,
            payload: frame.payload,
        })
    }

    /// Collective broadcast. On `root`, `buffer` is sent to every other
    /// rank; elsewhere it is replaced by the root's bytes. Every rank
    /// must make the same sequence of broadcast calls.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send) on the root and
    /// [`recv`](Self::recv) elsewhere.
    fn broadcast(&mut self, root: Rank, buffer: &mut Vec<u8>) -> Result<()> {
        self.check_rank(root)?;
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&d| d != root) {
                let frame = Frame::new(root, Tag(0), Channel::Collective, buffer.clone());
                self.deliver(dest, frame)?;
                self.mailbox().count_sent(buffer.len());
            }
        } else {
            let frame = self
                .mailbox()
                .take(Source::Rank(root), TagMatch::Any, Channel::Collective)?;
            *buffer = frame.payload;
        }
        Ok(())
    }

    /// Tell every other rank to give up. Best effort: peers that are
    /// already gone are skipped.
    fn abort(&mut self) {
        let me = self.rank();
        for dest in (0..self.size()).filter(|&d| d != me) {
            let frame = Frame::new(me, Tag(0), Channel::Abort, Vec::new());
            if let Err(e) = self.deliver(dest, frame) {
                debug!(dest, error = %e, "abort not delivered");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn raw_sentinels_map_to_wildcards() {
        assert_eq!(Source::from_raw(ANY_SOURCE).unwrap(), Source::Any);
        assert_eq!(Source::from_raw(3).unwrap(), Source::Rank(3));
        assert!(matches!(
            Source::from_raw(-7),
            Err(ClusterError::InvalidSentinel(-7))
        ));

        assert_eq!(TagMatch::from_raw(ANY_TAG).unwrap(), TagMatch::Any);
        assert_eq!(TagMatch::from_raw(1).unwrap(), TagMatch::Exact(Tag::RESULT));
        assert!(TagMatch::from_raw(-2).is_err());
    }

    fn frame(source: Rank, tag: u32, channel: Channel, byte: u8) -> Frame {
        Frame::new(source, Tag(tag), channel, vec![byte])
    }

    #[test]
    fn take_queues_unmatched_frames_in_order() {
        let (tx, rx) = mpsc::channel();
        let mut mailbox = Mailbox::new(rx);
        tx.send(frame(2, 0, Channel::PointToPoint, 1)).unwrap();
        tx.send(frame(1, 0, Channel::PointToPoint, 2)).unwrap();
        tx.send(frame(2, 0, Channel::PointToPoint, 3)).unwrap();

        let first = mailbox
            .take(Source::Rank(1), TagMatch::Any, Channel::PointToPoint)
            .unwrap();
        assert_eq!(first.payload, vec![2]);

        // Both rank-2 frames were queued; they come back oldest first.
        let a = mailbox
            .take(Source::Any, TagMatch::Any, Channel::PointToPoint)
            .unwrap();
        let b = mailbox
            .take(Source::Any, TagMatch::Any, Channel::PointToPoint)
            .unwrap();
        assert_eq!((a.payload[0], b.payload[0]), (1, 3));
        assert_eq!(mailbox.traffic.messages_received, 3);
    }

    #[test]
    fn wildcard_receive_skips_collective_frames() {
        let (tx, rx) = mpsc::channel();
        let mut mailbox = Mailbox::new(rx);
        tx.send(frame(0, 0, Channel::Collective, 9)).unwrap();
        tx.send(frame(0, 5, Channel::PointToPoint, 7)).unwrap();

        let p2p = mailbox
            .take(Source::Any, TagMatch::Any, Channel::PointToPoint)
            .unwrap();
        assert_eq!(p2p.payload, vec![7]);
        let bcast = mailbox
            .take(Source::Rank(0), TagMatch::Exact(Tag(99)), Channel::Collective)
            .unwrap();
        assert_eq!(bcast.payload, vec![9]);
    }

    #[test]
    fn abort_frame_fails_receive() {
        let (tx, rx) = mpsc::channel();
        let mut mailbox = Mailbox::new(rx);
        tx.send(frame(3, 0, Channel::Abort, 0)).unwrap();
        let result = mailbox.take(Source::Rank(0), TagMatch::Any, Channel::PointToPoint);
        assert!(matches!(result, Err(ClusterError::Aborted { rank: 3 })));
    }

    #[test]
    fn closed_channel_reports_disconnect() {
        let (tx, rx) = mpsc::channel::<Frame>();
        drop(tx);
        let mut mailbox = Mailbox::new(rx);
        assert!(matches!(
            mailbox.take(Source::Rank(4), TagMatch::Any, Channel::PointToPoint),
            Err(ClusterError::Disconnected { rank: 4 })
        ));
        assert!(matches!(
            mailbox.take(Source::Any, TagMatch::Any, Channel::PointToPoint),
            Err(ClusterError::PoolClosed)
        ));
    }

    #[test]
    fn traffic_difference() {
        let later = Traffic {
            messages_sent: 5,
            bytes_sent: 100,
            messages_received: 2,
            bytes_received: 40,
        };
        let earlier = Traffic {
            messages_sent: 1,
            bytes_sent: 10,
            messages_received: 2,
            bytes_received: 40,
        };
        assert_eq!(
            later.since(&earlier),
            Traffic {
                messages_sent: 4,
                bytes_sent: 90,
                messages_received: 0,
                bytes_received: 0,
            }
        );
    }
}
