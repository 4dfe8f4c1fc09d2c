//! TCP transport in a star topology.
//!
//! The leader listens; each worker connects once and is assigned the
//! next rank in accept order, so rank numbering is known to both ends
//! before any application traffic. Frames travel only between the
//! leader and a worker; a worker addressing another worker gets
//! [`ClusterError::Unroutable`].
//!
//! Each socket has a reader thread that decodes frames into the
//! participant's [`Mailbox`]. When the socket closes the thread exits
//! and drops its sender, which is how a receive learns the peer is
//! gone.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Sender};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::comm::{Channel, Communicator, Frame, LEADER, Mailbox, Rank, Tag};
use crate::error::{ClusterError, Result};

/// Rank assignment sent by the leader to a newly accepted worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Hello {
    rank: Rank,
    size: usize,
}

/// A bound leader socket waiting for its workers.
#[derive(Debug)]
pub struct LeaderListener {
    listener: TcpListener,
}

impl LeaderListener {
    /// Bind the leader's listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Io`] if the address cannot be bound.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener })
    }

    /// The address workers should connect to (useful after binding
    /// port 0).
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Block until `workers` peers have connected, then return the
    /// leader's communicator for a pool of `workers + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Io`] on accept or handshake failure.
    pub fn accept_workers(self, workers: usize) -> Result<TcpCommunicator> {
        let size = workers + 1;
        let (tx, rx) = mpsc::channel();
        let mut routes: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();

        for (rank, route) in routes.iter_mut().enumerate().skip(1) {
            let (mut stream, peer) = self.listener.accept()?;
            stream.set_nodelay(true)?;
            let hello = codec::encode(&Hello { rank, size })?;
            codec::write_frame(
                &mut stream,
                &Frame::new(LEADER, Tag(0), Channel::Handshake, hello),
            )?;
            spawn_reader(stream.try_clone()?, rank, tx.clone())?;
            info!(rank, %peer, "worker joined");
            *route = Some(stream);
        }

        Ok(TcpCommunicator {
            rank: LEADER,
            size,
            routes,
            mailbox: Mailbox::new(rx),
        })
    }
}

/// One participant's end of a TCP pool.
#[derive(Debug)]
pub struct TcpCommunicator {
    rank: Rank,
    size: usize,
    /// Indexed by destination rank. The leader holds every worker's
    /// socket; a worker holds only the leader's.
    routes: Vec<Option<TcpStream>>,
    mailbox: Mailbox,
}

impl TcpCommunicator {
    /// Connect to a leader and wait for a rank assignment.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Io`] if the leader is unreachable, or
    /// [`ClusterError::Handshake`] if its first frame is not a valid
    /// assignment.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        let frame = codec::read_frame(&mut stream)?
            .ok_or_else(|| ClusterError::Handshake("leader closed the connection".into()))?;
        if frame.channel != Channel::Handshake {
            return Err(ClusterError::Handshake(format!(
                "expected rank assignment, got {:?} frame",
                frame.channel
            )));
        }
        let Hello { rank, size } = codec::decode(&frame.payload)?;
        if rank == LEADER || rank >= size {
            return Err(ClusterError::Handshake(format!(
                "rank {rank} is not a worker rank in a pool of {size}"
            )));
        }
        info!(rank, size, "joined pool");

        let (tx, rx) = mpsc::channel();
        spawn_reader(stream.try_clone()?, LEADER, tx)?;
        let mut routes: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        routes[LEADER] = Some(stream);

        Ok(Self {
            rank,
            size,
            routes,
            mailbox: Mailbox::new(rx),
        })
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn deliver(&mut self, dest: Rank, frame: Frame) -> Result<()> {
        let from = self.rank;
        let stream = self
            .routes
            .get_mut(dest)
            .and_then(Option::as_mut)
            .ok_or(ClusterError::Unroutable { from, to: dest })?;
        codec::write_frame(stream, &frame)
    }

    fn mailbox(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        for stream in self.routes.iter().flatten() {
            // The peer may have closed first.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Forward decoded frames from `stream` into a mailbox until the socket
/// closes or the mailbox is dropped.
fn spawn_reader(mut stream: TcpStream, peer: Rank, tx: Sender<Frame>) -> Result<()> {
    thread::Builder::new()
        .name(format!("halo-reader-{peer}"))
        .spawn(move || {
            loop {
                match codec::read_frame(&mut stream) {
                    Ok(Some(frame)) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(peer, "connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(peer, error = %e, "dropping connection");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::comm::{Source, TagMatch};

    fn pool(workers: usize) -> (TcpCommunicator, Vec<TcpCommunicator>) {
        let listener = LeaderListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let joiners: Vec<_> = (0..workers)
            .map(|_| thread::spawn(move || TcpCommunicator::connect(addr).unwrap()))
            .collect();
        let leader = listener.accept_workers(workers).unwrap();
        let mut comms: Vec<_> = joiners.into_iter().map(|j| j.join().unwrap()).collect();
        comms.sort_by_key(|c| c.rank());
        (leader, comms)
    }

    #[test]
    fn handshake_assigns_distinct_worker_ranks() {
        let (leader, workers) = pool(3);
        assert_eq!(leader.rank(), LEADER);
        assert_eq!(leader.size(), 4);
        let ranks: Vec<_> = workers.iter().map(|w| w.rank()).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert!(workers.iter().all(|w| w.size() == 4));
    }

    #[test]
    fn leader_and_worker_exchange_frames() {
        let (mut leader, mut workers) = pool(2);

        let mut buffer = vec![9, 8, 7];
        leader.broadcast(LEADER, &mut buffer).unwrap();
        leader.send(2, Tag::IMAGE_DATA, &[42]).unwrap();

        for w in &mut workers {
            let mut got = Vec::new();
            w.broadcast(LEADER, &mut got).unwrap();
            assert_eq!(got, vec![9, 8, 7]);
        }
        let env = workers[1]
            .recv(Source::Rank(LEADER), Tag::IMAGE_DATA.into())
            .unwrap();
        assert_eq!(env.payload, vec![42]);

        workers[0].send(LEADER, Tag::RESULT, &[1, 1]).unwrap();
        let back = leader.recv(Source::Any, TagMatch::Any).unwrap();
        assert_eq!((back.source, back.tag), (1, Tag::RESULT));
    }

    #[test]
    fn workers_cannot_reach_each_other() {
        let (_leader, mut workers) = pool(2);
        assert!(matches!(
            workers[0].send(2, Tag(0), &[]),
            Err(ClusterError::Unroutable { from: 1, to: 2 })
        ));
    }

    #[test]
    fn dropped_leader_disconnects_worker() {
        let (leader, mut workers) = pool(1);
        drop(leader);
        assert!(matches!(
            workers[0].recv(Source::Rank(LEADER), TagMatch::Any),
            Err(ClusterError::Disconnected { rank: 0 })
        ));
    }
}
