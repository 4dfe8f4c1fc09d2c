//! In-process transport: every rank is a thread, every link a channel.

use std::sync::mpsc::{self, Sender};

use crate::comm::{Communicator, Frame, Mailbox, Rank};
use crate::error::{ClusterError, Result};

/// One rank's end of an in-process pool.
#[derive(Debug)]
pub struct LocalCommunicator {
    rank: Rank,
    /// Indexed by destination rank; `None` at this rank's own index so a
    /// pool whose peers have all exited reads as closed.
    peers: Vec<Option<Sender<Frame>>>,
    mailbox: Mailbox,
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn deliver(&mut self, dest: Rank, frame: Frame) -> Result<()> {
        let peer = self
            .peers
            .get(dest)
            .and_then(Option::as_ref)
            .ok_or(ClusterError::Unroutable {
                from: self.rank,
                to: dest,
            })?;
        peer.send(frame)
            .map_err(|_| ClusterError::Disconnected { rank: dest })
    }

    fn mailbox(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }
}

/// Builder for in-process pools.
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` fully connected communicators, ordered by rank.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownRank`] for an empty pool.
    pub fn communicators(size: usize) -> Result<Vec<LocalCommunicator>> {
        if size == 0 {
            return Err(ClusterError::UnknownRank {
                rank: crate::comm::LEADER,
                size,
            });
        }
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();
        Ok(receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| LocalCommunicator {
                rank,
                peers: senders
                    .iter()
                    .enumerate()
                    .map(|(dest, tx)| (dest != rank).then(|| tx.clone()))
                    .collect(),
                mailbox: Mailbox::new(rx),
            })
            .collect())
    }

    /// Run `body` once per rank, each on its own scoped thread, and
    /// collect the results in rank order.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Panicked`] naming the lowest rank whose
    /// thread panicked, or the error from
    /// [`communicators`](Self::communicators).
    pub fn run<F, T>(size: usize, body: F) -> Result<Vec<T>>
    where
        F: Fn(LocalCommunicator) -> T + Sync,
        T: Send,
    {
        let comms = Self::communicators(size)?;
        let body = &body;
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || body(comm)))
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| handle.join().map_err(|_| ClusterError::Panicked { rank }))
                .collect()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::comm::{LEADER, Source, Tag, TagMatch};

    #[test]
    fn point_to_point_between_threads() {
        let results = LocalCluster::run(3, |mut comm| {
            if comm.rank() == LEADER {
                let mut got = Vec::new();
                for _ in 1..comm.size() {
                    let env = comm.recv(Source::Any, TagMatch::Any).unwrap();
                    got.push((env.source, env.payload[0]));
                }
                got.sort_unstable();
                got
            } else {
                let byte = u8::try_from(comm.rank() * 10).unwrap();
                comm.send(LEADER, Tag::RESULT, &[byte]).unwrap();
                Vec::new()
            }
        })
        .unwrap();
        assert_eq!(results[0], vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let results = LocalCluster::run(4, |mut comm| {
            let mut buffer = if comm.rank() == 2 {
                b"hello".to_vec()
            } else {
                Vec::new()
            };
            comm.broadcast(2, &mut buffer).unwrap();
            buffer
        })
        .unwrap();
        assert!(results.iter().all(|b| b == b"hello"));
    }

    #[test]
    fn send_to_self_is_queued() {
        let mut comms = LocalCluster::communicators(1).unwrap();
        let comm = &mut comms[0];
        comm.send(0, Tag(4), &[1, 2]).unwrap();
        let env = comm.recv(Source::Rank(0), TagMatch::Exact(Tag(4))).unwrap();
        assert_eq!(env.payload, vec![1, 2]);
        assert_eq!(comm.traffic().messages_sent, 1);
        assert_eq!(comm.traffic().bytes_received, 2);
    }

    #[test]
    fn unknown_rank_rejected() {
        let mut comms = LocalCluster::communicators(2).unwrap();
        assert!(matches!(
            comms[0].send(5, Tag(0), &[]),
            Err(ClusterError::UnknownRank { rank: 5, size: 2 })
        ));
        assert!(LocalCluster::communicators(0).is_err());
    }

    #[test]
    fn abort_unblocks_waiting_peers() {
        let results = LocalCluster::run(3, |mut comm| {
            if comm.rank() == LEADER {
                comm.abort();
                None
            } else {
                Some(comm.recv(Source::Rank(LEADER), TagMatch::Any))
            }
        })
        .unwrap();
        for result in results.into_iter().flatten() {
            assert!(matches!(result, Err(ClusterError::Aborted { rank: 0 })));
        }
    }

    #[test]
    fn exited_peers_close_the_pool() {
        let results = LocalCluster::run(2, |mut comm| {
            if comm.rank() == LEADER {
                drop(comm);
                None
            } else {
                Some(comm.recv(Source::Any, TagMatch::Any))
            }
        })
        .unwrap();
        assert!(matches!(results[1], Some(Err(ClusterError::PoolClosed))));
    }
}
