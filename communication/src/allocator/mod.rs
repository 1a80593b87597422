//! Worker-facing endpoints over the transport mesh.

pub mod process;
pub mod thread;

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

/// An inbound transport event delivered to a worker.
#[derive(Debug)]
pub enum Event<T> {
    /// A message from the identified peer worker.
    Message {
        /// Global index of the sending worker.
        source: usize,
        /// The payload.
        payload: T,
    },
    /// A remote process's connection dropped.
    ///
    /// Delivered to every local worker; whether this is fatal depends on
    /// whether the protocol had already completed.
    Disconnected {
        /// Identity of the disconnected process.
        process: usize,
    },
}

/// Where a message addressed to one peer should be pushed.
pub(crate) enum PeerSender<T> {
    /// A worker thread in this process, including ourselves.
    Local(SyncSender<Event<T>>),
    /// A worker in another process, reached through that process's
    /// uplink thread. Source and target worker indices ride along.
    Remote {
        target: usize,
        uplink: SyncSender<(usize, usize, T)>,
    },
}

impl<T> Clone for PeerSender<T> {
    fn clone(&self) -> Self {
        match self {
            PeerSender::Local(sender) => PeerSender::Local(sender.clone()),
            PeerSender::Remote { target, uplink } => PeerSender::Remote {
                target: *target,
                uplink: uplink.clone(),
            },
        }
    }
}

/// A worker's handle on the transport mesh.
///
/// Owns the worker's inbound queue and one sender per peer. Sending to a
/// peer whose queue is full blocks; receiving can time out, which doubles
/// as the scheduler's park.
pub struct Endpoint<T> {
    index: usize,
    peers: usize,
    senders: Vec<PeerSender<T>>,
    receiver: Receiver<Event<T>>,
}

impl<T> Endpoint<T> {
    pub(crate) fn new(
        index: usize,
        peers: usize,
        senders: Vec<PeerSender<T>>,
        receiver: Receiver<Event<T>>,
    ) -> Self {
        assert_eq!(senders.len(), peers);
        Endpoint { index, peers, senders, receiver }
    }

    /// Global index of this worker.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Total number of workers in the cluster.
    pub fn peers(&self) -> usize {
        self.peers
    }

    /// Sends a payload to the identified peer, blocking while the peer's
    /// queue is full. Errors if the peer is gone.
    pub fn send(&self, target: usize, payload: T) -> Result<(), String> {
        let source = self.index;
        match &self.senders[target] {
            PeerSender::Local(tx) => tx
                .send(Event::Message { source, payload })
                .map_err(|_| format!("worker {} hung up", target)),
            PeerSender::Remote { target, uplink } => uplink
                .send((source, *target, payload))
                .map_err(|_| format!("uplink to worker {} closed", target)),
        }
    }

    /// Sends a payload to every peer except this worker.
    pub fn broadcast(&self, payload: T) -> Result<(), String>
    where
        T: Clone,
    {
        for target in 0..self.peers {
            if target != self.index {
                self.send(target, payload.clone())?;
            }
        }
        Ok(())
    }

    /// Returns the next inbound event if one is already queued.
    pub fn try_recv(&self) -> Option<Event<T>> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for an inbound event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Push used by networking receive threads: spins while the worker's queue
/// is full, reports `false` once the worker is gone.
pub(crate) fn forward<T>(tx: &SyncSender<Event<T>>, mut event: Event<T>) -> bool {
    loop {
        match tx.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Full(ev)) => {
                event = ev;
                std::thread::yield_now();
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}
