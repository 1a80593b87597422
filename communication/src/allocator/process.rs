//! Inter-thread, intra-process mesh over bounded channels.

use std::sync::mpsc::sync_channel;

use super::{Endpoint, PeerSender};
use crate::QUEUE_CAPACITY;

/// Allocates a connected set of endpoints for `peers` worker threads in
/// this process.
pub fn endpoints<T>(peers: usize) -> Vec<Endpoint<T>> {
    let mut senders = Vec::with_capacity(peers);
    let mut receivers = Vec::with_capacity(peers);
    for _ in 0..peers {
        let (tx, rx) = sync_channel(QUEUE_CAPACITY);
        senders.push(PeerSender::Local(tx));
        receivers.push(rx);
    }

    receivers
        .into_iter()
        .enumerate()
        .map(|(index, rx)| Endpoint::new(index, peers, senders.clone(), rx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;
    use std::time::Duration;

    #[test]
    fn mesh_delivers_across_threads() {
        let mut endpoints = endpoints::<String>(3);
        let receiver = endpoints.remove(0);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                std::thread::spawn(move || {
                    ep.send(0, format!("hello from {}", ep.index())).unwrap();
                })
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Some(Event::Message { source, payload }) =
                receiver.recv_timeout(Duration::from_secs(1))
            {
                seen.push((source, payload));
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![(1, "hello from 1".to_string()), (2, "hello from 2".to_string())]
        );
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
