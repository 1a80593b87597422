//! The degenerate single-worker mesh: a loopback queue.

use std::sync::mpsc::sync_channel;

use super::{Endpoint, PeerSender};
use crate::QUEUE_CAPACITY;

/// Builds the endpoint for a lone worker.
///
/// The worker can still address itself (peer 0), which keeps the engine's
/// routing code uniform.
pub fn endpoint<T>() -> Endpoint<T> {
    let (tx, rx) = sync_channel(QUEUE_CAPACITY);
    Endpoint::new(0, 1, vec![PeerSender::Local(tx)], rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    #[test]
    fn loopback_round_trip() {
        let endpoint = endpoint::<u64>();
        endpoint.send(0, 7).unwrap();
        match endpoint.try_recv() {
            Some(Event::Message { source: 0, payload: 7 }) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert!(endpoint.try_recv().is_none());
    }
}
