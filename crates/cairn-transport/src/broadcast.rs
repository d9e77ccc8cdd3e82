//! Cluster-wide fan-out.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::frame::{BroadcastMessage, Frame};

struct Peer {
    name: String,
    tx: mpsc::UnboundedSender<Frame>,
}

/// Delivers every broadcast to every attached container.
///
/// Delivery is asynchronous and in emission order per peer. A peer whose
/// channel is closed is detached on the next broadcast.
#[derive(Default)]
pub struct Broadcaster {
    peers: Mutex<Vec<Peer>>,
}

impl Broadcaster {
    /// Creates a broadcaster with no peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a peer. A peer already attached under `name` is replaced.
    pub fn attach(&self, name: impl Into<String>, tx: mpsc::UnboundedSender<Frame>) {
        let name = name.into();
        let mut peers = self.peers.lock();
        peers.retain(|p| p.name != name);
        debug!(peer = %name, "Peer attached");
        peers.push(Peer { name, tx });
    }

    /// Detaches a peer. Returns `false` if it was not attached.
    pub fn detach(&self, name: &str) -> bool {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|p| p.name != name);
        before != peers.len()
    }

    /// Names of the attached peers, in attach order.
    pub fn peers(&self) -> Vec<String> {
        self.peers.lock().iter().map(|p| p.name.clone()).collect()
    }

    /// Sends `message` to every attached peer and returns how many accepted
    /// it.
    pub fn broadcast(&self, message: &BroadcastMessage) -> usize {
        let mut peers = self.peers.lock();
        peers.retain(|p| {
            let alive = p.tx.send(Frame::Broadcast(message.clone())).is_ok();
            if !alive {
                debug!(peer = %p.name, "Detaching closed peer");
            }
            alive
        });
        trace!(kind = message.kind(), peers = peers.len(), "Broadcast sent");
        peers.len()
    }

    /// Sends a control frame to one peer.
    pub fn send_to(&self, name: &str, frame: Frame) -> bool {
        self.peers
            .lock()
            .iter()
            .find(|p| p.name == name)
            .is_some_and(|p| p.tx.send(frame).is_ok())
    }

    /// Sends a control frame to every peer.
    pub fn send_all(&self, frame: Frame) {
        for peer in self.peers.lock().iter() {
            let _ = peer.tx.send(frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_peer_receives_in_order() {
        let broadcaster = Broadcaster::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        broadcaster.attach("a", a_tx);
        broadcaster.attach("b", b_tx);

        let first = BroadcastMessage::ContainerStarting {
            container: "a".into(),
        };
        assert_eq!(broadcaster.broadcast(&first), 2);
        broadcaster.broadcast(&BroadcastMessage::ContainersDone);

        for rx in [&mut a_rx, &mut b_rx] {
            assert!(matches!(
                rx.recv().await,
                Some(Frame::Broadcast(BroadcastMessage::ContainerStarting { .. }))
            ));
            assert!(matches!(
                rx.recv().await,
                Some(Frame::Broadcast(BroadcastMessage::ContainersDone))
            ));
        }
    }

    #[test]
    fn test_closed_peer_detached() {
        let broadcaster = Broadcaster::new();
        let (tx, rx) = mpsc::unbounded_channel();
        broadcaster.attach("gone", tx);
        drop(rx);

        assert_eq!(broadcaster.broadcast(&BroadcastMessage::ContainersDone), 0);
        assert!(broadcaster.peers().is_empty());
    }

    #[test]
    fn test_send_to_single_peer() {
        let broadcaster = Broadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.attach("api", tx);

        assert!(broadcaster.send_to("api", Frame::Start));
        assert!(!broadcaster.send_to("missing", Frame::Start));
        assert!(matches!(rx.try_recv(), Ok(Frame::Start)));
        assert!(broadcaster.detach("api"));
    }
}
