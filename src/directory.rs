//! Registry of visible peers with a change stream
//!
//! Readers take snapshots from any thread. Writes come from the manager's event loop
//! (and from an external bridge for vendor-SDK peers).

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::peer::{Peer, PeerStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Found(Peer),
    Updated(Peer),
    Lost(Peer),
}

pub struct PeerDirectory {
    peers: RwLock<HashMap<String, Peer>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { peers: RwLock::new(HashMap::new()), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Insert or replace by id. A re-resolved peer keeps its transfer status.
    pub fn upsert(&self, mut peer: Peer) {
        let event = {
            let mut peers = self.peers.write();
            match peers.get(peer.id()).map(Peer::status) {
                Some(status) => {
                    peer.set_status(status);
                    peers.insert(peer.id().to_string(), peer.clone());
                    PeerEvent::Updated(peer)
                }
                None => {
                    peers.insert(peer.id().to_string(), peer.clone());
                    PeerEvent::Found(peer)
                }
            }
        };
        self.publish(event);
    }

    pub fn remove(&self, id: &str) -> Option<Peer> {
        let removed = self.peers.write().remove(id);
        if let Some(peer) = &removed {
            self.publish(PeerEvent::Lost(peer.clone()));
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    /// First peer whose id or display name matches.
    pub fn find(&self, key: &str) -> Option<Peer> {
        let peers = self.peers.read();
        peers
            .get(key)
            .or_else(|| peers.values().find(|p| p.name() == key))
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        let mut all: Vec<Peer> = self.peers.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        all
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Apply `f` to a peer's status. Returns the new status, `None` if the peer is gone.
    pub fn update_status(&self, id: &str, f: impl FnOnce(&mut PeerStatus)) -> Option<PeerStatus> {
        let updated = {
            let mut peers = self.peers.write();
            let peer = peers.get_mut(id)?;
            let mut status = peer.status();
            f(&mut status);
            if status == peer.status() {
                return Some(status);
            }
            peer.set_status(status);
            peer.clone()
        };
        let status = updated.status();
        self.publish(PeerEvent::Updated(updated));
        Some(status)
    }

    pub fn clear(&self) {
        let drained: Vec<Peer> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in drained {
            self.publish(PeerEvent::Lost(peer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DiscoverResponse;
    use crate::peer::{AirDropPeer, TransferState};

    fn peer(id: &str, name: &str) -> Peer {
        Peer::AirDrop(AirDropPeer::from_discover(
            id,
            &format!("https://10.0.0.{}:8770", id.len()),
            DiscoverResponse { computer_name: name.into(), capabilities: None },
        ))
    }

    #[test]
    fn upsert_update_remove_emit_events() {
        let dir = PeerDirectory::new();
        let mut rx = dir.subscribe();
        dir.upsert(peer("a1", "Mac"));
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Found(p)) if p.id() == "a1"));

        dir.update_status("a1", |s| s.state = TransferState::Sending);
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Updated(p)) if p.status().state == TransferState::Sending));

        // Re-resolution keeps status.
        dir.upsert(peer("a1", "Mac renamed"));
        match rx.try_recv() {
            Ok(PeerEvent::Updated(p)) => {
                assert_eq!(p.name(), "Mac renamed");
                assert_eq!(p.status().state, TransferState::Sending);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(dir.remove("a1").is_some());
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Lost(_))));
        assert!(dir.remove("a1").is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn unchanged_status_is_silent() {
        let dir = PeerDirectory::new();
        dir.upsert(peer("a1", "Mac"));
        let mut rx = dir.subscribe();
        dir.update_status("a1", |_| {});
        assert!(rx.try_recv().is_err());
        assert!(dir.update_status("missing", |_| {}).is_none());
    }

    #[test]
    fn find_by_id_or_name_and_sorted_snapshot() {
        let dir = PeerDirectory::new();
        dir.upsert(peer("zz", "Beta"));
        dir.upsert(peer("yyy", "Alpha"));
        assert_eq!(dir.find("zz").map(|p| p.name().to_string()), Some("Beta".into()));
        assert_eq!(dir.find("Alpha").map(|p| p.id().to_string()), Some("yyy".into()));
        let names: Vec<_> = dir.snapshot().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
        dir.clear();
        assert_eq!(dir.len(), 0);
    }
}
