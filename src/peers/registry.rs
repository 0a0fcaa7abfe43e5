//! Peer registry
//!
//! Ordered list of every known peer. Ids are unique; replacing a peer keeps
//! its position. One mutex guards the list, and every mutation is followed by
//! a notification published outside the lock.

use parking_lot::Mutex;

use crate::error::RegistryError;
use crate::events::{Notification, Notifier};
use crate::protocol::{MemberAddress, Peer, PeerId, Track, ZoneId};

/// Owner of every peer descriptor known to this node
pub struct PeerRegistry {
    peers: Mutex<Vec<Peer>>,
    notifier: Notifier,
}

impl PeerRegistry {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            notifier,
        }
    }

    /// Replace the peer with the same id in place, or append it
    pub fn add_or_replace(&self, peer: Peer) {
        tracing::trace!("Adding {} ({}) to peer list", peer.name, peer.id);
        {
            let mut peers = self.peers.lock();
            match peers.iter().position(|p| p.id == peer.id) {
                Some(index) => peers[index] = peer,
                None => peers.push(peer),
            }
        }
        self.notify_peers_and_library();
    }

    /// Remove every listed peer that is present. Returns how many were removed.
    pub fn remove_all(&self, ids: &[PeerId]) -> usize {
        let removed = {
            let mut peers = self.peers.lock();
            let before = peers.len();
            peers.retain(|p| !ids.contains(&p.id));
            before - peers.len()
        };
        self.notify_peers_and_library();
        removed
    }

    pub fn edit_name(&self, id: &str, name: &str) -> Result<(), RegistryError> {
        self.edit(id, |peer| peer.name = name.to_string())
    }

    /// Change visibility and adopt the given zone. A peer going private is
    /// moved to a fresh isolated zone rather than removed.
    pub fn edit_status(&self, id: &str, online: bool, zone: ZoneId) -> Result<(), RegistryError> {
        self.edit(id, |peer| {
            peer.online = online;
            peer.zone = zone;
        })
    }

    /// Adopt new zones for the listed peers that exist; unknown ids are
    /// skipped. Returns how many peers moved.
    pub fn update_zones(&self, moves: &[(PeerId, ZoneId)]) -> usize {
        let moved = {
            let mut peers = self.peers.lock();
            let mut moved = 0;
            for (id, zone) in moves {
                if let Some(peer) = peers.iter_mut().find(|p| &p.id == id) {
                    peer.zone = *zone;
                    moved += 1;
                }
            }
            moved
        };
        self.notifier.publish(Notification::PeersChanged);
        moved
    }

    /// Replace one peer's catalog only
    pub fn update_catalog(&self, id: &str, catalog: Vec<Track>) -> Result<(), RegistryError> {
        {
            let mut peers = self.peers.lock();
            let peer = peers
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| RegistryError::UnknownPeer(id.to_string()))?;
            peer.catalog = catalog;
        }
        self.notifier.publish(Notification::LibraryChanged);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<Peer> {
        self.peers.lock().iter().find(|p| p.id == id).cloned()
    }

    pub fn find_by_address(&self, address: &MemberAddress) -> Option<Peer> {
        self.peers
            .lock()
            .iter()
            .find(|p| p.address.as_ref() == Some(address))
            .cloned()
    }

    /// Snapshot in insertion order
    pub fn all(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    pub fn peers_in_zone(&self, zone: ZoneId) -> Vec<Peer> {
        self.peers
            .lock()
            .iter()
            .filter(|p| p.zone == zone)
            .cloned()
            .collect()
    }

    /// Transport addresses of every member-backed peer
    pub fn addresses(&self) -> Vec<MemberAddress> {
        self.peers
            .lock()
            .iter()
            .filter_map(|p| p.address.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
        self.notify_peers_and_library();
    }

    fn edit(&self, id: &str, f: impl FnOnce(&mut Peer)) -> Result<(), RegistryError> {
        {
            let mut peers = self.peers.lock();
            let peer = peers
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| RegistryError::UnknownPeer(id.to_string()))?;
            f(peer);
        }
        self.notifier.publish(Notification::PeersChanged);
        Ok(())
    }

    fn notify_peers_and_library(&self) {
        self.notifier.publish(Notification::PeersChanged);
        self.notifier.publish(Notification::LibraryChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Notifier::new())
    }

    #[test]
    fn test_add_peer_replaces_by_id() {
        let registry = registry();
        registry.add_or_replace(Peer::new("T1", "Test1"));
        registry.add_or_replace(Peer::new("T2", "Test2"));
        assert_eq!(registry.len(), 2);

        registry.add_or_replace(Peer::new("T1", "Test3"));
        let peers = registry.all();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].id, "T1");
        assert_eq!(peers[0].name, "Test3");
        assert_eq!(peers[1].id, "T2");
    }

    #[test]
    fn test_upsert_single_peer() {
        let registry = registry();
        registry.add_or_replace(Peer::new("T1", "Test1"));
        registry.add_or_replace(Peer::new("T1", "Test3"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("T1").unwrap().name, "Test3");
    }

    #[test]
    fn test_remove_peers() {
        let registry = registry();
        for id in ["T1", "T2", "T3"] {
            registry.add_or_replace(Peer::new(id, id));
        }

        let removed = registry.remove_all(&["T1".to_string(), "T2".to_string()]);
        assert_eq!(removed, 2);
        let peers = registry.all();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "T3");
    }

    #[test]
    fn test_edit_status_adopts_zone() {
        let registry = registry();
        registry.add_or_replace(Peer::new("T1", "Test1"));
        let isolated = ZoneId::new();

        registry.edit_status("T1", false, isolated).unwrap();
        let peer = registry.lookup("T1").unwrap();
        assert!(!peer.online);
        assert_eq!(peer.zone, isolated);

        assert_eq!(
            registry.edit_name("missing", "x"),
            Err(RegistryError::UnknownPeer("missing".into()))
        );
    }

    #[test]
    fn test_update_catalog_and_zones() {
        let registry = registry();
        registry.add_or_replace(Peer::new("T1", "Test1"));
        registry
            .update_catalog("T1", vec![Track::new(1, "A", "B", 10)])
            .unwrap();
        assert_eq!(registry.lookup("T1").unwrap().catalog.len(), 1);

        let zone = ZoneId::new();
        let moved = registry.update_zones(&[("T1".into(), zone), ("ghost".into(), zone)]);
        assert_eq!(moved, 1);
        assert_eq!(registry.peers_in_zone(zone).len(), 1);
    }
}
