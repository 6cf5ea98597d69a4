use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::node::NodeId;

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Peers announced to us, per info-hash.
///
/// Announcements expire after `lifetime`; once an info-hash holds
/// `max_per_hash` peers the oldest announcement makes room.
pub struct PeerStore {
    peers: HashMap<NodeId, VecDeque<AnnouncedPeer>>,
    lifetime: Duration,
    max_per_hash: usize,
}

impl PeerStore {
    pub fn new(lifetime: Duration, max_per_hash: usize) -> Self {
        Self {
            peers: HashMap::new(),
            lifetime,
            max_per_hash,
        }
    }

    pub fn add_peer(&mut self, info_hash: NodeId, addr: SocketAddr, now: Instant) {
        let lifetime = self.lifetime;
        let peers = self.peers.entry(info_hash).or_default();
        peers.retain(|p| p.addr != addr && now.saturating_duration_since(p.announced_at) < lifetime);

        while peers.len() >= self.max_per_hash.max(1) {
            peers.pop_front();
        }
        peers.push_back(AnnouncedPeer {
            addr,
            announced_at: now,
        });
    }

    pub fn get_peers(&mut self, info_hash: &NodeId, now: Instant) -> Vec<SocketAddr> {
        let lifetime = self.lifetime;
        match self.peers.get_mut(info_hash) {
            Some(peers) => {
                peers.retain(|p| now.saturating_duration_since(p.announced_at) < lifetime);
                peers.iter().map(|p| p.addr).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drops expired announcements and forgets empty info-hashes.
    pub fn prune(&mut self, now: Instant) {
        let lifetime = self.lifetime;
        self.peers.retain(|_, peers| {
            peers.retain(|p| now.saturating_duration_since(p.announced_at) < lifetime);
            !peers.is_empty()
        });
    }

    pub fn info_hash_count(&self) -> usize {
        self.peers.len()
    }
}
