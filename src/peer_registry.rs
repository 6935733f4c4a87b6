//! Tracks which peers this node currently knows about: their last-seen
//! address, and whether they're temporarily banned.
//!
//! Entries are populated from the discovery layer's presence beacons (see
//! [`crate::discovery`]) and pruned on a timeout, rather than on an explicit
//! "goodbye" message -- LAN discovery here is beacon-based, not
//! connection-based, matching the design's peer-absence-timeout model.
//!
//! Reads take a snapshot (clone) of the table rather than holding the lock
//! across an `.await`, the same pattern the teacher crate uses for its
//! shared piece-availability state: hold the lock only long enough to copy
//! what's needed, then release it before doing anything that can yield.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::Hash;

/// What the registry knows about a single peer.
#[derive(Clone, Copy, Debug)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub banned_until: Option<Instant>,
    /// The most recently known transfer speed for this peer, in bytes/s --
    /// either advertised by discovery or observed by a `ChunkDownload`
    /// streaming from it, whichever was set most recently. `ChunkDownload`
    /// peer selection only cares about "best known speed right now", so a
    /// single field serves both roles.
    pub speed: u64,
    /// The display name discovery announced for this peer, if any.
    pub nick: String,
}

impl PeerInfo {
    fn is_banned(&self, now: Instant) -> bool {
        matches!(self.banned_until, Some(until) if until > now)
    }
}

/// The shared table of known peers.
pub struct PeerRegistry {
    peers: RwLock<HashMap<Hash, PeerInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Records (or refreshes) a presence beacon from `peer_id` at `addr`.
    /// Does not clear an existing ban -- a peer announcing itself again
    /// doesn't erase the consequences of having sent corrupted data.
    pub fn on_beacon(&self, peer_id: Hash, addr: SocketAddr) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        let entry = peers.entry(peer_id).or_insert(PeerInfo {
            addr,
            last_seen: Instant::now(),
            banned_until: None,
            speed: 0,
            nick: String::new(),
        });
        entry.addr = addr;
        entry.last_seen = Instant::now();
    }

    /// Sets the display name discovery announced for `peer_id`.
    pub fn set_nick(&self, peer_id: Hash, nick: String) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        if let Some(entry) = peers.get_mut(&peer_id) {
            entry.nick = nick;
        }
    }

    /// The peer's last known display name, or `None` if it never announced
    /// one or isn't known at all.
    pub fn nick_of(&self, peer_id: &Hash) -> Option<String> {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        peers.get(peer_id).and_then(|info| {
            if info.nick.is_empty() {
                None
            } else {
                Some(info.nick.clone())
            }
        })
    }

    /// Drops `peer_id` immediately, e.g. on an explicit `Left` event from
    /// discovery, instead of waiting for its absence timeout to elapse.
    pub fn remove(&self, peer_id: &Hash) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        peers.remove(peer_id);
    }

    /// Records a peer's latest known transfer speed, in bytes/s.
    pub fn update_speed(&self, peer_id: Hash, speed: u64) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        if let Some(entry) = peers.get_mut(&peer_id) {
            entry.speed = speed;
        }
    }

    /// The peer's last known transfer speed, in bytes/s, or 0 if unknown.
    pub fn speed_of(&self, peer_id: &Hash) -> u64 {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        peers.get(peer_id).map_or(0, |info| info.speed)
    }

    /// Bans `peer_id` for `duration`, e.g. after it sent a chunk whose
    /// content didn't match its hash.
    pub fn ban(&self, peer_id: Hash, duration: Duration) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        if let Some(entry) = peers.get_mut(&peer_id) {
            entry.banned_until = Some(Instant::now() + duration);
        }
    }

    /// Whether `peer_id` is known, not banned, and has beaconed within
    /// `absence_timeout`.
    pub fn is_available(&self, peer_id: &Hash, absence_timeout: Duration) -> bool {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        let now = Instant::now();
        peers
            .get(peer_id)
            .map(|info| !info.is_banned(now) && now.duration_since(info.last_seen) <= absence_timeout)
            .unwrap_or(false)
    }

    /// The last known address for `peer_id`, regardless of ban/absence
    /// status.
    pub fn addr_of(&self, peer_id: &Hash) -> Option<SocketAddr> {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        peers.get(peer_id).map(|info| info.addr)
    }

    /// A snapshot of every peer currently available (not banned, not
    /// absent), suitable for iterating without holding the lock across an
    /// `.await`.
    pub fn available_snapshot(&self, absence_timeout: Duration) -> Vec<Hash> {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        let now = Instant::now();
        peers
            .iter()
            .filter(|(_, info)| {
                !info.is_banned(now) && now.duration_since(info.last_seen) <= absence_timeout
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops peers that have neither beaconed recently nor remain banned,
    /// keeping the table bounded. Meant for the engine's periodic
    /// maintenance sweep.
    pub fn prune_expired(&self, absence_timeout: Duration) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        let now = Instant::now();
        peers.retain(|_, info| {
            info.is_banned(now) || now.duration_since(info.last_seen) <= absence_timeout
        });
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9001".parse().unwrap()
    }

    #[test]
    fn test_beacon_makes_peer_available() {
        let registry = PeerRegistry::new();
        let peer = Hash::new([1; 20]);
        assert!(!registry.is_available(&peer, Duration::from_secs(60)));
        registry.on_beacon(peer, addr());
        assert!(registry.is_available(&peer, Duration::from_secs(60)));
        assert_eq!(registry.addr_of(&peer), Some(addr()));
    }

    #[test]
    fn test_ban_makes_peer_unavailable() {
        let registry = PeerRegistry::new();
        let peer = Hash::new([2; 20]);
        registry.on_beacon(peer, addr());
        registry.ban(peer, Duration::from_secs(60));
        assert!(!registry.is_available(&peer, Duration::from_secs(60)));
    }

    #[test]
    fn test_absence_timeout_expires_availability() {
        let registry = PeerRegistry::new();
        let peer = Hash::new([3; 20]);
        registry.on_beacon(peer, addr());
        assert!(!registry.is_available(&peer, Duration::from_secs(0)));
    }

    #[test]
    fn test_available_snapshot_excludes_banned() {
        let registry = PeerRegistry::new();
        let a = Hash::new([4; 20]);
        let b = Hash::new([5; 20]);
        registry.on_beacon(a, addr());
        registry.on_beacon(b, addr());
        registry.ban(b, Duration::from_secs(60));

        let snapshot = registry.available_snapshot(Duration::from_secs(60));
        assert_eq!(snapshot, vec![a]);
    }

    #[test]
    fn test_set_nick_and_remove() {
        let registry = PeerRegistry::new();
        let peer = Hash::new([7; 20]);
        registry.on_beacon(peer, addr());
        assert_eq!(registry.nick_of(&peer), None);
        registry.set_nick(peer, "alice".to_string());
        assert_eq!(registry.nick_of(&peer), Some("alice".to_string()));

        registry.remove(&peer);
        assert_eq!(registry.addr_of(&peer), None);
        assert_eq!(registry.nick_of(&peer), None);
    }

    #[test]
    fn test_prune_expired_keeps_banned_entries() {
        let registry = PeerRegistry::new();
        let peer = Hash::new([6; 20]);
        registry.on_beacon(peer, addr());
        registry.ban(peer, Duration::from_secs(60));
        registry.prune_expired(Duration::from_secs(0));
        // still present (banned), even though its last_seen is "expired"
        assert!(registry.addr_of(&peer).is_some());
    }
}
