//! The peer discovery contract.
//!
//! This crate does not itself broadcast or listen for LAN presence; that's
//! the job of an external discovery module (UDP beacons, mDNS, whatever the
//! surrounding application uses). All discovery hands this crate is a
//! stream of [`PeerEvent`]s, and [`drain_into`] is the one place that
//! stream meets [`crate::peer_registry::PeerRegistry`].

use tokio::sync::mpsc;

use crate::peer_registry::PeerRegistry;
use crate::Hash;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// A single fact discovery has learned about a peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A previously unseen peer announced itself at `addr` under `nick`.
    Joined(Hash, SocketAddr, String),
    /// An already-known peer's advertised speed or last-seen time changed.
    Updated(Hash, u64, Instant),
    /// A peer explicitly announced it is leaving (clean shutdown, not just
    /// a beacon timeout).
    Left(Hash),
}

/// Drains `events` into `registry` until the channel closes, translating
/// each [`PeerEvent`] into the matching `PeerRegistry` call. This is the
/// only consumer of the discovery channel; run it as its own task
/// alongside the engine.
pub async fn drain_into(mut events: mpsc::Receiver<PeerEvent>, registry: Arc<PeerRegistry>) {
    while let Some(event) = events.recv().await {
        apply(&registry, event);
    }
}

fn apply(registry: &PeerRegistry, event: PeerEvent) {
    match event {
        PeerEvent::Joined(id, addr, nick) => {
            registry.on_beacon(id, addr);
            registry.set_nick(id, nick);
        }
        PeerEvent::Updated(id, speed, _last_seen) => {
            // on_beacon refreshes last_seen to now rather than the
            // event's timestamp; discovery events are assumed to arrive
            // promptly enough that the difference doesn't matter for the
            // absence-timeout check.
            if let Some(addr) = registry.addr_of(&id) {
                registry.on_beacon(id, addr);
            }
            registry.update_speed(id, speed);
        }
        PeerEvent::Left(id) => {
            registry.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    #[tokio::test]
    async fn test_joined_makes_peer_available() {
        let registry = Arc::new(PeerRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(drain_into(rx, registry.clone()));

        let peer = Hash::new([1; 20]);
        tx.send(PeerEvent::Joined(peer, addr(), "alice".to_string()))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(registry.is_available(&peer, Duration::from_secs(60)));
        assert_eq!(registry.nick_of(&peer), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_left_removes_peer() {
        let registry = Arc::new(PeerRegistry::new());
        let peer = Hash::new([2; 20]);
        registry.on_beacon(peer, addr());

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(drain_into(rx, registry.clone()));
        tx.send(PeerEvent::Left(peer)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(!registry.is_available(&peer, Duration::from_secs(60)));
        assert_eq!(registry.addr_of(&peer), None);
    }

    #[tokio::test]
    async fn test_updated_refreshes_speed() {
        let registry = Arc::new(PeerRegistry::new());
        let peer = Hash::new([3; 20]);
        registry.on_beacon(peer, addr());

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(drain_into(rx, registry.clone()));
        tx.send(PeerEvent::Updated(peer, 5_000_000, Instant::now()))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(registry.speed_of(&peer), 5_000_000);
    }
}
