//! Tracks which peers are currently busy serving a chunk to some
//! [`crate::chunk_download::ChunkDownload`], so that a second download
//! doesn't pick the same peer while it's already streaming to another.
//!
//! Grounded in the original `getTheFastestFreePeer()` design: peer
//! selection is "fastest peer that is not already occupied", and once a
//! peer is occupied, other chunk downloads that wanted it need to be woken
//! up again as soon as it frees up rather than polling. [`tokio::sync::Notify`]
//! gives every waiter a cheap way to re-check "is anyone free now?" without
//! a busy loop.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::Hash;

/// Coordinates exclusive use of peers across concurrently running
/// [`crate::chunk_download::ChunkDownload`] state machines.
pub struct OccupiedPeers {
    occupied: Mutex<HashSet<Hash>>,
    notify: Notify,
}

impl OccupiedPeers {
    pub fn new() -> Self {
        Self {
            occupied: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Given `candidates` in preference order (fastest first, already
    /// tie-broken by hash), occupies and returns the first one not already
    /// in use by another download.
    pub fn occupy_first_free(&self, candidates: &[Hash]) -> Option<Hash> {
        let mut occupied = self.occupied.lock().expect("occupied peers lock poisoned");
        for candidate in candidates {
            if occupied.insert(*candidate) {
                return Some(*candidate);
            }
        }
        None
    }

    /// Releases `peer_id`, making it available for the next call to
    /// [`Self::occupy_first_free`], and wakes everyone waiting on
    /// [`Self::wait_for_change`].
    pub fn release(&self, peer_id: &Hash) {
        let mut occupied = self.occupied.lock().expect("occupied peers lock poisoned");
        occupied.remove(peer_id);
        drop(occupied);
        self.notify.notify_waiters();
    }

    /// Whether `peer_id` is currently occupied by some other download.
    pub fn is_occupied(&self, peer_id: &Hash) -> bool {
        self.occupied
            .lock()
            .expect("occupied peers lock poisoned")
            .contains(peer_id)
    }

    /// Waits until some peer is released. A `ChunkDownload` that found no
    /// free peer calls this instead of polling, then re-runs peer
    /// selection once woken.
    pub async fn wait_for_change(&self) {
        self.notify.notified().await;
    }
}

impl Default for OccupiedPeers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_occupy_first_free_skips_occupied() {
        let occupied = OccupiedPeers::new();
        let a = Hash::new([1; 20]);
        let b = Hash::new([2; 20]);

        assert_eq!(occupied.occupy_first_free(&[a, b]), Some(a));
        assert!(occupied.is_occupied(&a));
        assert_eq!(occupied.occupy_first_free(&[a, b]), Some(b));
        assert_eq!(occupied.occupy_first_free(&[a, b]), None);
    }

    #[test]
    fn test_release_frees_peer() {
        let occupied = OccupiedPeers::new();
        let a = Hash::new([1; 20]);
        occupied.occupy_first_free(&[a]);
        occupied.release(&a);
        assert!(!occupied.is_occupied(&a));
        assert_eq!(occupied.occupy_first_free(&[a]), Some(a));
    }

    #[tokio::test]
    async fn test_wait_for_change_wakes_on_release() {
        let occupied = std::sync::Arc::new(OccupiedPeers::new());
        let a = Hash::new([1; 20]);
        occupied.occupy_first_free(&[a]);

        let waiter = {
            let occupied = occupied.clone();
            tokio::spawn(async move {
                occupied.wait_for_change().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        occupied.release(&a);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap();
    }
}
