//! Schedules [`ChunkDownload`]s across an ordered queue of downloads,
//! under a global and a per-download concurrency cap.
//!
//! The event-driven wakeup and picker loop are modeled after the teacher
//! crate's `PeerSession::run` `select!` loop over a message stream and a
//! command port: here, a single `tokio::sync::mpsc` "scheduler event"
//! channel stands in for both wakeup sources (new work, a chunk ending, a
//! peer freeing up), and the manager's `run` loop re-runs the picker
//! every time it receives one, rather than polling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chunk_download::{ChunkDownload, TransferStatus};
use crate::conf::TransferConf;
use crate::connection_pool::ConnectionPool;
use crate::occupied_peers::OccupiedPeers;
use crate::peer_registry::PeerRegistry;
use crate::{DownloadId, Hash, PeerId};

/// The lifecycle state of a [`Download`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Queued,
    Initializing,
    Downloading,
    Paused,
    Complete,
    Error,
}

/// Where a [`DownloadManager::move_downloads`] reordering is anchored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveAnchor {
    Before,
    After,
}

struct Download {
    id: DownloadId,
    chunks: Vec<Arc<ChunkDownload>>,
    status: DownloadStatus,
    #[allow(dead_code)]
    peer_source_hint: Hash,
    active_chunks: usize,
    paused: bool,
}

/// A plain, serializable snapshot of one download's queue position and
/// progress, returned by [`DownloadManager::export_snapshot`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: DownloadId,
    pub status: DownloadStatus,
    pub chunk_hashes: Vec<Hash>,
}

enum SchedulerEvent {
    Added,
    PeerFreed,
    ChunkEnded {
        download_id: DownloadId,
        #[allow(dead_code)]
        chunk_hash: Hash,
        #[allow(dead_code)]
        status: TransferStatus,
    },
}

/// Drives the download side of the transfer core: owns the ordered
/// download queue and decides, on every relevant event, which chunks to
/// start downloading next.
pub struct DownloadManager {
    local_id: PeerId,
    registry: Arc<PeerRegistry>,
    occupied: Arc<OccupiedPeers>,
    pool: Arc<ConnectionPool>,
    conf: Arc<TransferConf>,
    downloads: Mutex<VecDeque<Download>>,
    next_id: AtomicU64,
    active_global: Arc<AtomicUsize>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>,
}

impl DownloadManager {
    pub fn new(
        local_id: PeerId,
        registry: Arc<PeerRegistry>,
        occupied: Arc<OccupiedPeers>,
        pool: Arc<ConnectionPool>,
        conf: Arc<TransferConf>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local_id,
            registry,
            occupied,
            pool,
            conf,
            downloads: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            active_global: Arc::new(AtomicUsize::new(0)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Queues a new download for `chunk_hashes`, each initially sourced
    /// from `peer_source_hint`. Returns the new download's id.
    pub fn add_download(&self, chunk_hashes: Vec<Hash>, peer_source_hint: Hash) -> DownloadId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let chunks = chunk_hashes
            .into_iter()
            .map(|hash| {
                let chunk = ChunkDownload::new(hash);
                chunk.add_peer(peer_source_hint);
                Arc::new(chunk)
            })
            .collect();

        let download = Download {
            id,
            chunks,
            status: DownloadStatus::Queued,
            peer_source_hint,
            active_chunks: 0,
            paused: false,
        };
        self.downloads
            .lock()
            .expect("download queue lock poisoned")
            .push_back(download);
        self.notify(SchedulerEvent::Added);
        id
    }

    /// Removes the given downloads from the queue entirely.
    pub fn cancel(&self, ids: &[DownloadId]) {
        let mut downloads = self.downloads.lock().expect("download queue lock poisoned");
        downloads.retain(|d| !ids.contains(&d.id));
    }

    /// Pauses a download: its chunks stop being picked, but aren't
    /// removed.
    pub fn pause(&self, id: DownloadId) {
        let mut downloads = self.downloads.lock().expect("download queue lock poisoned");
        if let Some(d) = downloads.iter_mut().find(|d| d.id == id) {
            d.paused = true;
            d.status = DownloadStatus::Paused;
        }
    }

    /// Resumes a paused download.
    pub fn resume(&self, id: DownloadId) {
        {
            let mut downloads = self.downloads.lock().expect("download queue lock poisoned");
            if let Some(d) = downloads.iter_mut().find(|d| d.id == id) {
                d.paused = false;
                d.status = DownloadStatus::Downloading;
            }
        }
        self.notify(SchedulerEvent::Added);
    }

    /// Reorders `ids` to just before or after `ref_id` in the queue,
    /// preserving their relative order. A no-op if `ref_id` itself is
    /// among `ids`, or isn't present in the queue.
    pub fn move_downloads(&self, ref_id: DownloadId, ids: &[DownloadId], anchor: MoveAnchor) {
        if ids.contains(&ref_id) {
            return;
        }
        let mut downloads = self.downloads.lock().expect("download queue lock poisoned");

        let mut moved = VecDeque::new();
        let mut remaining = VecDeque::with_capacity(downloads.len());
        for download in downloads.drain(..) {
            if ids.contains(&download.id) {
                moved.push_back(download);
            } else {
                remaining.push_back(download);
            }
        }

        let Some(ref_pos) = remaining.iter().position(|d| d.id == ref_id) else {
            // ref_id isn't in the queue (already cancelled, say); put
            // everything back unchanged.
            remaining.extend(moved);
            *downloads = remaining;
            return;
        };

        let insert_at = match anchor {
            MoveAnchor::Before => ref_pos,
            MoveAnchor::After => ref_pos + 1,
        };
        for (offset, download) in moved.into_iter().enumerate() {
            remaining.insert(insert_at + offset, download);
        }
        *downloads = remaining;
    }

    fn notify(&self, event: SchedulerEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Runs the scheduler loop until the event channel is closed (i.e.
    /// every clone of the manager has been dropped). Intended to be
    /// spawned as its own `tokio::task`.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self
            .events_rx
            .lock()
            .expect("download queue lock poisoned")
            .take()
            .expect("DownloadManager::run called more than once");

        self.pick();
        while let Some(event) = rx.recv().await {
            match &event {
                SchedulerEvent::Added => debug!("scheduler: new work queued"),
                SchedulerEvent::PeerFreed => debug!("scheduler: a peer freed up"),
                SchedulerEvent::ChunkEnded { download_id, .. } => {
                    debug!("scheduler: chunk ended for download {}", download_id);
                    // recompute active_chunks/status before the next pick,
                    // otherwise a finished chunk's slot never frees up.
                    self.refresh_statuses();
                }
            }
            self.pick();
        }
    }

    /// Scans downloads in priority order and starts any chunk that's
    /// ready, until either concurrency cap is reached.
    fn pick(&self) {
        let candidates: Vec<(DownloadId, Arc<ChunkDownload>)> = {
            let mut downloads = self.downloads.lock().expect("download queue lock poisoned");
            let mut out = Vec::new();
            for download in downloads.iter_mut() {
                if download.paused {
                    continue;
                }
                if self.active_global.load(Ordering::SeqCst) + out.len()
                    >= self.conf.max_concurrent_downloads
                {
                    break;
                }
                let mut remaining_slots = self
                    .conf
                    .max_active_chunks_per_download
                    .saturating_sub(download.active_chunks);
                for chunk in &download.chunks {
                    if remaining_slots == 0 {
                        break;
                    }
                    if chunk.is_complete() || chunk.is_downloading() {
                        continue;
                    }
                    if chunk.is_ready_to_download(&self.registry, &self.occupied, self.conf.peer_absence_timeout) > 0 {
                        out.push((download.id, chunk.clone()));
                        download.active_chunks += 1;
                        remaining_slots -= 1;
                    }
                }
                if !download.chunks.iter().all(|c| c.is_complete()) {
                    download.status = DownloadStatus::Downloading;
                }
            }
            out
        };

        for (download_id, chunk) in candidates {
            self.active_global.fetch_add(1, Ordering::SeqCst);
            let registry = self.registry.clone();
            let occupied = self.occupied.clone();
            let pool = self.pool.clone();
            let conf = self.conf.clone();
            let local_id = self.local_id;
            let active_global = self.active_global.clone();
            let tx = self.events_tx.clone();
            let chunk_hash = chunk.hash();

            tokio::spawn(async move {
                let status = chunk
                    .run_once(&registry, &occupied, &pool, &conf, local_id)
                    .await
                    .unwrap_or(TransferStatus::Error);
                active_global.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(SchedulerEvent::ChunkEnded {
                    download_id,
                    chunk_hash,
                    status,
                });
            });
        }
    }

    /// Marks completed downloads (all chunks complete) as `Complete`.
    /// Called after the caller observes a `ChunkEnded` event, or on a
    /// timer -- this manager doesn't poll disk state on its own.
    pub fn refresh_statuses(&self) {
        let mut downloads = self.downloads.lock().expect("download queue lock poisoned");
        for download in downloads.iter_mut() {
            download.active_chunks = download
                .chunks
                .iter()
                .filter(|c| c.is_downloading())
                .count();
            if download.chunks.iter().all(|c| c.is_complete()) {
                download.status = DownloadStatus::Complete;
            }
        }
    }

    pub fn snapshot(&self, id: DownloadId) -> Option<DownloadSnapshot> {
        let downloads = self.downloads.lock().expect("download queue lock poisoned");
        downloads.iter().find(|d| d.id == id).map(|d| DownloadSnapshot {
            id: d.id,
            status: d.status,
            chunk_hashes: d.chunks.iter().map(|c| c.hash()).collect(),
        })
    }

    pub fn export_snapshot(&self) -> Vec<DownloadSnapshot> {
        let downloads = self.downloads.lock().expect("download queue lock poisoned");
        downloads
            .iter()
            .map(|d| DownloadSnapshot {
                id: d.id,
                status: d.status,
                chunk_hashes: d.chunks.iter().map(|c| c.hash()).collect(),
            })
            .collect()
    }

    /// Recreates queue entries from a previously exported snapshot. Each
    /// chunk starts with an empty peer set; the caller is expected to
    /// re-populate sources (e.g. from a fresh `GET_HASHES` exchange)
    /// before the scheduler can make progress on them.
    pub fn import_snapshot(&self, snapshots: Vec<DownloadSnapshot>) {
        let mut downloads = self.downloads.lock().expect("download queue lock poisoned");
        for snap in snapshots {
            let chunks = snap
                .chunk_hashes
                .into_iter()
                .map(|hash| Arc::new(ChunkDownload::new(hash)))
                .collect();
            downloads.push_back(Download {
                id: snap.id,
                chunks,
                status: snap.status,
                peer_source_hint: Hash::new([0; crate::hash::HASH_LEN]),
                active_chunks: 0,
                paused: snap.status == DownloadStatus::Paused,
            });
            self.next_id.fetch_max(snap.id + 1, Ordering::SeqCst);
        }
        info!("imported {} downloads from snapshot", downloads.len());
    }
}
