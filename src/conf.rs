//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use crate::PeerId;

/// The default client id this node announces to peers it connects to.
pub const DEFAULT_CLIENT_ID: &PeerId = b"dlan-core-0000000000";

/// The global configuration for the transfer core and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub transfer: TransferConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults and the given client
    /// id.
    pub fn new(client_id: PeerId) -> Self {
        Self {
            engine: EngineConf { client_id },
            transfer: TransferConf::default(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new(*DEFAULT_CLIENT_ID)
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of this client, used as `local_peer_id` in every frame header.
    pub client_id: PeerId,
}

/// Configuration for the transfer core: sockets, chunk streaming, and the
/// scheduler.
///
/// The engine applies one default instance of this to all downloads/
/// uploads; individual transfers do not currently override it.
#[derive(Clone, Debug)]
pub struct TransferConf {
    /// How long a read may stay idle before a `ChunkDownload` gives up and
    /// marks the transfer `Error`.
    pub socket_timeout: Duration,

    /// How long an idle (framed, not streaming) socket may sit in a
    /// `ConnectionPool` before being closed.
    pub idle_socket_timeout: Duration,

    /// How long an `Uploader` may go without writing a byte before it gives
    /// up on a stalled peer.
    pub upload_live_time: Duration,

    /// How long to wait for a `GET_HASHES_RESULT` (and its hash stream)
    /// before giving up on a source peer for hash discovery.
    pub get_hashes_timeout: Duration,

    /// How long a peer caught sending corrupted chunk data is banned for.
    pub ban_duration_corrupted_data: Duration,

    /// After this many consecutive transaction errors on the same socket,
    /// the socket is forcibly closed instead of returned to the idle pool.
    pub max_socket_errors_before_close: u32,

    /// Size, in bytes, of the buffer a `ChunkDownload` reads into and an
    /// `Uploader` writes out of while streaming.
    pub chunk_buffer_size: usize,

    /// Multiplied by `chunk_size / lan_speed` to derive how often a
    /// `ChunkDownload` re-evaluates whether a faster peer has become free.
    pub time_recheck_chunk_factor: f64,

    /// The assumed LAN throughput, in bytes/s, used to derive the
    /// peer-recheck interval above.
    pub lan_speed: u64,

    /// A free peer must advertise at least this many times the current
    /// peer's observed speed before a `ChunkDownload` switches to it.
    pub switch_to_another_peer_factor: f64,

    /// How long a peer may go without a presence beacon before
    /// `PeerRegistry` considers it unavailable.
    pub peer_absence_timeout: Duration,

    /// The maximum number of `ChunkDownload`s active across all downloads
    /// at once.
    pub max_concurrent_downloads: usize,

    /// The maximum number of chunks a single download may have actively
    /// downloading (plus prefetching) at once.
    pub max_active_chunks_per_download: usize,

    /// The maximum number of `Uploader`s active at once.
    pub max_concurrent_uploads: usize,
}

impl TransferConf {
    /// Derives [`Self::time_recheck_chunk_factor`] x `chunk_size /
    /// lan_speed` into a concrete recheck interval for a chunk of the given
    /// size.
    pub fn recheck_interval(&self, chunk_size: u64) -> Duration {
        let secs = self.time_recheck_chunk_factor * chunk_size as f64
            / self.lan_speed.max(1) as f64;
        Duration::from_secs_f64(secs.max(0.001))
    }
}

impl Default for TransferConf {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(30),
            idle_socket_timeout: Duration::from_secs(5 * 60),
            upload_live_time: Duration::from_secs(60),
            get_hashes_timeout: Duration::from_secs(30),
            ban_duration_corrupted_data: Duration::from_secs(30 * 60),
            max_socket_errors_before_close: 3,
            chunk_buffer_size: 32 * 1024,
            time_recheck_chunk_factor: 1.0,
            // 10 MB/s is a conservative default LAN speed assumption; actual
            // peer speeds are tracked independently and override this for
            // peer-selection purposes.
            lan_speed: 10 * 1024 * 1024,
            switch_to_another_peer_factor: 1.25,
            peer_absence_timeout: Duration::from_secs(2 * 60),
            max_concurrent_downloads: 3,
            max_active_chunks_per_download: 2,
            max_concurrent_uploads: 3,
        }
    }
}
