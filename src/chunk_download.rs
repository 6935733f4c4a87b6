//! Drives a single chunk's transfer from whichever of its known source
//! peers is fastest and currently free.
//!
//! Grounded directly in the original `ChunkDownload` class: peer selection
//! (`getTheFastestFreePeer`/`getNumberOfFreePeer`), the start/stream/end
//! lifecycle (`startDownloading`/`run`/`downloadingEnded`), and the
//! periodic "is a better peer free now" check inside the streaming loop.
//! The original runs the streaming loop on a dedicated `QThread` and
//! communicates state back via Qt signals; here the whole lifecycle --
//! start, stream, end -- is one `async fn` that the scheduler awaits,
//! since async/await already gives cooperative, non-blocking IO without a
//! dedicated OS thread per chunk.
//!
//! The original also protects its peer list and current-peer fields with a
//! single `QMutex::Recursive`, because its helper methods
//! (`getTheFastestFreePeer`, `getNumberOfFreePeer`) call back into
//! mutex-guarded state from within another locked section. This version
//! restructures those helpers to take a snapshot of the peer list, drop the
//! lock, and only then consult `PeerRegistry`/`OccupiedPeers` -- so no
//! section ever needs to re-enter its own lock, and a plain (non-recursive)
//! `std::sync::Mutex` suffices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::conf::TransferConf;
use crate::connection_pool::ConnectionPool;
use crate::error::Error;
use crate::file_manager::ChunkHandle;
use crate::occupied_peers::OccupiedPeers;
use crate::peer_registry::PeerRegistry;
use crate::socket::FinishedStatus;
use crate::wire::{GetChunkStatus, Message};
use crate::{Hash, PeerId};

/// How the most recent attempt at downloading this chunk ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    Error,
    ToClose,
}

struct State {
    chunk: Option<Arc<dyn ChunkHandle>>,
    peers: Vec<Hash>,
    current_peer: Option<Hash>,
}

/// Downloads one chunk, retrying across its known peers as attempts end.
pub struct ChunkDownload {
    chunk_hash: Hash,
    state: Mutex<State>,
    downloading: AtomicBool,
}

impl ChunkDownload {
    pub fn new(chunk_hash: Hash) -> Self {
        Self {
            chunk_hash,
            state: Mutex::new(State {
                chunk: None,
                peers: Vec::new(),
                current_peer: None,
            }),
            downloading: AtomicBool::new(false),
        }
    }

    pub fn hash(&self) -> Hash {
        self.chunk_hash
    }

    /// Attaches the chunk handle once the file manager has allocated it.
    pub fn set_chunk(&self, chunk: Arc<dyn ChunkHandle>) {
        self.state.lock().expect("chunk download lock poisoned").chunk = Some(chunk);
    }

    pub fn add_peer(&self, peer_id: Hash) {
        let mut state = self.state.lock().expect("chunk download lock poisoned");
        if !state.peers.contains(&peer_id) {
            state.peers.push(peer_id);
        }
    }

    pub fn remove_peer(&self, peer_id: &Hash) {
        let mut state = self.state.lock().expect("chunk download lock poisoned");
        state.peers.retain(|p| p != peer_id);
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    /// Clears the `downloading` flag, asking an in-flight
    /// [`Self::run_once`] to stop at its next loop iteration.
    pub fn cancel(&self) {
        self.downloading.store(false, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.state
            .lock()
            .expect("chunk download lock poisoned")
            .chunk
            .as_ref()
            .map(|c| c.is_complete())
            .unwrap_or(false)
    }

    /// Prunes peers the registry no longer considers available and returns
    /// the survivors ranked fastest-known-speed first, ties broken by
    /// lowest peer id. Takes a snapshot under the lock, then drops it
    /// before consulting `registry` -- unlike the original's recursive
    /// mutex, this never calls back into its own lock.
    fn ranked_peers(&self, registry: &PeerRegistry, absence_timeout: Duration) -> Vec<Hash> {
        let snapshot = {
            let state = self.state.lock().expect("chunk download lock poisoned");
            state.peers.clone()
        };

        let mut available: Vec<Hash> = snapshot
            .into_iter()
            .filter(|peer| registry.is_available(peer, absence_timeout))
            .collect();

        {
            let mut state = self.state.lock().expect("chunk download lock poisoned");
            state.peers.retain(|p| available.contains(p));
        }

        available.sort_by(|a, b| {
            registry
                .speed_of(b)
                .cmp(&registry.speed_of(a))
                .then_with(|| a.cmp(b))
        });
        available
    }

    /// The number of currently free, available peers -- `0` means this
    /// chunk isn't ready to be picked by the scheduler.
    pub fn is_ready_to_download(
        &self,
        registry: &PeerRegistry,
        occupied: &OccupiedPeers,
        absence_timeout: Duration,
    ) -> usize {
        if self.is_downloading() || self.is_complete() {
            return 0;
        }
        self.ranked_peers(registry, absence_timeout)
            .iter()
            .filter(|peer| !occupied.is_occupied(peer))
            .count()
    }

    /// Runs one full start -> stream -> end attempt against whichever peer
    /// is fastest and free right now. Returns `None` if no peer could be
    /// claimed (the caller should simply not have picked this chunk, or
    /// should retry later).
    pub async fn run_once(
        &self,
        registry: &PeerRegistry,
        occupied: &OccupiedPeers,
        pool: &ConnectionPool,
        conf: &TransferConf,
        local_id: PeerId,
    ) -> Option<TransferStatus> {
        let chunk = {
            let state = self.state.lock().expect("chunk download lock poisoned");
            state.chunk.clone()
        };
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => {
                warn!("chunk {} has no allocated ChunkHandle yet, cannot start", self.chunk_hash);
                return None;
            }
        };

        let candidates = self.ranked_peers(registry, conf.peer_absence_timeout);
        let peer = occupied.occupy_first_free(&candidates)?;

        self.downloading.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().expect("chunk download lock poisoned");
            state.current_peer = Some(peer);
        }
        debug!("starting download of chunk {} from peer {}", self.chunk_hash, peer);

        let status = self
            .drive_transfer(&chunk, peer, registry, pool, conf, local_id)
            .await;

        {
            let mut state = self.state.lock().expect("chunk download lock poisoned");
            state.current_peer = None;
        }
        self.downloading.store(false, Ordering::SeqCst);
        occupied.release(&peer);
        debug!(
            "download ended for chunk {}{}: {:?}",
            self.chunk_hash,
            if chunk.is_complete() { "" } else { " (not complete)" },
            status
        );

        Some(status)
    }

    async fn drive_transfer(
        &self,
        chunk: &Arc<dyn ChunkHandle>,
        peer: Hash,
        registry: &PeerRegistry,
        pool: &ConnectionPool,
        conf: &TransferConf,
        local_id: PeerId,
    ) -> TransferStatus {
        let addr = match registry.addr_of(&peer) {
            Some(addr) => addr,
            None => {
                self.remove_peer(&peer);
                return TransferStatus::Error;
            }
        };

        let mut socket = match pool.acquire(peer, addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("failed to acquire a socket to peer {}: {}", peer, e);
                self.remove_peer(&peer);
                return TransferStatus::Error;
            }
        };

        let offset = chunk.known_bytes();
        if let Err(e) = socket
            .send(Message::GetChunk {
                chunk_hash: self.chunk_hash,
                offset,
            })
            .await
        {
            warn!("failed to send GetChunk to peer {}: {}", peer, e);
            return TransferStatus::Error;
        }

        let reply = match tokio::time::timeout(conf.socket_timeout, socket.recv()).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => {
                socket.finished(FinishedStatus::Error, conf.max_socket_errors_before_close);
                if !socket.is_closed() {
                    pool.insert(peer, socket);
                }
                self.remove_peer(&peer);
                return TransferStatus::Error;
            }
            Ok(Err(e)) => {
                warn!("error receiving GetChunkResult from peer {}: {}", peer, e);
                return TransferStatus::Error;
            }
            Err(_) => {
                socket.finished(FinishedStatus::Error, conf.max_socket_errors_before_close);
                pool.insert(peer, socket);
                return TransferStatus::Error;
            }
        };

        let (status, chunk_size) = match reply {
            Message::GetChunkResult { status, chunk_size } => (status, chunk_size),
            other => {
                warn!("expected GetChunkResult, got {:?}", other);
                socket.finished(FinishedStatus::Error, conf.max_socket_errors_before_close);
                pool.insert(peer, socket);
                return TransferStatus::Error;
            }
        };

        if status != GetChunkStatus::Ok {
            debug!("peer {} replied {:?} for chunk {}", peer, status, self.chunk_hash);
            socket.finished(FinishedStatus::Ok, conf.max_socket_errors_before_close);
            if !socket.is_closed() {
                pool.insert(peer, socket);
            }
            self.remove_peer(&peer);
            return TransferStatus::Error;
        }

        let chunk_size = match chunk_size {
            Some(size) => size,
            None => {
                warn!("GetChunkResult OK but missing chunk_size for chunk {}", self.chunk_hash);
                socket.finished(FinishedStatus::Error, conf.max_socket_errors_before_close);
                if !socket.is_closed() {
                    pool.insert(peer, socket);
                }
                return TransferStatus::Error;
            }
        };

        let expected = chunk.total_bytes().saturating_sub(offset);
        if chunk_size != expected {
            warn!(
                "chunk size mismatch for {}: peer announced {}, expected {}",
                self.chunk_hash, chunk_size, expected
            );
            socket.finished(FinishedStatus::Error, conf.max_socket_errors_before_close);
            if !socket.is_closed() {
                pool.insert(peer, socket);
            }
            return TransferStatus::Error;
        }

        let mut stream = match socket.start_streaming() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to enter streaming mode with peer {}: {}", peer, e);
                return TransferStatus::Error;
            }
        };

        let writer = match chunk.writer().await {
            Ok(writer) => writer,
            Err(e) => {
                warn!("failed to open a writer for chunk {}: {}", self.chunk_hash, e);
                socket.stop_streaming(stream);
                socket.finished(FinishedStatus::Error, conf.max_socket_errors_before_close);
                return TransferStatus::Error;
            }
        };

        let status = self
            .stream_chunk(&mut stream, writer, peer, offset, chunk_size, registry, conf)
            .await;

        socket.stop_streaming(stream);
        let finished_status = match status {
            TransferStatus::Ok => FinishedStatus::Ok,
            TransferStatus::Error => FinishedStatus::Error,
            TransferStatus::ToClose => FinishedStatus::ToClose,
        };
        socket.finished(finished_status, conf.max_socket_errors_before_close);
        if !socket.is_closed() {
            pool.insert(peer, socket);
        }

        status
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_chunk(
        &self,
        stream: &mut crate::socket::StreamHandle,
        mut writer: Box<dyn crate::file_manager::DataWriter>,
        peer: Hash,
        start_offset: u64,
        chunk_size: u64,
        registry: &PeerRegistry,
        conf: &TransferConf,
    ) -> TransferStatus {
        let mut buf = vec![0u8; conf.chunk_buffer_size];
        let mut pos_in_buf = 0usize;
        let mut bytes_remaining = chunk_size;
        let mut write_offset = start_offset;

        let mut delta_bytes: u64 = 0;
        let mut window_start = Instant::now();
        let recheck_interval = conf.recheck_interval(chunk_size);

        loop {
            if !self.downloading.load(Ordering::SeqCst) {
                debug!("download of chunk {} cancelled by owner", self.chunk_hash);
                // the peer may still have chunk bytes in flight; closing
                // rather than resuming framed mode avoids misreading them
                // as a frame header.
                return TransferStatus::ToClose;
            }
            if bytes_remaining == 0 {
                return TransferStatus::Ok;
            }

            let want = (bytes_remaining as usize).min(buf.len() - pos_in_buf);
            let n = match stream
                .read_with_timeout(&mut buf[pos_in_buf..pos_in_buf + want], conf.socket_timeout)
                .await
            {
                Ok(0) => {
                    warn!("peer {} closed the stream early for chunk {}", peer, self.chunk_hash);
                    return TransferStatus::ToClose;
                }
                Ok(n) => n,
                Err(Error::ReadTimeout) => {
                    warn!("read timeout streaming chunk {} from peer {}", self.chunk_hash, peer);
                    return TransferStatus::ToClose;
                }
                Err(e) => {
                    warn!("IO error streaming chunk {} from peer {}: {}", self.chunk_hash, peer, e);
                    return TransferStatus::ToClose;
                }
            };

            pos_in_buf += n;
            bytes_remaining -= n as u64;
            delta_bytes += n as u64;

            if window_start.elapsed() > recheck_interval {
                let elapsed_secs = window_start.elapsed().as_secs_f64().max(0.001);
                let observed_speed = (delta_bytes as f64 / elapsed_secs) as u64;
                registry.update_speed(peer, observed_speed);
                window_start = Instant::now();
                delta_bytes = 0;

                let candidates = self.ranked_peers(registry, conf.peer_absence_timeout);
                if let Some(&better) = candidates.first() {
                    if better != peer
                        && registry.speed_of(&better) as f64
                            > observed_speed as f64 * conf.switch_to_another_peer_factor
                    {
                        debug!(
                            "switching chunk {} from peer {} to faster peer {}",
                            self.chunk_hash, peer, better
                        );
                        return TransferStatus::ToClose;
                    }
                }
            }

            if pos_in_buf == buf.len() || bytes_remaining == 0 {
                if let Err(e) = writer.write_at(write_offset, &buf[..pos_in_buf]).await {
                    return match e {
                        Error::HashMismatch => {
                            warn!(
                                "corrupted data for chunk {} from peer {}, banning for {:?}",
                                self.chunk_hash, peer, conf.ban_duration_corrupted_data
                            );
                            registry.ban(peer, conf.ban_duration_corrupted_data);
                            TransferStatus::ToClose
                        }
                        other => {
                            warn!("write failed for chunk {}: {}", self.chunk_hash, other);
                            TransferStatus::ToClose
                        }
                    };
                }
                write_offset += pos_in_buf as u64;
                pos_in_buf = 0;
            }
        }
    }
}
