//! Tracks in-flight [`Uploader`]s and enforces a global concurrency cap on
//! them, mirroring [`crate::download_manager::DownloadManager`] on the
//! serving side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::conf::TransferConf;
use crate::connection_pool::ConnectionPool;
use crate::file_manager::FileManager;
use crate::socket::MessageSocket;
use crate::transfer_rate::TransferRateCalculator;
use crate::uploader::Uploader;
use crate::wire::Message;
use crate::{Hash, PeerId};

struct Slot {
    peer_id: Hash,
}

/// Accepts `GET_CHUNK` requests arriving on already-open sockets and runs
/// one [`Uploader`] per request, up to `max_concurrent_uploads`.
pub struct UploadManager {
    local_id: PeerId,
    file_manager: Arc<dyn FileManager>,
    pool: Arc<ConnectionPool>,
    conf: Arc<TransferConf>,
    rate: TransferRateCalculator,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, Slot>>,
}

impl UploadManager {
    pub fn new(
        local_id: PeerId,
        file_manager: Arc<dyn FileManager>,
        pool: Arc<ConnectionPool>,
        conf: Arc<TransferConf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            file_manager,
            pool,
            conf,
            rate: TransferRateCalculator::default(),
            next_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn upload_rate(&self) -> f64 {
        self.rate.rate()
    }

    pub async fn active_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Reads the next message off `socket` (already in framed mode) and
    /// dispatches it via [`Self::dispatch`].
    pub async fn handle_next(
        self: &Arc<Self>,
        peer_id: Hash,
        socket: Arc<Mutex<MessageSocket>>,
    ) -> Option<Message> {
        let msg = {
            let mut socket = socket.lock().await;
            match socket.recv().await {
                Ok(Some(msg)) => msg,
                Ok(None) => return None,
                Err(e) => {
                    warn!("error reading from peer {}: {}", peer_id, e);
                    return None;
                }
            }
        };
        self.dispatch(peer_id, socket, msg).await
    }

    /// If `msg` is a `GET_CHUNK`, spawns an [`Uploader`] for it under the
    /// concurrency cap -- dropping the request with a log line if the cap
    /// is already full, matching the design's "no queueing, the scheduler
    /// just doesn't admit more than the cap" policy. Any other message is
    /// returned to the caller to dispatch elsewhere (catalog browsing,
    /// hash requests, chat).
    pub async fn dispatch(
        self: &Arc<Self>,
        peer_id: Hash,
        socket: Arc<Mutex<MessageSocket>>,
        msg: Message,
    ) -> Option<Message> {
        let (chunk_hash, offset) = match &msg {
            Message::GetChunk { chunk_hash, offset } => (*chunk_hash, *offset),
            _ => return Some(msg),
        };

        if self.active_count().await >= self.conf.max_concurrent_uploads {
            debug!(
                "dropping GET_CHUNK from {} for {}: upload concurrency cap reached",
                peer_id, chunk_hash
            );
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.in_flight.lock().await.insert(id, Slot { peer_id });

        let this = self.clone();
        let file_manager = self.file_manager.clone();
        let conf = self.conf.clone();
        let rate = self.rate.clone();
        let pool = self.pool.clone();
        let local_id = self.local_id;

        tokio::spawn(async move {
            let uploader = Uploader::new(id, chunk_hash, offset, peer_id);
            let status = {
                let mut socket = socket.lock().await;
                uploader
                    .run(
                        &mut socket,
                        file_manager.as_ref(),
                        &rate,
                        conf.upload_live_time,
                        conf.chunk_buffer_size,
                        conf.max_socket_errors_before_close,
                    )
                    .await
            };
            debug!("uploader {} for chunk {} finished: {:?}", id, chunk_hash, status);

            this.in_flight.lock().await.remove(&id);
            let _ = local_id;
            if let Ok(socket) = Arc::try_unwrap(socket) {
                let socket = socket.into_inner();
                if !socket.is_closed() {
                    pool.insert(peer_id, socket);
                }
            }
        });

        None
    }

    /// Binds nothing itself -- takes an already-bound `listener` -- and
    /// accepts inbound connections forever, handing each one to
    /// [`crate::connection_pool::ConnectionPool::accept`] to learn the
    /// dialing peer's id before dispatching its first message and then
    /// looping on [`Self::dispatch`] for as long as the connection stays
    /// open. An accept error logs and retries rather than tearing down the
    /// listener, and a handshake failure on one connection only drops that
    /// connection.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept inbound connection: {}", e);
                    continue;
                }
            };
            debug!("accepted inbound connection from {}", addr);

            let this = self.clone();
            tokio::spawn(async move {
                let (peer_id, socket, first_msg) = match this.pool.accept(stream, addr).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("handshake with inbound connection from {} failed: {}", addr, e);
                        return;
                    }
                };
                let socket = Arc::new(Mutex::new(socket));
                this.dispatch(peer_id, socket.clone(), first_msg).await;

                loop {
                    let msg = {
                        let mut locked = socket.lock().await;
                        match locked.recv().await {
                            Ok(Some(msg)) => msg,
                            Ok(None) => break,
                            Err(e) => {
                                warn!("error reading from peer {}: {}", peer_id, e);
                                break;
                            }
                        }
                    };
                    this.dispatch(peer_id, socket.clone(), msg).await;
                }
            });
        }
    }
}
