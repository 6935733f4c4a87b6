//! Serves a single `GET_CHUNK` request: look the chunk up, reply, then
//! stream the bytes.
//!
//! Grounded in the original `Uploader` (a `QThread` spawned per accepted
//! `GET_CHUNK`) and `Socket::onNewMessage`'s `GET_CHUNK` dispatch arm. Each
//! `Uploader` here is an async function run as its own `tokio::task` by
//! [`crate::upload_manager::UploadManager`], the same "one task per
//! transfer" shape `ChunkDownload` uses on the download side.

use std::time::Duration;

use log::{debug, warn};

use crate::file_manager::FileManager;
use crate::socket::{FinishedStatus, MessageSocket};
use crate::transfer_rate::TransferRateCalculator;
use crate::wire::{GetChunkStatus, Message};
use crate::Hash;

/// Handles one `GET_CHUNK { chunk_hash, offset }` already received on
/// `socket`, through to completion.
///
/// Always calls [`MessageSocket::finished`] before returning, so the
/// caller (`UploadManager`) can return the socket to its
/// [`crate::connection_pool::ConnectionPool`] once this resolves, the same
/// way `ChunkDownload` does on the requesting side.
pub struct Uploader {
    id: u64,
    chunk_hash: Hash,
    offset: u64,
    peer_id: Hash,
}

impl Uploader {
    pub fn new(id: u64, chunk_hash: Hash, offset: u64, peer_id: Hash) -> Self {
        Self {
            id,
            chunk_hash,
            offset,
            peer_id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_id(&self) -> Hash {
        self.peer_id
    }

    /// Runs the whole request to completion: looks the chunk up, replies
    /// with `GET_CHUNK_RESULT`, and -- if the offset is servable --
    /// streams the remaining bytes. `socket` must still be in framed mode
    /// when this is called; it is returned to framed mode before this
    /// returns, regardless of outcome.
    pub async fn run(
        &self,
        socket: &mut MessageSocket,
        file_manager: &dyn FileManager,
        rate: &TransferRateCalculator,
        upload_live_time: Duration,
        chunk_buffer_size: usize,
        max_socket_errors: u32,
    ) -> FinishedStatus {
        let chunk = file_manager.get_chunk(self.chunk_hash).await;
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => {
                debug!("peer {} requested unknown chunk {}", self.peer_id, self.chunk_hash);
                return self
                    .reply_and_finish(socket, GetChunkStatus::DontHave, None, max_socket_errors)
                    .await;
            }
        };

        let known_bytes = chunk.known_bytes();
        if self.offset > known_bytes {
            warn!(
                "peer {} requested offset {} beyond known_bytes {} for chunk {}",
                self.peer_id, self.offset, known_bytes, self.chunk_hash
            );
            return self
                .reply_and_finish(socket, GetChunkStatus::Error, None, max_socket_errors)
                .await;
        }

        let remaining = known_bytes - self.offset;
        if let Err(e) = socket
            .send(Message::GetChunkResult {
                status: GetChunkStatus::Ok,
                chunk_size: Some(remaining),
            })
            .await
        {
            warn!("failed to reply GetChunkResult for chunk {}: {}", self.chunk_hash, e);
            socket.finished(FinishedStatus::Error, max_socket_errors);
            return FinishedStatus::Error;
        }

        if remaining == 0 {
            socket.finished(FinishedStatus::Ok, max_socket_errors);
            return FinishedStatus::Ok;
        }

        let mut reader = match chunk.reader().await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("failed to open a reader for chunk {}: {}", self.chunk_hash, e);
                socket.finished(FinishedStatus::Error, max_socket_errors);
                return FinishedStatus::Error;
            }
        };

        let mut stream = match socket.start_streaming() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to enter streaming mode for chunk {}: {}", self.chunk_hash, e);
                return FinishedStatus::Error;
            }
        };

        let mut buf = vec![0u8; chunk_buffer_size];
        let mut pos = self.offset;
        let end = self.offset + remaining;
        let mut upload_status = FinishedStatus::Ok;

        while pos < end {
            let want = ((end - pos) as usize).min(buf.len());
            let n = match reader.read_at(pos, &mut buf[..want]).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("local read failed serving chunk {}: {}", self.chunk_hash, e);
                    upload_status = FinishedStatus::Error;
                    break;
                }
            };
            if n == 0 {
                warn!("local chunk {} shrank mid-upload", self.chunk_hash);
                upload_status = FinishedStatus::Error;
                break;
            }

            let write = tokio::time::timeout(upload_live_time, stream.write_all(&buf[..n])).await;
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("write failed uploading chunk {}: {}", self.chunk_hash, e);
                    upload_status = FinishedStatus::Error;
                    break;
                }
                Err(_) => {
                    warn!("peer {} stalled receiving chunk {}", self.peer_id, self.chunk_hash);
                    upload_status = FinishedStatus::Error;
                    break;
                }
            }

            rate.add_data(n as u64);
            pos += n as u64;
        }

        socket.stop_streaming(stream);
        socket.finished(upload_status, max_socket_errors);
        upload_status
    }

    async fn reply_and_finish(
        &self,
        socket: &mut MessageSocket,
        status: GetChunkStatus,
        chunk_size: Option<u64>,
        max_socket_errors: u32,
    ) -> FinishedStatus {
        let finished = match socket.send(Message::GetChunkResult { status, chunk_size }).await {
            Ok(()) => FinishedStatus::Ok,
            Err(e) => {
                warn!("failed to reply GetChunkResult for chunk {}: {}", self.chunk_hash, e);
                FinishedStatus::Error
            }
        };
        socket.finished(finished, max_socket_errors);
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::fake::FakeFileManager;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (MessageSocket, MessageSocket) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (server, (client, peer_addr)) = tokio::join!(connect, async {
            listener.accept().await.unwrap()
        });
        let server = server.unwrap();
        let local_a = [1u8; 20];
        let local_b = [2u8; 20];
        let mut a = MessageSocket::from_accepted(server, addr, local_a);
        a.set_remote_id(local_b);
        let mut b = MessageSocket::from_accepted(client, peer_addr, local_b);
        b.set_remote_id(local_a);
        (a, b)
    }

    #[tokio::test]
    async fn test_serves_full_chunk() {
        let (mut server_socket, mut client_socket) = connected_pair().await;
        let data = b"upload me please".to_vec();
        let hash = Hash::new([7u8; crate::hash::HASH_LEN]);

        let file_manager = FakeFileManager::new();
        file_manager.insert_complete(hash, data.clone());
        let rate = TransferRateCalculator::default();
        let peer_id = Hash::new([9u8; crate::hash::HASH_LEN]);

        let uploader = Uploader::new(1, hash, 0, peer_id);
        let server = tokio::spawn(async move {
            uploader
                .run(
                    &mut server_socket,
                    &file_manager,
                    &rate,
                    Duration::from_secs(5),
                    8,
                    3,
                )
                .await
        });

        let reply = client_socket.recv().await.unwrap().unwrap();
        assert_eq!(
            reply,
            Message::GetChunkResult {
                status: GetChunkStatus::Ok,
                chunk_size: Some(data.len() as u64),
            }
        );

        let mut stream = client_socket.start_streaming().unwrap();
        let mut received = vec![0u8; data.len()];
        let mut read = 0;
        while read < data.len() {
            let n = stream
                .read_with_timeout(&mut received[read..], Duration::from_secs(1))
                .await
                .unwrap();
            read += n;
        }
        assert_eq!(received, data);

        let status = server.await.unwrap();
        assert_eq!(status, FinishedStatus::Ok);
    }

    #[tokio::test]
    async fn test_unknown_chunk_replies_dont_have() {
        let (mut server_socket, mut client_socket) = connected_pair().await;
        let file_manager = FakeFileManager::new();
        let rate = TransferRateCalculator::default();
        let hash = Hash::new([1u8; crate::hash::HASH_LEN]);
        let peer_id = Hash::new([2u8; crate::hash::HASH_LEN]);

        let uploader = Uploader::new(1, hash, 0, peer_id);
        let server = tokio::spawn(async move {
            uploader
                .run(
                    &mut server_socket,
                    &file_manager,
                    &rate,
                    Duration::from_secs(5),
                    8,
                    3,
                )
                .await
        });

        let reply = client_socket.recv().await.unwrap().unwrap();
        assert_eq!(
            reply,
            Message::GetChunkResult {
                status: GetChunkStatus::DontHave,
                chunk_size: None,
            }
        );
        assert_eq!(server.await.unwrap(), FinishedStatus::Ok);
    }
}
