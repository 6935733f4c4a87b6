//! The crate-wide error type and result alias.
//!
//! Every fallible operation in the core returns [`Result`]. Variants are
//! grouped the way the design splits failures: protocol framing, transport,
//! remote-logical responses, local IO, and data integrity.

use std::fmt;
use std::io;

use crate::Hash;

/// The crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type.
#[derive(Debug)]
pub enum Error {
    /// The wire frame was malformed (bad length, truncated header, unknown
    /// message type byte).
    InvalidFrame(String),
    /// A length field in a frame exceeded the configured maximum.
    FrameTooLarge { len: u32, max: u32 },
    /// The peer id in an accepted connection's first frame didn't match the
    /// id this connection pool was created for.
    PeerIdMismatch { expected: Hash, actual: Hash },
    /// Underlying socket IO failed.
    Io(io::Error),
    /// A read did not produce data before `socket_timeout` elapsed.
    ReadTimeout,
    /// The peer's `GET_CHUNK_RESULT` carried a non-OK status.
    RemoteDontHave,
    /// The peer's `GET_CHUNK_RESULT` was OK but omitted `chunk_size`.
    MissingChunkSize,
    /// The peer reported (or we locally expect) a `chunk_size` that
    /// disagrees with the chunk we already know about.
    ChunkSizeMismatch { expected: u64, actual: u64 },
    /// The chunk was deleted by the file manager while a transfer was in
    /// flight.
    ChunkDeleted,
    /// A write would have gone past the chunk's declared length.
    WriteBeyondChunkEnd,
    /// The chunk's content didn't hash to the expected value once complete.
    HashMismatch,
    /// No peer is currently known for the requested chunk or peer id.
    PeerNotFound(Hash),
    /// The requested torrent/download id is unknown to the manager.
    InvalidDownloadId(u64),
    /// The requested chunk index is out of bounds for its download.
    InvalidChunkIndex,
    /// An internal channel closed unexpectedly; the owning task has likely
    /// already stopped.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFrame(reason) => write!(f, "invalid frame: {}", reason),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame length {} exceeds maximum {}", len, max)
            }
            Self::PeerIdMismatch { expected, actual } => write!(
                f,
                "peer id mismatch: expected {}, got {}",
                expected, actual
            ),
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::ReadTimeout => write!(f, "read timed out"),
            Self::RemoteDontHave => write!(f, "remote peer doesn't have the chunk"),
            Self::MissingChunkSize => {
                write!(f, "GET_CHUNK_RESULT was OK but missing chunk_size")
            }
            Self::ChunkSizeMismatch { expected, actual } => write!(
                f,
                "chunk size mismatch: expected {}, got {}",
                expected, actual
            ),
            Self::ChunkDeleted => write!(f, "chunk was deleted"),
            Self::WriteBeyondChunkEnd => write!(f, "write beyond end of chunk"),
            Self::HashMismatch => write!(f, "chunk content hash mismatch"),
            Self::PeerNotFound(id) => write!(f, "peer {} not found", id),
            Self::InvalidDownloadId(id) => write!(f, "download {} not found", id),
            Self::InvalidChunkIndex => write!(f, "chunk index out of bounds"),
            Self::ChannelClosed => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
