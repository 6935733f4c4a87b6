//! The peer-to-peer wire protocol: frame header, message set, and the
//! [`tokio_util::codec`] `Encoder`/`Decoder` pair that (de)serializes it.
//!
//! Framing follows the teacher crate's approach of swapping
//! `tokio_util::codec::Decoder` implementations on the same
//! `tokio_util::codec::Framed` transport at well-defined points (there, to
//! move from a handshake codec to the steady-state peer message codec; here,
//! to move from typed framing to a raw chunk-byte stream and back, see
//! [`crate::socket`]). There is no handshake in this protocol -- trust is
//! implicit within the LAN -- so every socket starts straight in framed
//! mode.
//!
//! Each frame on the wire is:
//!
//! ```text
//! [ local_peer_id: 20 bytes ][ remote_peer_id: 20 bytes ][ type: u32 ][ length: u32 ][ payload: length bytes ]
//! ```
//!
//! `type` selects the payload's [`Message`] variant; unknown values are
//! logged and the frame is dropped rather than treated as a fatal protocol
//! error, to permit forward compatibility per the design.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::hash::HASH_LEN;
use crate::{Hash, PeerId};

/// The length, in bytes, of the fixed-size frame header (two peer ids plus
/// the `type` and `length` fields).
pub const HEADER_LEN: usize = HASH_LEN * 2 + 4 + 4;

/// The maximum payload length we're willing to allocate a buffer for. This
/// bounds a malicious or buggy peer's ability to make us allocate
/// unboundedly from a single length field.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Stable integer discriminants for [`Message`] variants, sent as the
/// frame's `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageId {
    GetEntries = 1,
    GetEntriesResult = 2,
    GetHashes = 3,
    GetHashesResult = 4,
    Hash = 5,
    GetChunk = 6,
    GetChunkResult = 7,
    Chat = 8,
}

impl MessageId {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::GetEntries,
            2 => Self::GetEntriesResult,
            3 => Self::GetHashes,
            4 => Self::GetHashesResult,
            5 => Self::Hash,
            6 => Self::GetChunk,
            7 => Self::GetChunkResult,
            8 => Self::Chat,
            _ => return None,
        })
    }
}

/// The status of a `GET_CHUNK` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetChunkStatus {
    Ok,
    DontHave,
    Error,
}

impl GetChunkStatus {
    fn to_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::DontHave => 1,
            Self::Error => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::DontHave,
            2 => Self::Error,
            _ => return Err(Error::InvalidFrame("unknown GetChunkStatus".into())),
        })
    }
}

/// The status of a `GET_HASHES` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetHashesStatus {
    Ok,
    UnknownEntry,
}

impl GetHashesStatus {
    fn to_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::UnknownEntry => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::UnknownEntry,
            _ => return Err(Error::InvalidFrame("unknown GetHashesStatus".into())),
        })
    }
}

/// A single file/directory descriptor in the shared catalog, as exchanged
/// by `GET_ENTRIES`/`GET_ENTRIES_RESULT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub id: Hash,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// The core peer<->peer message set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Request the catalog entries under `dirs` (or the shared roots, if
    /// `get_roots` or `dirs` is empty).
    GetEntries { dirs: Vec<Hash>, get_roots: bool },
    GetEntriesResult { entries: Vec<EntryDescriptor> },
    /// Request the ordered list of chunk hashes making up `file`.
    GetHashes { file: Hash },
    GetHashesResult {
        status: GetHashesStatus,
        nb_hash: u32,
    },
    /// One hash in a `GET_HASHES_RESULT` stream.
    Hash(Hash),
    /// Request chunk bytes starting at `offset`. On `Ok`, the sender
    /// transitions to streaming mode and follows the `GET_CHUNK_RESULT`
    /// frame with exactly `chunk_size` raw bytes.
    GetChunk { chunk_hash: Hash, offset: u64 },
    GetChunkResult {
        status: GetChunkStatus,
        chunk_size: Option<u64>,
    },
    /// Fire-and-forget text chat message.
    Chat { message: String },
}

impl Message {
    /// Returns the wire [`MessageId`] for this message's variant.
    pub fn id(&self) -> MessageId {
        match self {
            Self::GetEntries { .. } => MessageId::GetEntries,
            Self::GetEntriesResult { .. } => MessageId::GetEntriesResult,
            Self::GetHashes { .. } => MessageId::GetHashes,
            Self::GetHashesResult { .. } => MessageId::GetHashesResult,
            Self::Hash(_) => MessageId::Hash,
            Self::GetChunk { .. } => MessageId::GetChunk,
            Self::GetChunkResult { .. } => MessageId::GetChunkResult,
            Self::Chat { .. } => MessageId::Chat,
        }
    }
}

fn put_hash(buf: &mut BytesMut, hash: &Hash) {
    buf.put_slice(hash.as_bytes());
}

fn get_hash(buf: &mut impl Buf) -> Result<Hash, Error> {
    if buf.remaining() < HASH_LEN {
        return Err(Error::InvalidFrame("truncated hash".into()));
    }
    let mut bytes = [0u8; HASH_LEN];
    buf.copy_to_slice(&mut bytes);
    Ok(Hash::new(bytes))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut impl Buf) -> Result<String, Error> {
    if buf.remaining() < 4 {
        return Err(Error::InvalidFrame("truncated string length".into()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::InvalidFrame("truncated string body".into()));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::InvalidFrame("invalid utf8".into()))
}

/// Serializes `msg`'s payload (not including the frame header) into `buf`.
fn encode_payload(msg: &Message, buf: &mut BytesMut) {
    match msg {
        Message::GetEntries { dirs, get_roots } => {
            buf.put_u32(dirs.len() as u32);
            for dir in dirs {
                put_hash(buf, dir);
            }
            buf.put_u8(*get_roots as u8);
        }
        Message::GetEntriesResult { entries } => {
            buf.put_u32(entries.len() as u32);
            for entry in entries {
                put_hash(buf, &entry.id);
                put_string(buf, &entry.name);
                buf.put_u8(entry.is_dir as u8);
                buf.put_u64(entry.size);
            }
        }
        Message::GetHashes { file } => put_hash(buf, file),
        Message::GetHashesResult { status, nb_hash } => {
            buf.put_u8(status.to_u8());
            buf.put_u32(*nb_hash);
        }
        Message::Hash(hash) => put_hash(buf, hash),
        Message::GetChunk { chunk_hash, offset } => {
            put_hash(buf, chunk_hash);
            buf.put_u64(*offset);
        }
        Message::GetChunkResult { status, chunk_size } => {
            buf.put_u8(status.to_u8());
            match chunk_size {
                Some(size) => {
                    buf.put_u8(1);
                    buf.put_u64(*size);
                }
                None => buf.put_u8(0),
            }
        }
        Message::Chat { message } => put_string(buf, message),
    }
}

fn decode_payload(id: MessageId, buf: &mut impl Buf) -> Result<Message, Error> {
    Ok(match id {
        MessageId::GetEntries => {
            if buf.remaining() < 4 {
                return Err(Error::InvalidFrame("truncated GetEntries".into()));
            }
            let count = buf.get_u32() as usize;
            let mut dirs = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                dirs.push(get_hash(buf)?);
            }
            if buf.remaining() < 1 {
                return Err(Error::InvalidFrame("truncated GetEntries".into()));
            }
            let get_roots = buf.get_u8() != 0;
            Message::GetEntries { dirs, get_roots }
        }
        MessageId::GetEntriesResult => {
            if buf.remaining() < 4 {
                return Err(Error::InvalidFrame("truncated GetEntriesResult".into()));
            }
            let count = buf.get_u32() as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let id = get_hash(buf)?;
                let name = get_string(buf)?;
                if buf.remaining() < 1 + 8 {
                    return Err(Error::InvalidFrame("truncated entry".into()));
                }
                let is_dir = buf.get_u8() != 0;
                let size = buf.get_u64();
                entries.push(EntryDescriptor {
                    id,
                    name,
                    is_dir,
                    size,
                });
            }
            Message::GetEntriesResult { entries }
        }
        MessageId::GetHashes => Message::GetHashes {
            file: get_hash(buf)?,
        },
        MessageId::GetHashesResult => {
            if buf.remaining() < 1 + 4 {
                return Err(Error::InvalidFrame("truncated GetHashesResult".into()));
            }
            let status = GetHashesStatus::from_u8(buf.get_u8())?;
            let nb_hash = buf.get_u32();
            Message::GetHashesResult { status, nb_hash }
        }
        MessageId::Hash => Message::Hash(get_hash(buf)?),
        MessageId::GetChunk => {
            let chunk_hash = get_hash(buf)?;
            if buf.remaining() < 8 {
                return Err(Error::InvalidFrame("truncated GetChunk".into()));
            }
            let offset = buf.get_u64();
            Message::GetChunk { chunk_hash, offset }
        }
        MessageId::GetChunkResult => {
            if buf.remaining() < 1 + 1 {
                return Err(Error::InvalidFrame("truncated GetChunkResult".into()));
            }
            let status = GetChunkStatus::from_u8(buf.get_u8())?;
            let has_size = buf.get_u8() != 0;
            let chunk_size = if has_size {
                if buf.remaining() < 8 {
                    return Err(Error::InvalidFrame("truncated GetChunkResult size".into()));
                }
                Some(buf.get_u64())
            } else {
                None
            };
            Message::GetChunkResult { status, chunk_size }
        }
        MessageId::Chat => Message::Chat {
            message: get_string(buf)?,
        },
    })
}

/// A decoded frame header plus enough information to fetch and decode the
/// payload once it has fully arrived.
struct FrameHeader {
    local_peer_id: PeerId,
    remote_peer_id: PeerId,
    msg_id: MessageId,
    len: u32,
}

/// The [`Decoder`]/[`Encoder`] pair for framed mode.
///
/// `local_id` is stamped into every outgoing frame; `remote_id`, once known,
/// is cross-checked against every incoming frame's claimed remote id (set to
/// `None` until the first frame establishes it, mirroring how
/// [`crate::connection_pool::ConnectionPool::accept`] learns the remote
/// peer's id from the first inbound frame).
pub struct MessageCodec {
    pub local_id: PeerId,
    pub remote_id: Option<PeerId>,
    header: Option<FrameHeader>,
}

impl MessageCodec {
    pub fn new(local_id: PeerId, remote_id: Option<PeerId>) -> Self {
        Self {
            local_id,
            remote_id,
            header: None,
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Error> {
        let remote_id = self.remote_id.ok_or_else(|| {
            Error::InvalidFrame("cannot send before remote peer id is known".into())
        })?;

        let mut payload = BytesMut::new();
        encode_payload(&msg, &mut payload);

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&self.local_id);
        dst.put_slice(&remote_id);
        dst.put_u32(msg.id() as u32);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        if self.header.is_none() {
            if src.len() < HEADER_LEN {
                src.reserve(HEADER_LEN - src.len());
                return Ok(None);
            }

            let mut local_peer_id = [0u8; HASH_LEN];
            local_peer_id.copy_from_slice(&src[0..HASH_LEN]);
            let mut remote_peer_id = [0u8; HASH_LEN];
            remote_peer_id.copy_from_slice(&src[HASH_LEN..HASH_LEN * 2]);

            let mut rest = &src[HASH_LEN * 2..HEADER_LEN];
            let type_val = rest.get_u32();
            let len = rest.get_u32();

            if len > MAX_FRAME_LEN {
                return Err(Error::FrameTooLarge {
                    len,
                    max: MAX_FRAME_LEN,
                });
            }
            let msg_id = MessageId::from_u32(type_val)
                .ok_or_else(|| Error::InvalidFrame(format!("unknown type {}", type_val)))?;

            // the frame's "remote_peer_id" field is the sender's view of
            // *us*, i.e. it must equal our local id for this frame to be
            // addressed to us.
            if remote_peer_id != self.local_id {
                return Err(Error::InvalidFrame(
                    "frame's remote_peer_id doesn't match our id".into(),
                ));
            }

            src.advance(HEADER_LEN);
            self.header = Some(FrameHeader {
                local_peer_id,
                remote_peer_id,
                msg_id,
                len,
            });
        }

        let header = self.header.as_ref().expect("header just set");
        if src.len() < header.len as usize {
            src.reserve(header.len as usize - src.len());
            return Ok(None);
        }

        let header = self.header.take().expect("header still set");
        match self.remote_id {
            Some(expected) if expected != header.local_peer_id => {
                return Err(Error::PeerIdMismatch {
                    expected: Hash::new(expected),
                    actual: Hash::new(header.local_peer_id),
                });
            }
            None => self.remote_id = Some(header.local_peer_id),
            _ => {}
        }

        let mut payload = src.split_to(header.len as usize);
        let msg = decode_payload(header.msg_id, &mut payload)?;
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn codec_pair() -> (MessageCodec, MessageCodec) {
        let a = [1u8; HASH_LEN];
        let b = [2u8; HASH_LEN];
        (MessageCodec::new(a, Some(b)), MessageCodec::new(b, Some(a)))
    }

    fn round_trip(msg: Message) {
        let (mut enc, mut dec) = codec_pair();
        let mut buf = BytesMut::new();
        enc.encode(msg.clone(), &mut buf).unwrap();
        let decoded = dec.decode(&mut buf).unwrap().expect("frame decoded");
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_round_trip_get_entries() {
        round_trip(Message::GetEntries {
            dirs: vec![Hash::new([3; HASH_LEN]), Hash::new([4; HASH_LEN])],
            get_roots: true,
        });
        round_trip(Message::GetEntries {
            dirs: vec![],
            get_roots: false,
        });
    }

    #[test]
    fn test_round_trip_get_entries_result() {
        round_trip(Message::GetEntriesResult {
            entries: vec![
                EntryDescriptor {
                    id: Hash::new([5; HASH_LEN]),
                    name: "movies".into(),
                    is_dir: true,
                    size: 0,
                },
                EntryDescriptor {
                    id: Hash::new([6; HASH_LEN]),
                    name: "song.flac".into(),
                    is_dir: false,
                    size: 123456,
                },
            ],
        });
    }

    #[test]
    fn test_round_trip_get_hashes() {
        round_trip(Message::GetHashes {
            file: Hash::new([9; HASH_LEN]),
        });
        round_trip(Message::GetHashesResult {
            status: GetHashesStatus::Ok,
            nb_hash: 42,
        });
        round_trip(Message::GetHashesResult {
            status: GetHashesStatus::UnknownEntry,
            nb_hash: 0,
        });
        round_trip(Message::Hash(Hash::new([10; HASH_LEN])));
    }

    #[test]
    fn test_round_trip_get_chunk() {
        round_trip(Message::GetChunk {
            chunk_hash: Hash::new([11; HASH_LEN]),
            offset: 16384,
        });
        round_trip(Message::GetChunkResult {
            status: GetChunkStatus::Ok,
            chunk_size: Some(1 << 20),
        });
        round_trip(Message::GetChunkResult {
            status: GetChunkStatus::DontHave,
            chunk_size: None,
        });
        round_trip(Message::GetChunkResult {
            status: GetChunkStatus::Error,
            chunk_size: None,
        });
    }

    #[test]
    fn test_round_trip_chat() {
        round_trip(Message::Chat {
            message: "hello LAN".into(),
        });
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let (mut enc, mut dec) = codec_pair();
        let mut buf = BytesMut::new();
        enc.encode(
            Message::Chat {
                message: "split across reads".into(),
            },
            &mut buf,
        )
        .unwrap();

        // feed the decoder one byte at a time up until the last byte; it
        // should never produce a message early.
        let full = buf.split();
        let mut partial = BytesMut::new();
        for i in 0..full.len() - 1 {
            partial.extend_from_slice(&full[i..i + 1]);
            assert!(dec.decode(&mut partial).unwrap().is_none());
        }
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert!(dec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_unknown_remote_peer_id_rejected() {
        let a = [1u8; HASH_LEN];
        let b = [2u8; HASH_LEN];
        let other = [3u8; HASH_LEN];

        let mut enc = MessageCodec::new(b, Some(a));
        let mut dec = MessageCodec::new(a, Some(other));

        let mut buf = BytesMut::new();
        enc.encode(Message::Chat { message: "hi".into() }, &mut buf)
            .unwrap();
        let err = dec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::PeerIdMismatch { .. }));
    }

    #[test]
    fn test_frame_too_large_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[1u8; HASH_LEN]);
        buf.put_slice(&[2u8; HASH_LEN]);
        buf.put_u32(MessageId::Chat as u32);
        buf.put_u32(MAX_FRAME_LEN + 1);

        let mut dec = MessageCodec::new([1u8; HASH_LEN], Some([2u8; HASH_LEN]));
        let err = dec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }
}
