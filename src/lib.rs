//! The peer-to-peer transfer core of a decentralized LAN file-sharing node.
//!
//! This crate multiplexes TCP sockets per remote peer, frames a
//! length-prefixed message protocol over them, and drives a concurrent
//! multi-source chunk download/upload engine on top. It deliberately knows
//! nothing about LAN peer discovery, on-disk file layout, or the GUI --
//! those are external collaborators reached through the traits in
//! [`file_manager`] and [`discovery`].

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod connection_pool;
pub mod discovery;
pub mod download_manager;
pub mod error;
pub mod file_manager;
pub mod hash;
pub mod occupied_peers;
pub mod peer_registry;
pub mod socket;
pub mod transfer_rate;
pub mod upload_manager;
pub mod wire;

mod chunk_download;
mod uploader;

pub use chunk_download::{ChunkDownload, TransferStatus};
pub use hash::Hash;
pub use uploader::Uploader;

/// The peer ID is an arbitrary 20 byte string, carried raw in every frame
/// header. Higher level code (the peer registry, chunk download peer sets,
/// ...) works with [`Hash`] instead, which wraps this same width with
/// ordering and hex formatting.
pub type PeerId = [u8; hash::HASH_LEN];

/// Each download gets a monotonically increasing id, unique within this
/// node's process lifetime.
pub type DownloadId = u64;
