mod queue;

pub use queue::PieceQueue;

use crate::torrent::{PieceHash, TorrentDescriptor};

/// Standard block size (16 KB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Block requests issued back to back when a piece is started
pub const PIPELINE_DEPTH: usize = 5;

/// A piece not yet downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceDescriptor {
    pub hash: PieceHash,
    /// Index of the piece within the torrent
    pub order: usize,
}

impl PieceDescriptor {
    /// One descriptor per piece, in file-offset order.
    pub fn all(torrent: &TorrentDescriptor) -> Vec<Self> {
        torrent
            .pieces
            .iter()
            .enumerate()
            .map(|(order, hash)| Self { hash: *hash, order })
            .collect()
    }
}

/// Verified piece content on its way to the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub data: Vec<u8>,
    pub order: usize,
}
