mod metainfo;
mod piece;

pub use metainfo::{FileInfo, TorrentDescriptor, TrackerUrl};
pub use piece::{PieceHash, Pieces, HASH_LEN};

use crate::bencode::decode;
use crate::error::Result;
use std::path::Path;
use tokio::fs;

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<TorrentDescriptor> {
    let data = fs::read(path).await?;
    parse_torrent(&data)
}

/// Parse torrent data from bytes
pub fn parse_torrent(data: &[u8]) -> Result<TorrentDescriptor> {
    TorrentDescriptor::from_bencode(&decode(data)?)
}
