use crate::error::{BittorrentError, Result};
use sha1::{Digest, Sha1};
use std::fmt;

/// Size in bytes of a SHA-1 digest
pub const HASH_LEN: usize = 20;

/// SHA-1 digest of one piece's content
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceHash([u8; HASH_LEN]);

impl PieceHash {
    pub fn new(hash: [u8; HASH_LEN]) -> Self {
        Self(hash)
    }

    /// Digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&Sha1::digest(data));
        Self(hash)
    }

    /// Whether `data` hashes to this digest.
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceHash({})", hex::encode(self.0))
    }
}

/// Ordered piece digests of a torrent
#[derive(Debug, Clone, Default)]
pub struct Pieces {
    hashes: Vec<PieceHash>,
}

impl Pieces {
    /// Split the concatenated `pieces` blob of the info dictionary.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % HASH_LEN != 0 {
            return Err(BittorrentError::InvalidTorrent(format!(
                "Pieces length {} is not a multiple of {}",
                data.len(),
                HASH_LEN
            )));
        }

        let hashes = data
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(chunk);
                PieceHash(hash)
            })
            .collect();

        Ok(Self { hashes })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceHash> {
        self.hashes.iter()
    }
}

impl FromIterator<PieceHash> for Pieces {
    fn from_iter<I: IntoIterator<Item = PieceHash>>(iter: I) -> Self {
        Self {
            hashes: iter.into_iter().collect(),
        }
    }
}
