use super::{PieceHash, Pieces};
use crate::bencode::{encode, BencodeValue};
use crate::error::{BittorrentError, Result};
use std::collections::HashSet;
use tracing::warn;
use url::Url;

/// A file inside the torrent, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path components relative to the download directory
    pub path: Vec<String>,
    pub length: u64,
}

impl FileInfo {
    pub fn new<S: Into<String>>(path: impl IntoIterator<Item = S>, length: u64) -> Self {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            length,
        }
    }
}

/// A tracker announce URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerUrl(Url);

impl TrackerUrl {
    pub fn parse(url: &str) -> Result<Self> {
        Ok(Self(Url::parse(url.trim())?))
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    pub fn is_udp(&self) -> bool {
        self.scheme() == "udp"
    }

    pub fn is_http(&self) -> bool {
        matches!(self.scheme(), "http" | "https")
    }

    /// `host:port` suitable for name resolution.
    pub fn host_port(&self) -> Result<String> {
        let host = self
            .0
            .host_str()
            .ok_or_else(|| BittorrentError::TrackerError(format!("No host in {}", self.0)))?;
        let port = self
            .0
            .port_or_known_default()
            .ok_or_else(|| BittorrentError::TrackerError(format!("No port in {}", self.0)))?;
        Ok(format!("{}:{}", host, port))
    }

    /// Path plus query, e.g. `/announce?key=1`.
    pub fn request_path(&self) -> String {
        match self.0.query() {
            Some(query) => format!("{}?{}", self.0.path(), query),
            None => self.0.path().to_string(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Everything the download engine needs to know about a torrent
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    /// Suggested name for the file or directory
    pub name: String,
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: [u8; 20],
    pub pieces: Pieces,
    pub piece_length: u64,
    /// Sum of all file lengths
    pub total_length: u64,
    pub files: Vec<FileInfo>,
    /// Announce URL followed by the announce-list, deduplicated
    pub trackers: Vec<TrackerUrl>,
}

impl TorrentDescriptor {
    /// Build a descriptor, checking that the piece list covers the files exactly.
    pub fn new(
        name: String,
        info_hash: [u8; 20],
        pieces: Pieces,
        piece_length: u64,
        files: Vec<FileInfo>,
        trackers: Vec<TrackerUrl>,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(BittorrentError::InvalidTorrent(
                "Piece length must be positive".to_string(),
            ));
        }
        if files.is_empty() {
            return Err(BittorrentError::InvalidTorrent("No files".to_string()));
        }
        for file in &files {
            validate_path(&file.path)?;
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(BittorrentError::InvalidTorrent(format!(
                "{} piece hashes for {} bytes at piece length {} (expected {})",
                pieces.len(),
                total_length,
                piece_length,
                expected_pieces
            )));
        }

        Ok(Self {
            name,
            info_hash,
            pieces,
            piece_length,
            total_length,
            files,
            trackers,
        })
    }

    /// Parse the top-level metainfo dictionary.
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(BittorrentError::InvalidTorrent(
                "Torrent must be a dict".to_string(),
            ));
        }

        let info = value
            .get("info")
            .filter(|v| v.as_dict().is_some())
            .ok_or_else(|| BittorrentError::InvalidTorrent("Missing 'info' dict".to_string()))?;
        let info_hash = PieceHash::of(&encode(info));

        let name = info
            .get_str("name")
            .ok_or_else(|| BittorrentError::InvalidTorrent("Missing 'name' field".to_string()))?
            .to_string();

        let piece_length = info
            .get_int("piece length")
            .filter(|&len| len > 0)
            .ok_or_else(|| {
                BittorrentError::InvalidTorrent("Missing 'piece length' field".to_string())
            })? as u64;

        let pieces = Pieces::from_bytes(info.get_bytes("pieces").ok_or_else(|| {
            BittorrentError::InvalidTorrent("Missing 'pieces' field".to_string())
        })?)?;

        let files = match (info.get("length"), info.get_list("files")) {
            (Some(length), _) => {
                let length = non_negative(length, "length")?;
                vec![FileInfo::new([name.clone()], length)]
            }
            (None, Some(entries)) => entries
                .iter()
                .map(parse_file_entry)
                .collect::<Result<Vec<_>>>()?,
            (None, None) => {
                return Err(BittorrentError::InvalidTorrent(
                    "Missing 'length' or 'files' field".to_string(),
                ))
            }
        };

        Self::new(
            name,
            *info_hash.as_bytes(),
            pieces,
            piece_length,
            files,
            collect_trackers(value),
        )
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Byte offset of piece `order` within the concatenated content.
    pub fn piece_offset(&self, order: usize) -> u64 {
        order as u64 * self.piece_length
    }

    /// Length of piece `order`; only the last piece may be shorter.
    pub fn piece_size(&self, order: usize) -> u64 {
        let offset = self.piece_offset(order);
        self.piece_length
            .min(self.total_length.saturating_sub(offset))
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn non_negative(value: &BencodeValue, field: &str) -> Result<u64> {
    value
        .as_integer()
        .filter(|&v| v >= 0)
        .map(|v| v as u64)
        .ok_or_else(|| BittorrentError::InvalidTorrent(format!("Invalid '{}' field", field)))
}

fn parse_file_entry(entry: &BencodeValue) -> Result<FileInfo> {
    let length = entry
        .get("length")
        .ok_or_else(|| BittorrentError::InvalidTorrent("Missing file 'length'".to_string()))
        .and_then(|v| non_negative(v, "length"))?;

    let path = entry
        .get_list("path")
        .ok_or_else(|| BittorrentError::InvalidTorrent("Missing file 'path'".to_string()))?
        .iter()
        .map(|component| {
            component.as_str().map(String::from).ok_or_else(|| {
                BittorrentError::InvalidTorrent("Invalid path component".to_string())
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(FileInfo { path, length })
}

/// Path components must stay inside the download directory.
fn validate_path(path: &[String]) -> Result<()> {
    if path.is_empty() {
        return Err(BittorrentError::InvalidTorrent("Empty file path".to_string()));
    }

    for component in path {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains(['/', '\\'])
        {
            return Err(BittorrentError::InvalidTorrent(format!(
                "Unsafe path component: {:?}",
                component
            )));
        }
    }

    Ok(())
}

fn collect_trackers(value: &BencodeValue) -> Vec<TrackerUrl> {
    let announce = value.get_str("announce").into_iter();
    let tiers = value
        .get_list("announce-list")
        .unwrap_or_default()
        .iter()
        .filter_map(BencodeValue::as_list)
        .flatten()
        .filter_map(BencodeValue::as_str);

    let mut seen = HashSet::new();
    let mut trackers = Vec::new();

    for raw in announce.chain(tiers) {
        match TrackerUrl::parse(raw) {
            Ok(tracker) => {
                if seen.insert(tracker.as_str().to_string()) {
                    trackers.push(tracker);
                }
            }
            Err(e) => warn!("Skipping tracker {:?}: {}", raw, e),
        }
    }

    trackers
}
