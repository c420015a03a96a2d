use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    BencodeError(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("Tracker error: {0}")]
    TrackerError(String),

    /// Dial or handshake failure; the peer may be requeued.
    #[error("Peer connection error: {0}")]
    ConnectionError(String),

    /// The peer broke the wire protocol; the session is aborted.
    #[error("Peer protocol error: {0}")]
    ProtocolError(String),

    #[error("Info hash mismatch in handshake with {0}")]
    InfoHashMismatch(SocketAddr),

    #[error("Piece {0} failed integrity verification")]
    IntegrityError(usize),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("URL parse error: {0}")]
    UrlParseError(String),
}

impl From<url::ParseError> for BittorrentError {
    fn from(err: url::ParseError) -> Self {
        BittorrentError::UrlParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
