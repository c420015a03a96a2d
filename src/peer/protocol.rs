use crate::error::{BittorrentError, Result};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Reserved bytes are always sent as zero: no extensions are offered.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_bytes(0, 8);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(BittorrentError::ConnectionError(format!(
                "Handshake too short: {} bytes",
                data.len()
            )));
        }

        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(BittorrentError::ConnectionError(
                "Peer does not speak the BitTorrent protocol".to_string(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}

/// Send our handshake and validate the peer's reply.
///
/// A reply for another torrent yields `InfoHashMismatch` and nothing more is
/// written to the stream.
pub async fn exchange_handshake<S>(
    stream: &mut S,
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io_failure = |e: std::io::Error| {
        BittorrentError::ConnectionError(format!("Handshake with {} failed: {}", addr, e))
    };

    stream
        .write_all(&Handshake::new(info_hash, our_peer_id).to_bytes())
        .await
        .map_err(io_failure)?;
    debug!("Sent handshake to {}", addr);

    let mut reply = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut reply).await.map_err(io_failure)?;

    let handshake = Handshake::from_bytes(&reply)?;
    if handshake.info_hash != info_hash {
        return Err(BittorrentError::InfoHashMismatch(addr));
    }

    Ok(handshake)
}
