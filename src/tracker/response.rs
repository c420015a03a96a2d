use super::parse_compact_peers;
use super::udp::{ACTION_ANNOUNCE, ACTION_ERROR};
use crate::bencode::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::net::{IpAddr, SocketAddr};

/// UDP announce reply header: action, transaction, interval, leechers, seeders
pub const UDP_ANNOUNCE_HEADER_LEN: usize = 20;

/// Response from a tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds to wait before re-announcing
    pub interval: u32,
    pub leechers: Option<u32>,
    pub seeders: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl AnnounceResponse {
    /// Parse a UDP announce reply for `transaction_id`.
    pub fn from_udp(buf: &[u8], transaction_id: u32) -> Result<Self> {
        if buf.len() >= 8 && be_u32(buf, 0) == ACTION_ERROR {
            return Err(BittorrentError::TrackerError(format!(
                "Tracker refused announce: {}",
                String::from_utf8_lossy(&buf[8..])
            )));
        }

        if buf.len() < UDP_ANNOUNCE_HEADER_LEN {
            return Err(BittorrentError::TrackerError(format!(
                "Announce reply too short: {} bytes",
                buf.len()
            )));
        }

        let action = be_u32(buf, 0);
        let reply_transaction = be_u32(buf, 4);
        if action != ACTION_ANNOUNCE || reply_transaction != transaction_id {
            return Err(BittorrentError::TrackerError(format!(
                "Unexpected announce reply (action {}, transaction {:#x})",
                action, reply_transaction
            )));
        }

        Ok(Self {
            interval: be_u32(buf, 8),
            leechers: Some(be_u32(buf, 12)),
            seeders: Some(be_u32(buf, 16)),
            peers: parse_compact_peers(&buf[UDP_ANNOUNCE_HEADER_LEN..]),
        })
    }

    /// Parse a bencoded HTTP tracker reply.
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(BittorrentError::TrackerError(
                "Response must be a dict".to_string(),
            ));
        }

        if let Some(failure) = value.get_bytes("failure reason") {
            return Err(BittorrentError::TrackerError(String::from_utf8(
                failure.to_vec(),
            )?));
        }

        let interval = value
            .get_int("interval")
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| BittorrentError::TrackerError("Missing 'interval' field".to_string()))?;

        let count = |key: &str| value.get_int(key).and_then(|i| u32::try_from(i).ok());

        let peers = match value.get("peers") {
            Some(BencodeValue::String(compact)) => parse_compact_peers(compact),
            Some(BencodeValue::List(list)) => parse_peer_list(list)?,
            Some(_) => {
                return Err(BittorrentError::TrackerError(
                    "Invalid 'peers' format".to_string(),
                ))
            }
            None => {
                return Err(BittorrentError::TrackerError(
                    "Missing 'peers' field".to_string(),
                ))
            }
        };

        Ok(Self {
            interval,
            leechers: count("incomplete"),
            seeders: count("complete"),
            peers,
        })
    }
}

/// Dictionary model: a list of `{ip, port, peer id}` dicts
fn parse_peer_list(list: &[BencodeValue]) -> Result<Vec<SocketAddr>> {
    list.iter()
        .map(|entry| {
            let ip: IpAddr = entry
                .get_str("ip")
                .ok_or_else(|| BittorrentError::TrackerError("Missing peer 'ip'".to_string()))?
                .parse()
                .map_err(|_| BittorrentError::TrackerError("Invalid peer IP address".to_string()))?;

            let port = entry
                .get_int("port")
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| BittorrentError::TrackerError("Invalid peer 'port'".to_string()))?;

            Ok(SocketAddr::new(ip, port))
        })
        .collect()
}
