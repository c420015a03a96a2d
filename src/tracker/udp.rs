use super::{AnnounceRequest, AnnounceResponse};
use crate::error::{BittorrentError, Result};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

/// Magic connection ID of the connect request
pub const PROTOCOL_ID: u64 = 0x41727101980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;

const CONNECT_REPLY_LEN: usize = 16;
const MAX_DATAGRAM: usize = 4096;

/// Connect request: protocol ID, action, transaction ID.
pub fn build_connect_request(transaction_id: u32) -> [u8; 16] {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);

    let mut packet = [0u8; 16];
    packet.copy_from_slice(&buf);
    packet
}

/// Extract the assigned connection ID from a connect reply.
pub fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64> {
    if buf.len() < CONNECT_REPLY_LEN {
        return Err(BittorrentError::TrackerError(format!(
            "Connect reply too short: {} bytes",
            buf.len()
        )));
    }

    let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let reply_transaction = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if action != ACTION_CONNECT || reply_transaction != transaction_id {
        return Err(BittorrentError::TrackerError(format!(
            "Unexpected connect reply (action {}, transaction {:#x})",
            action, reply_transaction
        )));
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[8..16]);
    Ok(u64::from_be_bytes(id))
}

/// A UDP tracker session: one socket, one connection ID.
pub struct UdpTracker {
    host: String,
    socket: UdpSocket,
    read_timeout: Duration,
    connection_id: u64,
}

impl UdpTracker {
    /// Resolve `host` (an IPv4 `host:port`), open a socket and perform the
    /// connect handshake.
    pub async fn connect(host: &str, read_timeout: Duration) -> Result<Self> {
        let addr = lookup_host(host)
            .await
            .map_err(|e| BittorrentError::TrackerError(format!("Cannot resolve {}: {}", host, e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| BittorrentError::TrackerError(format!("No IPv4 address for {}", host)))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        info!("Handshaking UDP tracker {} ({})", host, addr);

        let mut tracker = Self {
            host: host.to_string(),
            socket,
            read_timeout,
            connection_id: PROTOCOL_ID,
        };

        let transaction_id = rand::random();
        let reply = tracker
            .round_trip(&build_connect_request(transaction_id))
            .await?;
        tracker.connection_id = parse_connect_response(&reply, transaction_id)?;
        debug!("{} assigned connection id {:#x}", host, tracker.connection_id);

        Ok(tracker)
    }

    /// Announce and collect the returned peers.
    pub async fn announce(
        &self,
        request: &AnnounceRequest,
        request_path: &str,
    ) -> Result<AnnounceResponse> {
        let transaction_id = rand::random();
        let packet = request.to_udp_packet(self.connection_id, transaction_id, request_path);

        let reply = self.round_trip(&packet).await?;
        let response = AnnounceResponse::from_udp(&reply, transaction_id)?;

        info!(
            "Tracker {} answered with {} peers ({} seeders, {} leechers)",
            self.host,
            response.peers.len(),
            response.seeders.unwrap_or(0),
            response.leechers.unwrap_or(0)
        );
        Ok(response)
    }

    async fn round_trip(&self, packet: &[u8]) -> Result<Vec<u8>> {
        self.socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = timeout(self.read_timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| {
                BittorrentError::TrackerError(format!(
                    "{} did not answer within {:?}",
                    self.host, self.read_timeout
                ))
            })??;

        buf.truncate(n);
        Ok(buf)
    }
}
