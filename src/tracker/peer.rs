use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, warn};

/// Where a candidate peer stands after the connection attempts so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Not tried yet
    New,
    /// Dial or handshake failed; may be retried
    Down,
    /// Handshake answered for another torrent
    NoInfoHash,
    /// Connected but had nothing left that we needed
    NoPieces,
}

impl PeerStatus {
    /// Whether a worker may still dial this peer.
    pub fn is_connectable(self) -> bool {
        matches!(self, PeerStatus::New | PeerStatus::Down)
    }
}

/// A peer address learned from a tracker (or the local-test setting)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub status: PeerStatus,
    /// Failed dial/handshake attempts so far
    pub connect_attempts: u32,
}

impl PeerCandidate {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            status: PeerStatus::New,
            connect_attempts: 0,
        }
    }

    /// Move to `next`. `NoInfoHash` and `NoPieces` are final.
    pub fn set_status(&mut self, next: PeerStatus) -> bool {
        if !self.status.is_connectable() {
            warn!(
                "Peer {} is {:?}, refusing transition to {:?}",
                self.addr, self.status, next
            );
            return false;
        }

        debug!("Peer {}: {:?} -> {:?}", self.addr, self.status, next);
        self.status = next;
        true
    }

    /// Record a failed connection attempt.
    pub fn mark_down(&mut self) {
        if self.set_status(PeerStatus::Down) {
            self.connect_attempts += 1;
        }
    }
}

/// Parse a peer from compact format (4 IP + 2 port bytes).
pub fn parse_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    let [a, b, c, d, hi, lo] = <[u8; 6]>::try_from(data).ok()?;
    let ip = Ipv4Addr::new(a, b, c, d);
    Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([hi, lo])))
}

/// Parse consecutive compact entries; a trailing partial entry is ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .filter_map(parse_compact_peer)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let data = [127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x64, 0xab, 9, 9];
        let peers = parse_compact_peers(&data);

        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:25771".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_status_transitions() {
        let mut peer = PeerCandidate::new("10.0.0.1:1".parse().unwrap());
        assert!(peer.status.is_connectable());

        peer.mark_down();
        assert_eq!(peer.status, PeerStatus::Down);
        assert_eq!(peer.connect_attempts, 1);
        assert!(peer.status.is_connectable());

        assert!(peer.set_status(PeerStatus::NoPieces));
        assert!(!peer.set_status(PeerStatus::New));
        peer.mark_down();
        assert_eq!(peer.status, PeerStatus::NoPieces);
        assert_eq!(peer.connect_attempts, 1);
    }
}
