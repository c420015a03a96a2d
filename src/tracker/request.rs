use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

/// Peers requested per announce
pub const NUM_WANT: i32 = 200;

/// Events sent to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Completed,
    Started,
    Stopped,
}

impl AnnounceEvent {
    /// Event code in the UDP announce packet
    pub fn udp_code(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }

    /// `event` query value for HTTP trackers
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }
}

/// Parameters of one announce, independent of tracker transport
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Port announced as the one we listen on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes left to download
    pub left: u64,
    pub event: AnnounceEvent,
    /// Random per-client key
    pub key: u32,
    pub num_want: i32,
}

impl AnnounceRequest {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: AnnounceEvent::Completed,
            key: rand::random(),
            num_want: NUM_WANT,
        }
    }

    /// UDP announce packet (BEP 15), followed by a URL-data option (BEP 41)
    /// carrying `request_path` when it is non-empty and fits in 255 bytes.
    pub fn to_udp_packet(&self, connection_id: u64, transaction_id: u32, request_path: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(98 + 2 + request_path.len());
        buf.put_u64(connection_id);
        buf.put_u32(super::udp::ACTION_ANNOUNCE);
        buf.put_u32(transaction_id);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.put_u64(self.downloaded);
        buf.put_u64(self.left);
        buf.put_u64(self.uploaded);
        buf.put_u32(self.event.udp_code());
        buf.put_u32(0); // IP: let the tracker use the packet's source
        buf.put_u32(self.key);
        buf.put_i32(self.num_want);
        buf.put_u16(self.port);

        let path = request_path.as_bytes();
        if !path.is_empty() && path.len() <= u8::MAX as usize {
            buf.put_u8(OPTION_URL_DATA);
            buf.put_u8(path.len() as u8);
            buf.put_slice(path);
        }

        buf.freeze()
    }

    /// Query parameters for HTTP trackers other than the two binary ones.
    pub fn http_query(&self) -> HttpAnnounceQuery {
        HttpAnnounceQuery {
            port: self.port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.left,
            compact: 1,
            numwant: self.num_want,
            key: format!("{:08x}", self.key),
            event: self.event.as_str(),
        }
    }
}

const OPTION_URL_DATA: u8 = 2;

#[derive(Debug, Serialize)]
pub struct HttpAnnounceQuery {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    numwant: i32,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
}

/// Percent-encode raw bytes for `info_hash` / `peer_id`.
pub fn url_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("%{:02X}", b)).collect()
}
