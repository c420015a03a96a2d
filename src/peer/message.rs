use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Messages of the peer wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { block: BlockInfo },
    Piece {
        piece_index: u32,
        offset: u32,
        data: Bytes,
    },
    Cancel { block: BlockInfo },
    /// DHT port announcement; parsed but unused
    Port { port: u16 },
    /// Extension protocol message; parsed but unused
    Extended { id: u8, payload: Bytes },
    /// Any other message ID, skipped by the session
    Unknown { id: u8 },
}

fn header(buf: &mut BytesMut, id: u8, payload_len: usize) {
    buf.reserve(5 + payload_len);
    buf.put_u32(1 + payload_len as u32);
    buf.put_u8(id);
}

impl PeerMessage {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const EXTENDED: u8 = 20;

    /// Serialize with the 4-byte length prefix.
    /// Format: <length prefix><message ID><payload>
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::KeepAlive => buf.put_u32(0),
            PeerMessage::Choke => header(&mut buf, Self::CHOKE, 0),
            PeerMessage::Unchoke => header(&mut buf, Self::UNCHOKE, 0),
            PeerMessage::Interested => header(&mut buf, Self::INTERESTED, 0),
            PeerMessage::NotInterested => header(&mut buf, Self::NOT_INTERESTED, 0),
            PeerMessage::Have { piece_index } => {
                header(&mut buf, Self::HAVE, 4);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                header(&mut buf, Self::BITFIELD, bitfield.len());
                buf.put_slice(bitfield);
            }
            PeerMessage::Request { block } | PeerMessage::Cancel { block } => {
                let id = if matches!(self, PeerMessage::Request { .. }) {
                    Self::REQUEST
                } else {
                    Self::CANCEL
                };
                header(&mut buf, id, 12);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u32(block.length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                header(&mut buf, Self::PIECE, 8 + data.len());
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Port { port } => {
                header(&mut buf, Self::PORT, 2);
                buf.put_u16(*port);
            }
            PeerMessage::Extended { id, payload } => {
                header(&mut buf, Self::EXTENDED, 1 + payload.len());
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            PeerMessage::Unknown { id } => header(&mut buf, *id, 0),
        }

        buf.freeze()
    }

    /// Decode a frame body (message ID and payload, length prefix already
    /// stripped). An empty body is a keep-alive.
    pub fn from_frame(mut frame: Bytes) -> Result<Self> {
        if frame.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = frame.get_u8();
        let expect = |len: usize, frame: &Bytes| {
            if frame.len() == len {
                Ok(())
            } else {
                Err(BittorrentError::ProtocolError(format!(
                    "Message {} has {} payload bytes, expected {}",
                    id,
                    frame.len(),
                    len
                )))
            }
        };

        let message = match id {
            Self::CHOKE => PeerMessage::Choke,
            Self::UNCHOKE => PeerMessage::Unchoke,
            Self::INTERESTED => PeerMessage::Interested,
            Self::NOT_INTERESTED => PeerMessage::NotInterested,
            Self::HAVE => {
                expect(4, &frame)?;
                PeerMessage::Have {
                    piece_index: frame.get_u32(),
                }
            }
            Self::BITFIELD => PeerMessage::Bitfield { bitfield: frame },
            Self::REQUEST | Self::CANCEL => {
                expect(12, &frame)?;
                let block = BlockInfo::new(frame.get_u32(), frame.get_u32(), frame.get_u32());
                if id == Self::REQUEST {
                    PeerMessage::Request { block }
                } else {
                    PeerMessage::Cancel { block }
                }
            }
            Self::PIECE => {
                if frame.len() < 8 {
                    return Err(BittorrentError::ProtocolError(
                        "Piece message shorter than its header".to_string(),
                    ));
                }
                let piece_index = frame.get_u32();
                let offset = frame.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: frame,
                }
            }
            Self::PORT => {
                expect(2, &frame)?;
                PeerMessage::Port {
                    port: frame.get_u16(),
                }
            }
            Self::EXTENDED => {
                if frame.is_empty() {
                    return Err(BittorrentError::ProtocolError(
                        "Empty extended message".to_string(),
                    ));
                }
                let ext_id = frame.get_u8();
                PeerMessage::Extended {
                    id: ext_id,
                    payload: frame,
                }
            }
            id => PeerMessage::Unknown { id },
        };

        Ok(message)
    }
}
