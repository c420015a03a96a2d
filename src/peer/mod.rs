mod bitfield;
mod message;
mod protocol;
mod reader;
mod session;

pub use bitfield::Bitfield;
pub use message::{BlockInfo, PeerMessage};
pub use protocol::{exchange_handshake, Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use reader::{read_message, MessageReader, MAX_MESSAGE_LEN};
pub use session::{PeerSession, SessionContext, SessionEnd, SessionPhase};
