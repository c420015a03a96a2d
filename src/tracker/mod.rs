mod client;
mod http;
mod peer;
mod request;
mod response;
mod udp;

pub use client::TrackerClient;
pub use peer::{parse_compact_peer, parse_compact_peers, PeerCandidate, PeerStatus};
pub use request::{AnnounceEvent, AnnounceRequest, NUM_WANT};
pub use response::AnnounceResponse;
pub use udp::UdpTracker;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Generate a random peer ID
/// Format: -TF0100-<12 random alphanumerics>
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-TF0100-");

    let rng = rand::thread_rng();
    for (byte, random) in peer_id[8..].iter_mut().zip(rng.sample_iter(Alphanumeric)) {
        *byte = random;
    }

    peer_id
}
