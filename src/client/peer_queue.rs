use crate::tracker::PeerCandidate;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

/// Work pool of peer candidates shared by every worker.
///
/// Addresses are deduplicated on first insertion; requeued candidates skip
/// that check.
pub struct PeerQueue {
    sender: mpsc::UnboundedSender<PeerCandidate>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<PeerCandidate>>,
    known: Mutex<HashSet<SocketAddr>>,
}

impl PeerQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: AsyncMutex::new(receiver),
            known: Mutex::new(HashSet::new()),
        }
    }

    /// Queue a newly discovered address. Returns false if it was already known.
    pub fn push_new(&self, addr: SocketAddr) -> bool {
        let inserted = self
            .known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr);
        if inserted {
            debug!("New peer candidate {}", addr);
            self.requeue(PeerCandidate::new(addr));
        }
        inserted
    }

    /// Put a candidate back for another attempt.
    pub fn requeue(&self, candidate: PeerCandidate) {
        // The receiver lives as long as `self`, so this cannot fail.
        let _ = self.sender.send(candidate);
    }

    /// Wait for the next candidate.
    pub async fn next(&self) -> Option<PeerCandidate> {
        self.receiver.lock().await.recv().await
    }

    /// Distinct addresses seen so far.
    pub fn known(&self) -> usize {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for PeerQueue {
    fn default() -> Self {
        Self::new()
    }
}
