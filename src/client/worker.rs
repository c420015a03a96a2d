use super::peer_queue::PeerQueue;
use crate::error::BittorrentError;
use crate::peer::{PeerSession, SessionContext, SessionEnd};
use crate::tracker::{PeerCandidate, PeerStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pulls peer candidates off the shared queue and runs one session at a time.
pub struct Worker {
    id: usize,
    peers: Arc<PeerQueue>,
    ctx: Arc<SessionContext>,
    shutdown: watch::Receiver<bool>,
    dial_timeout: Duration,
    max_connect_attempts: u32,
}

impl Worker {
    pub fn new(
        id: usize,
        peers: Arc<PeerQueue>,
        ctx: Arc<SessionContext>,
        shutdown: watch::Receiver<bool>,
        dial_timeout: Duration,
        max_connect_attempts: u32,
    ) -> Self {
        Self {
            id,
            peers,
            ctx,
            shutdown,
            dial_timeout,
            max_connect_attempts,
        }
    }

    pub async fn run(mut self) {
        debug!("Worker {} started", self.id);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let candidate = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                candidate = self.peers.next() => match candidate {
                    Some(candidate) => candidate,
                    None => break,
                },
            };

            self.serve(candidate).await;
        }

        debug!("Worker {} stopped", self.id);
    }

    async fn serve(&mut self, mut candidate: PeerCandidate) {
        if !candidate.status.is_connectable() {
            debug!(
                "Worker {} skipping {} ({:?})",
                self.id, candidate.addr, candidate.status
            );
            return;
        }

        let connected = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return,
            connected = PeerSession::connect(candidate.addr, self.ctx.clone(), self.dial_timeout) => connected,
        };

        let (mut session, reader) = match connected {
            Ok(pair) => pair,
            Err(BittorrentError::InfoHashMismatch(addr)) => {
                warn!("Peer {} answered with a different info hash", addr);
                candidate.set_status(PeerStatus::NoInfoHash);
                return;
            }
            Err(e) => {
                warn!("Could not connect to {}: {}", candidate.addr, e);
                candidate.mark_down();
                if candidate.connect_attempts < self.max_connect_attempts {
                    debug!(
                        "Requeueing {} after {} failed attempts",
                        candidate.addr, candidate.connect_attempts
                    );
                    self.peers.requeue(candidate);
                }
                return;
            }
        };

        match session.run(reader, self.shutdown.clone()).await {
            Ok(SessionEnd::NoUsefulPieces) => {
                candidate.set_status(PeerStatus::NoPieces);
            }
            Ok(SessionEnd::Shutdown) => {}
            Err(BittorrentError::Cancelled) => {}
            Err(e) => warn!("Session with {} ended: {}", candidate.addr, e),
        }

        info!(
            "Worker {} done with {} after {} pieces",
            self.id,
            candidate.addr,
            session.completed()
        );
    }
}
