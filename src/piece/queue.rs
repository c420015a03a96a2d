use super::PieceDescriptor;
use crate::peer::Bitfield;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Pool of pieces still to download, shared by every peer session.
///
/// The lock is held only while scanning or mutating the pool, never across
/// network I/O.
#[derive(Debug)]
pub struct PieceQueue {
    pieces: Mutex<Vec<PieceDescriptor>>,
}

impl PieceQueue {
    pub fn new(pieces: Vec<PieceDescriptor>) -> Self {
        Self {
            pieces: Mutex::new(pieces),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PieceDescriptor>> {
        self.pieces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out the first remaining piece the peer has.
    ///
    /// The piece is removed unless it is the only one left: the last piece
    /// stays available so other sessions can fetch it too and a single slow
    /// peer cannot hold up completion.
    pub fn take_matching(&self, availability: &Bitfield) -> Option<PieceDescriptor> {
        let mut pieces = self.lock();
        let index = pieces.iter().position(|p| availability.has(p.order))?;

        if pieces.len() > 1 {
            Some(pieces.swap_remove(index))
        } else {
            debug!("Handing out last piece {} without removal", pieces[index].order);
            Some(pieces[index])
        }
    }

    /// Put a piece back after a failed or abandoned download.
    pub fn give_back(&self, piece: PieceDescriptor) {
        let mut pieces = self.lock();
        if pieces.iter().any(|p| p.order == piece.order) {
            return;
        }
        pieces.push(piece);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn orders(&self) -> Vec<usize> {
        self.lock().iter().map(|p| p.order).collect()
    }
}
