use super::{exchange_handshake, Bitfield, BlockInfo, MessageReader, PeerMessage};
use crate::error::{BittorrentError, Result};
use crate::piece::{PieceDescriptor, PieceQueue, PieceResult, BLOCK_SIZE, PIPELINE_DEPTH};
use crate::torrent::TorrentDescriptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Download-wide state every session works against
pub struct SessionContext {
    pub torrent: Arc<TorrentDescriptor>,
    pub peer_id: [u8; 20],
    pub pieces: Arc<PieceQueue>,
    pub results: mpsc::Sender<PieceResult>,
}

/// Protocol phase of a connected session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingBitfield,
    BitfieldReceived,
    /// Unchoked with a known bitfield; about to take a piece
    Ready,
    Downloading,
}

/// How a session that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The queue holds nothing this peer can serve
    NoUsefulPieces,
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Done(SessionEnd),
}

/// The piece currently being assembled
struct InFlight {
    piece: PieceDescriptor,
    size: u32,
    data: Vec<u8>,
    requested: u32,
    received: u32,
}

impl InFlight {
    fn new(piece: PieceDescriptor, size: u32) -> Self {
        Self {
            piece,
            size,
            data: vec![0u8; size as usize],
            requested: 0,
            received: 0,
        }
    }

    fn next_block(&mut self) -> Option<BlockInfo> {
        if self.requested >= self.size {
            return None;
        }
        let length = BLOCK_SIZE.min(self.size - self.requested);
        let block = BlockInfo::new(self.piece.order as u32, self.requested, length);
        self.requested += length;
        Some(block)
    }

    fn outstanding_blocks(&self) -> u32 {
        (self.requested - self.received.min(self.requested)).div_ceil(BLOCK_SIZE)
    }

    fn store(&mut self, offset: u32, block: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + block.len();
        if end > self.data.len() {
            return Err(BittorrentError::ProtocolError(format!(
                "Block {}..{} outside piece {} of {} bytes",
                start, end, self.piece.order, self.size
            )));
        }

        self.data[start..end].copy_from_slice(block);
        self.received += block.len() as u32;
        if self.received > self.size {
            return Err(BittorrentError::ProtocolError(format!(
                "Received {} bytes for piece {} of {} bytes",
                self.received, self.piece.order, self.size
            )));
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.received == self.size
    }
}

/// One connection to one peer, after a successful handshake.
///
/// The session owns the write half; a [`MessageReader`] task owns the read
/// half and feeds decoded messages in. At most one piece is in flight.
pub struct PeerSession<W> {
    addr: SocketAddr,
    writer: W,
    ctx: Arc<SessionContext>,
    phase: SessionPhase,
    choked: bool,
    messages_seen: usize,
    availability: Bitfield,
    in_flight: Option<InFlight>,
    completed: usize,
}

impl PeerSession<OwnedWriteHalf> {
    /// Dial `addr`, exchange handshakes and start the reader task.
    pub async fn connect(
        addr: SocketAddr,
        ctx: Arc<SessionContext>,
        dial_timeout: Duration,
    ) -> Result<(Self, MessageReader)> {
        info!("Trying to connect {}...", addr);

        let mut stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BittorrentError::ConnectionError(format!("Timed out dialing {}", addr)))?
            .map_err(|e| {
                BittorrentError::ConnectionError(format!("Failed to connect to {}: {}", addr, e))
            })?;

        let handshake =
            exchange_handshake(&mut stream, addr, ctx.torrent.info_hash, ctx.peer_id).await?;
        info!(
            "Handshake received from {} (peer id {})",
            addr,
            hex::encode(handshake.peer_id)
        );

        let (read_half, write_half) = stream.into_split();
        let reader = MessageReader::spawn(read_half, addr);

        Ok((Self::new(addr, write_half, ctx), reader))
    }
}

impl<W: AsyncWrite + Unpin> PeerSession<W> {
    pub fn new(addr: SocketAddr, writer: W, ctx: Arc<SessionContext>) -> Self {
        let num_pieces = ctx.torrent.num_pieces();
        Self {
            addr,
            writer,
            ctx,
            phase: SessionPhase::AwaitingBitfield,
            choked: true,
            messages_seen: 0,
            availability: Bitfield::new(num_pieces),
            in_flight: None,
            completed: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Number of pieces this session verified and delivered.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Drive the session until it ends, returning any in-flight piece to
    /// the queue on the way out.
    pub async fn run(
        &mut self,
        mut reader: MessageReader,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let result = self.drive(&mut reader, &mut shutdown).await;
        self.abandon_piece();
        result
    }

    async fn drive(
        &mut self,
        reader: &mut MessageReader,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
                Some(message) = reader.messages.recv() => {
                    if let Flow::Done(end) = self.handle(message).await? {
                        return Ok(end);
                    }
                }
                failure = &mut reader.failure => {
                    return Err(failure.unwrap_or_else(|_| {
                        BittorrentError::ConnectionError(format!("Reader for {} exited", self.addr))
                    }));
                }
            }
        }
    }

    async fn handle(&mut self, message: PeerMessage) -> Result<Flow> {
        self.dispatch(message).await?;
        self.messages_seen += 1;

        match self.phase {
            SessionPhase::Ready => self.start_next_piece().await,
            SessionPhase::Downloading
                if self.in_flight.as_ref().is_some_and(InFlight::is_complete) =>
            {
                self.finish_piece().await
            }
            _ => Ok(Flow::Continue),
        }
    }

    async fn dispatch(&mut self, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::Choke => {
                info!("({}) CHOKE", self.addr);
                self.choked = true;
            }
            PeerMessage::Unchoke => {
                info!("({}) UNCHOKE", self.addr);
                self.choked = false;
                match self.phase {
                    SessionPhase::BitfieldReceived => self.transition(SessionPhase::Ready),
                    SessionPhase::Downloading => self.fill_pipeline().await?,
                    _ => {}
                }
            }
            PeerMessage::Have { piece_index } => {
                debug!("({}) HAVE {}", self.addr, piece_index);
                if !self.availability.set(piece_index as usize) {
                    warn!("({}) HAVE for unknown piece {}", self.addr, piece_index);
                }
            }
            PeerMessage::Bitfield { bitfield } => {
                info!("({}) BITFIELD", self.addr);
                if self.messages_seen > 0 {
                    return Err(BittorrentError::ProtocolError(format!(
                        "{} sent BITFIELD after {} other messages",
                        self.addr, self.messages_seen
                    )));
                }

                self.availability = Bitfield::from_packed(&bitfield, self.ctx.torrent.num_pieces());
                debug!(
                    "({}) has {} of {} pieces",
                    self.addr,
                    self.availability.count(),
                    self.availability.len()
                );
                self.transition(SessionPhase::BitfieldReceived);

                if self.choked {
                    debug!("({}) Sending UNCHOKE and INTERESTED", self.addr);
                    self.send(PeerMessage::Unchoke).await?;
                    self.send(PeerMessage::Interested).await?;
                } else {
                    // Already unchoked: no UNCHOKE will come to move us on.
                    self.send(PeerMessage::Interested).await?;
                    self.transition(SessionPhase::Ready);
                }
            }
            PeerMessage::Interested => info!("({}) INTERESTED", self.addr),
            PeerMessage::NotInterested => info!("({}) NOT INTERESTED", self.addr),
            PeerMessage::Piece { offset, data, .. } => {
                let Some(in_flight) = self.in_flight.as_mut() else {
                    debug!("({}) block at {} with no piece in flight", self.addr, offset);
                    return Ok(());
                };
                in_flight.store(offset, &data)?;

                if !self.choked {
                    self.request_next_block().await?;
                }
            }
            PeerMessage::Request { block } | PeerMessage::Cancel { block } => {
                debug!("({}) ignoring request for piece {}", self.addr, block.piece_index);
            }
            PeerMessage::KeepAlive => {}
            other => debug!("({}) Undefined or unexpected message {:?}", self.addr, other),
        }

        Ok(())
    }

    /// Take a matching piece from the queue and start requesting it.
    async fn start_next_piece(&mut self) -> Result<Flow> {
        let Some(piece) = self.ctx.pieces.take_matching(&self.availability) else {
            info!("({}) This peer doesn't have any useful piece", self.addr);
            return Ok(Flow::Done(SessionEnd::NoUsefulPieces));
        };

        let size = self.ctx.torrent.piece_size(piece.order) as u32;
        info!("({}) current PIECE {} - size: {}", self.addr, piece.order, size);

        self.in_flight = Some(InFlight::new(piece, size));
        self.transition(SessionPhase::Downloading);
        self.fill_pipeline().await?;

        Ok(Flow::Continue)
    }

    async fn finish_piece(&mut self) -> Result<Flow> {
        let Some(InFlight { piece, data, .. }) = self.in_flight.take() else {
            return Ok(Flow::Continue);
        };

        if !piece.hash.matches(&data) {
            warn!("({}) Piece {} failed SHA-1 check", self.addr, piece.order);
            self.ctx.pieces.give_back(piece);
            return Err(BittorrentError::IntegrityError(piece.order));
        }

        info!("({}) Piece {} - valid SHA-1", self.addr, piece.order);
        self.ctx
            .results
            .send(PieceResult {
                data,
                order: piece.order,
            })
            .await
            .map_err(|_| BittorrentError::Cancelled)?;
        self.completed += 1;

        self.transition(SessionPhase::Ready);
        self.start_next_piece().await
    }

    /// Keep up to `PIPELINE_DEPTH` block requests outstanding.
    async fn fill_pipeline(&mut self) -> Result<()> {
        if self.choked {
            return Ok(());
        }

        while self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.outstanding_blocks() < PIPELINE_DEPTH as u32)
        {
            if !self.request_next_block().await? {
                break;
            }
        }

        Ok(())
    }

    async fn request_next_block(&mut self) -> Result<bool> {
        let Some(block) = self.in_flight.as_mut().and_then(InFlight::next_block) else {
            return Ok(false);
        };
        self.send(PeerMessage::Request { block }).await?;
        Ok(true)
    }

    fn abandon_piece(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            warn!(
                "({}) Returning unfinished piece {} to the queue",
                self.addr, in_flight.piece.order
            );
            self.ctx.pieces.give_back(in_flight.piece);
        }
    }

    fn transition(&mut self, next: SessionPhase) {
        debug!("({}) {:?} -> {:?}", self.addr, self.phase, next);
        self.phase = next;
    }

    async fn send(&mut self, message: PeerMessage) -> Result<()> {
        self.writer
            .write_all(&message.to_bytes())
            .await
            .map_err(|e| BittorrentError::ConnectionError(format!("Write to {} failed: {}", self.addr, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{FileInfo, PieceHash, Pieces};
    use bytes::Bytes;
    use tokio_test::io::Builder;

    const PIECE_LENGTH: u64 = 2 * BLOCK_SIZE as u64;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn torrent(data: &[u8], corrupt: bool) -> TorrentDescriptor {
        torrent_with(data, PIECE_LENGTH, corrupt)
    }

    fn torrent_with(data: &[u8], piece_length: u64, corrupt: bool) -> TorrentDescriptor {
        let pieces: Pieces = data
            .chunks(piece_length as usize)
            .map(|chunk| {
                if corrupt {
                    PieceHash::new([0xEE; 20])
                } else {
                    PieceHash::of(chunk)
                }
            })
            .collect();

        TorrentDescriptor::new(
            "test.bin".to_string(),
            [3u8; 20],
            pieces,
            piece_length,
            vec![FileInfo::new(["test.bin"], data.len() as u64)],
            Vec::new(),
        )
        .unwrap()
    }

    fn session(
        torrent: TorrentDescriptor,
    ) -> (PeerSession<Vec<u8>>, mpsc::Receiver<PieceResult>, Arc<PieceQueue>) {
        let torrent = Arc::new(torrent);
        let pieces = Arc::new(PieceQueue::new(PieceDescriptor::all(&torrent)));
        let (results, results_rx) = mpsc::channel(8);
        let ctx = Arc::new(SessionContext {
            torrent,
            peer_id: [1u8; 20],
            pieces: Arc::clone(&pieces),
            results,
        });
        let addr = "127.0.0.1:6881".parse().unwrap();
        (PeerSession::new(addr, Vec::new(), ctx), results_rx, pieces)
    }

    fn requests(written: &[u8]) -> Vec<BlockInfo> {
        written
            .chunks(17)
            .filter(|frame| frame.len() == 17 && frame[4] == PeerMessage::REQUEST)
            .map(|frame| match PeerMessage::from_frame(Bytes::copy_from_slice(&frame[4..])) {
                Ok(PeerMessage::Request { block }) => block,
                other => panic!("not a request: {:?}", other),
            })
            .collect()
    }

    fn all_pieces(n: usize) -> PeerMessage {
        let mut field = Bitfield::new(n);
        (0..n).for_each(|i| {
            field.set(i);
        });
        PeerMessage::Bitfield {
            bitfield: field.to_packed().into(),
        }
    }

    fn block(data: &[u8], piece: usize, offset: usize, len: usize) -> PeerMessage {
        let start = piece * PIECE_LENGTH as usize + offset;
        PeerMessage::Piece {
            piece_index: piece as u32,
            offset: offset as u32,
            data: Bytes::copy_from_slice(&data[start..start + len]),
        }
    }

    #[tokio::test]
    async fn test_bitfield_while_choked_sends_unchoke_and_interested() {
        let (mut session, _, _) = session(torrent(&content(40_000), false));

        assert_eq!(session.handle(all_pieces(2)).await.unwrap(), Flow::Continue);
        assert_eq!(session.phase(), SessionPhase::BitfieldReceived);
        assert_eq!(session.writer, vec![0, 0, 0, 1, 1, 0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_bitfield_must_be_first_message() {
        let (mut session, _, _) = session(torrent(&content(40_000), false));

        session.handle(PeerMessage::Have { piece_index: 0 }).await.unwrap();
        let result = session.handle(all_pieces(2)).await;
        assert!(matches!(result, Err(BittorrentError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_unchoke_starts_pipelined_download() {
        let (mut session, _, queue) = session(torrent(&content(40_000), false));

        session.handle(all_pieces(2)).await.unwrap();
        session.writer.clear();
        session.handle(PeerMessage::Unchoke).await.unwrap();

        assert_eq!(session.phase(), SessionPhase::Downloading);
        assert_eq!(
            requests(&session.writer),
            vec![BlockInfo::new(0, 0, BLOCK_SIZE), BlockInfo::new(0, BLOCK_SIZE, BLOCK_SIZE)]
        );
        assert_eq!(queue.orders(), vec![1]);
    }

    #[tokio::test]
    async fn test_verified_piece_is_delivered_then_next_taken() {
        let data = content(40_000);
        let (mut session, mut results, queue) = session(torrent(&data, false));

        session.handle(all_pieces(2)).await.unwrap();
        session.handle(PeerMessage::Unchoke).await.unwrap();
        session.writer.clear();

        let block_len = BLOCK_SIZE as usize;
        session.handle(block(&data, 0, 0, block_len)).await.unwrap();
        assert!(results.try_recv().is_err());
        session.handle(block(&data, 0, block_len, block_len)).await.unwrap();

        let result = results.try_recv().unwrap();
        assert_eq!(result.order, 0);
        assert_eq!(result.data, &data[..PIECE_LENGTH as usize]);

        // The last piece is clipped to the torrent length and stays queued.
        assert_eq!(session.phase(), SessionPhase::Downloading);
        assert_eq!(requests(&session.writer), vec![BlockInfo::new(1, 0, 40_000 - 32_768)]);
        assert_eq!(queue.orders(), vec![1]);

        session.handle(block(&data, 1, 0, 40_000 - 32_768)).await.unwrap();
        assert_eq!(results.try_recv().unwrap().order, 1);
        assert_eq!(session.completed(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_returned_and_session_ends() {
        let data = content(40_000);
        let (mut session, mut results, queue) = session(torrent(&data, true));

        session.handle(all_pieces(2)).await.unwrap();
        session.handle(PeerMessage::Unchoke).await.unwrap();
        session.handle(block(&data, 0, 0, BLOCK_SIZE as usize)).await.unwrap();
        let result = session
            .handle(block(&data, 0, BLOCK_SIZE as usize, BLOCK_SIZE as usize))
            .await;

        assert!(matches!(result, Err(BittorrentError::IntegrityError(0))));
        assert!(results.try_recv().is_err());
        let mut orders = queue.orders();
        orders.sort_unstable();
        assert_eq!(orders, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_peer_without_useful_pieces_ends_session() {
        let (mut session, _, queue) = session(torrent(&content(40_000), false));

        session
            .handle(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0x00]),
            })
            .await
            .unwrap();
        let flow = session.handle(PeerMessage::Unchoke).await.unwrap();

        assert_eq!(flow, Flow::Done(SessionEnd::NoUsefulPieces));
        assert_eq!(queue.len(), 2);
    }

    /// One piece of eight blocks, the last one short.
    fn long_piece() -> (Vec<u8>, TorrentDescriptor) {
        let data = content(8 * BLOCK_SIZE as usize - 100);
        let torrent = torrent_with(&data, 8 * BLOCK_SIZE as u64, false);
        (data, torrent)
    }

    fn block_len(data: &[u8], index: u32) -> u32 {
        BLOCK_SIZE.min(data.len() as u32 - index * BLOCK_SIZE)
    }

    #[tokio::test]
    async fn test_pipeline_keeps_five_requests_outstanding() {
        let (data, torrent) = long_piece();
        let (mut session, mut results, _) = session(torrent);

        session.handle(all_pieces(1)).await.unwrap();
        session.writer.clear();
        session.handle(PeerMessage::Unchoke).await.unwrap();

        let initial = requests(&session.writer);
        let expected: Vec<_> = (0..PIPELINE_DEPTH as u32)
            .map(|i| BlockInfo::new(0, i * BLOCK_SIZE, BLOCK_SIZE))
            .collect();
        assert_eq!(initial, expected);

        let mut total = initial.len();
        for i in 0..7u32 {
            session.writer.clear();
            let len = block_len(&data, i) as usize;
            session
                .handle(block(&data, 0, (i * BLOCK_SIZE) as usize, len))
                .await
                .unwrap();

            let sent = requests(&session.writer);
            total += sent.len();
            if i < 3 {
                let next = i + PIPELINE_DEPTH as u32;
                assert_eq!(
                    sent,
                    vec![BlockInfo::new(0, next * BLOCK_SIZE, block_len(&data, next))]
                );
            } else {
                assert!(sent.is_empty());
            }
        }
        assert_eq!(total, 8);
        assert_eq!(block_len(&data, 7), BLOCK_SIZE - 100);

        session.writer.clear();
        session
            .handle(block(&data, 0, 7 * BLOCK_SIZE as usize, block_len(&data, 7) as usize))
            .await
            .unwrap();

        assert_eq!(results.try_recv().unwrap().data, data);
        // The sole remaining piece stays queued, so a fresh burst follows.
        assert_eq!(requests(&session.writer).len(), PIPELINE_DEPTH);
    }

    #[tokio::test]
    async fn test_choke_pauses_and_unchoke_refills_pipeline() {
        let (data, torrent) = long_piece();
        let (mut session, _, _) = session(torrent);

        session.handle(all_pieces(1)).await.unwrap();
        session.handle(PeerMessage::Unchoke).await.unwrap();
        session.handle(PeerMessage::Choke).await.unwrap();
        session.writer.clear();

        for i in 0..3 {
            session
                .handle(block(&data, 0, i * BLOCK_SIZE as usize, BLOCK_SIZE as usize))
                .await
                .unwrap();
        }
        assert!(requests(&session.writer).is_empty());

        session.handle(PeerMessage::Unchoke).await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Downloading);
        assert_eq!(
            requests(&session.writer),
            (5..8)
                .map(|i| BlockInfo::new(0, i * BLOCK_SIZE, block_len(&data, i)))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_have_makes_peer_useful() {
        let (mut session, _, queue) = session(torrent(&content(40_000), false));

        session
            .handle(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0x00]),
            })
            .await
            .unwrap();
        session.handle(PeerMessage::Have { piece_index: 1 }).await.unwrap();
        session.writer.clear();
        let flow = session.handle(PeerMessage::Unchoke).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.phase(), SessionPhase::Downloading);
        assert_eq!(requests(&session.writer), vec![BlockInfo::new(1, 0, 40_000 - 32_768)]);
        assert_eq!(queue.orders(), vec![0]);
    }

    #[tokio::test]
    async fn test_block_outside_piece_is_protocol_error() {
        let data = content(40_000);
        let (mut session, _, _) = session(torrent(&data, false));

        session.handle(all_pieces(2)).await.unwrap();
        session.handle(PeerMessage::Unchoke).await.unwrap();
        let result = session
            .handle(PeerMessage::Piece {
                piece_index: 0,
                offset: PIECE_LENGTH as u32 - 1,
                data: Bytes::from_static(&[1, 2]),
            })
            .await;
        assert!(matches!(result, Err(BittorrentError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_dropped_connection_returns_in_flight_piece() {
        let (mut session, _, queue) = session(torrent(&content(40_000), false));
        let mock = Builder::new()
            .read(&[0, 0, 0, 2, 5, 0xC0])
            .read(&[0, 0, 0, 1, 1])
            .build();
        let reader = MessageReader::spawn(mock, session.addr);
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let result = session.run(reader, shutdown).await;

        assert!(matches!(result, Err(BittorrentError::ConnectionError(_))));
        let mut orders = queue.orders();
        orders.sort_unstable();
        assert_eq!(orders, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_session() {
        let (mut session, _, _) = session(torrent(&content(40_000), false));
        let (client, _server) = tokio::io::duplex(64);
        let reader = MessageReader::spawn(client, session.addr);
        let (shutdown_tx, shutdown) = watch::channel(false);

        shutdown_tx.send(true).unwrap();
        assert_eq!(session.run(reader, shutdown).await.unwrap(), SessionEnd::Shutdown);
    }
}
