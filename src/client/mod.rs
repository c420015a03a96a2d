mod peer_queue;
mod worker;

pub use peer_queue::PeerQueue;
pub use worker::Worker;

use crate::error::{BittorrentError, Result};
use crate::peer::SessionContext;
use crate::piece::{PieceDescriptor, PieceQueue, PieceResult};
use crate::storage::FileWriter;
use crate::torrent::{TorrentDescriptor, TrackerUrl};
use crate::tracker::{generate_peer_id, AnnounceRequest, TrackerClient};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Port announced to trackers unless configured otherwise
pub const DEFAULT_PORT: u16 = 25771;

/// Loopback peer used in local-test mode
pub const DEFAULT_LOCAL_PEER: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT));

/// Depth of the channel carrying verified pieces to the writer
const RESULTS_DEPTH: usize = 1;

/// Configuration for the BitTorrent client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    pub listen_port: u16,
    /// Number of concurrent peer sessions
    pub workers: usize,
    pub tracker_timeout: Duration,
    pub dial_timeout: Duration,
    /// Failed dials allowed per candidate before it is dropped
    pub max_connect_attempts: u32,
    /// Skip trackers and connect only to this address
    pub local_peer: Option<SocketAddr>,
    /// Also try HTTP(S) trackers once the UDP ones have failed
    pub http_fallback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_port: DEFAULT_PORT,
            workers: 4,
            tracker_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(20),
            max_connect_attempts: 2,
            local_peer: None,
            http_fallback: false,
        }
    }
}

/// Outcome of a finished download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub pieces: usize,
    pub bytes_written: u64,
    /// Distinct peer addresses discovered
    pub peers_known: usize,
}

/// Main BitTorrent client. Each client drives a single download.
pub struct TorrentClient {
    config: ClientConfig,
    peer_id: [u8; 20],
    shutdown: watch::Sender<bool>,
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Self {
        let peer_id = generate_peer_id();
        info!("Client initialized with peer_id: {}", hex::encode(peer_id));

        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            peer_id,
            shutdown,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Ask tracker discovery, the workers and the result loop to stop.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
    }

    /// Load a .torrent file and download it.
    pub async fn download(&self, torrent_path: &Path) -> Result<DownloadSummary> {
        info!("Starting download for: {}", torrent_path.display());
        let torrent = crate::torrent::load_torrent_file(torrent_path).await?;
        self.run(torrent).await
    }

    /// Download `torrent` into the configured directory.
    pub async fn run(&self, torrent: TorrentDescriptor) -> Result<DownloadSummary> {
        info!("Torrent: {}", torrent.name);
        info!("Total size: {} bytes", torrent.total_length);
        info!("Pieces: {}", torrent.num_pieces());
        info!("Info hash: {}", torrent.info_hash_hex());

        let torrent = Arc::new(torrent);
        let mut writer = FileWriter::create(&self.config.download_dir, &torrent).await?;

        let total = torrent.num_pieces();
        if torrent.pieces.is_empty() {
            writer.close().await?;
            info!("Nothing to download");
            return Ok(DownloadSummary {
                pieces: 0,
                bytes_written: 0,
                peers_known: 0,
            });
        }

        let peers = Arc::new(PeerQueue::new());
        self.discover_peers(&torrent, &peers).await?;

        let (results, mut results_rx) = mpsc::channel(RESULTS_DEPTH);
        let ctx = Arc::new(SessionContext {
            torrent: torrent.clone(),
            peer_id: self.peer_id,
            pieces: Arc::new(PieceQueue::new(PieceDescriptor::all(&torrent))),
            results,
        });
        let workers = self.spawn_workers(&peers, &ctx);
        drop(ctx);

        let outcome = self
            .collect_results(&mut results_rx, &mut writer, total)
            .await;

        // Sessions blocked on a full results channel fail once it is gone.
        self.shutdown.send_replace(true);
        drop(results_rx);
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }

        let bytes_written = outcome?;
        writer.close().await?;

        let summary = DownloadSummary {
            pieces: total,
            bytes_written,
            peers_known: peers.known(),
        };
        info!(
            "Download complete: {} pieces, {} bytes",
            summary.pieces, summary.bytes_written
        );
        Ok(summary)
    }

    /// Fill `peers` from the local-test address or the first tracker that
    /// answers with peers.
    async fn discover_peers(&self, torrent: &TorrentDescriptor, peers: &PeerQueue) -> Result<()> {
        if let Some(addr) = self.config.local_peer {
            info!("Local test mode, using peer {}", addr);
            peers.push_new(addr);
            return Ok(());
        }

        let client = TrackerClient::new(self.config.tracker_timeout);
        let request = AnnounceRequest::new(
            torrent.info_hash,
            self.peer_id,
            self.config.listen_port,
            torrent.total_length,
        );
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(BittorrentError::Cancelled);
        }

        for tracker in self.tracker_order(&torrent.trackers) {
            info!("Announcing to {}", tracker.as_str());
            let response = tokio::select! {
                biased;
                _ = shutdown.changed() => return Err(BittorrentError::Cancelled),
                response = client.announce(tracker, &request) => response,
            };

            match response {
                Ok(response) if !response.peers.is_empty() => {
                    let added = response
                        .peers
                        .iter()
                        .filter(|addr| peers.push_new(**addr))
                        .count();
                    info!(
                        "Tracker {} returned {} peers ({} new, interval {}s)",
                        tracker.as_str(),
                        response.peers.len(),
                        added,
                        response.interval
                    );
                    return Ok(());
                }
                // An empty peer list would leave nothing to download from, so keep looking.
                Ok(_) => warn!("Tracker {} returned no peers", tracker.as_str()),
                Err(e) => warn!("Tracker {} failed: {}", tracker.as_str(), e),
            }
        }

        Err(BittorrentError::TrackerError(
            "No tracker returned any peers".to_string(),
        ))
    }

    /// UDP trackers in declared order, then HTTP ones when the fallback is on.
    fn tracker_order<'a>(&self, trackers: &'a [TrackerUrl]) -> Vec<&'a TrackerUrl> {
        let udp = trackers.iter().filter(|t| t.is_udp());
        let http = trackers
            .iter()
            .filter(|t| self.config.http_fallback && t.is_http());
        udp.chain(http).collect()
    }

    fn spawn_workers(
        &self,
        peers: &Arc<PeerQueue>,
        ctx: &Arc<SessionContext>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|id| {
                let worker = Worker::new(
                    id,
                    peers.clone(),
                    ctx.clone(),
                    self.shutdown.subscribe(),
                    self.config.dial_timeout,
                    self.config.max_connect_attempts,
                );
                tokio::spawn(worker.run())
            })
            .collect()
    }

    /// Write each distinct piece once until all `total` have arrived.
    /// Returns the number of bytes written.
    async fn collect_results(
        &self,
        results: &mut mpsc::Receiver<PieceResult>,
        writer: &mut FileWriter,
        total: usize,
    ) -> Result<u64> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(BittorrentError::Cancelled);
        }
        let mut written = vec![false; total];
        let mut completed = 0usize;
        let mut bytes_written = 0u64;

        while completed < total {
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => return Err(BittorrentError::Cancelled),
                result = results.recv() => result,
            };
            let Some(PieceResult { data, order }) = result else {
                return Err(BittorrentError::ConnectionError(format!(
                    "All workers stopped with {} pieces outstanding",
                    total - completed
                )));
            };

            match written.get_mut(order) {
                Some(seen) if !*seen => *seen = true,
                Some(_) => {
                    debug!("Piece {} already written, dropping duplicate", order);
                    continue;
                }
                None => {
                    warn!("Discarding result for unknown piece {}", order);
                    continue;
                }
            }

            writer.write_piece(order, &data).await?;
            completed += 1;
            bytes_written += data.len() as u64;
            info!(
                "Wrote piece {} ({}/{}, {:.1}%)",
                order,
                completed,
                total,
                completed as f64 * 100.0 / total as f64
            );
        }

        Ok(bytes_written)
    }
}

/// Re-read a finished download and count the pieces whose digest matches.
pub async fn verify_download(download_dir: &Path, torrent: &TorrentDescriptor) -> Result<usize> {
    let mut reader = FileWriter::open_existing(download_dir, torrent).await?;
    let mut valid = 0;

    for (order, hash) in torrent.pieces.iter().enumerate() {
        let data = reader.read_piece(order).await?;
        if hash.matches(&data) {
            valid += 1;
        } else {
            warn!("Piece {} does not match its hash", order);
        }
    }

    info!("{}/{} pieces valid", valid, torrent.num_pieces());
    Ok(valid)
}

impl Default for TorrentClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{read_message, Bitfield, Handshake, PeerMessage, HANDSHAKE_LEN};
    use crate::torrent::{FileInfo, PieceHash, Pieces};
    use bytes::Bytes;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const PIECE_LENGTH: usize = 32 * 1024;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn torrent(data: &[u8], files: Vec<FileInfo>, info_hash: [u8; 20]) -> TorrentDescriptor {
        let pieces: Pieces = data.chunks(PIECE_LENGTH).map(PieceHash::of).collect();
        TorrentDescriptor::new(
            "fixture".to_string(),
            info_hash,
            pieces,
            PIECE_LENGTH as u64,
            files,
            Vec::new(),
        )
        .unwrap()
    }

    fn config(dir: &Path, peer: SocketAddr) -> ClientConfig {
        ClientConfig {
            download_dir: dir.to_path_buf(),
            workers: 2,
            dial_timeout: Duration::from_secs(5),
            local_peer: Some(peer),
            ..ClientConfig::default()
        }
    }

    /// Serve every request for `data` after a handshake, bitfield and unchoke.
    async fn seed_connection(mut stream: TcpStream, info_hash: [u8; 20], data: Arc<Vec<u8>>) {
        let addr = stream.peer_addr().unwrap();
        let mut handshake = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut handshake).await.unwrap();
        stream
            .write_all(&Handshake::new(info_hash, *b"-SEED00-000000000000").to_bytes())
            .await
            .unwrap();

        let num_pieces = data.len().div_ceil(PIECE_LENGTH);
        let mut bitfield = Bitfield::new(num_pieces);
        for i in 0..num_pieces {
            bitfield.set(i);
        }
        let bitfield = PeerMessage::Bitfield {
            bitfield: Bytes::from(bitfield.to_packed()),
        };
        stream.write_all(&bitfield.to_bytes()).await.unwrap();
        stream.write_all(&PeerMessage::Unchoke.to_bytes()).await.unwrap();

        while let Ok(message) = read_message(&mut stream, addr).await {
            if let PeerMessage::Request { block } = message {
                let start = block.piece_index as usize * PIECE_LENGTH + block.offset as usize;
                let piece = PeerMessage::Piece {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data: Bytes::copy_from_slice(&data[start..start + block.length as usize]),
                };
                if stream.write_all(&piece.to_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }

    async fn spawn_seeder(info_hash: [u8; 20], data: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let data = Arc::new(data);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(seed_connection(stream, info_hash, data.clone()));
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_downloads_from_loopback_seeder() {
        let data = content(3 * PIECE_LENGTH + 1000);
        let info_hash = [0x42; 20];
        let torrent = torrent(
            &data,
            vec![
                FileInfo::new(["fixture", "a.bin"], 50_000),
                FileInfo::new(["fixture", "b.bin"], (data.len() - 50_000) as u64),
            ],
            info_hash,
        );
        let seeder = spawn_seeder(info_hash, data.clone()).await;
        let tmp = tempdir().unwrap();
        let dir = tmp.path();

        let client = TorrentClient::new(config(dir, seeder));
        let summary = client.run(torrent).await.unwrap();

        assert_eq!(summary.pieces, 4);
        assert_eq!(summary.bytes_written, data.len() as u64);
        assert_eq!(summary.peers_known, 1);

        let mut written = std::fs::read(dir.join("fixture").join("a.bin")).unwrap();
        written.extend(std::fs::read(dir.join("fixture").join("b.bin")).unwrap());
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn test_zero_pieces_finishes_immediately() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let torrent = torrent(&[], vec![FileInfo::new(["empty.txt"], 0)], [1; 20]);

        let client = TorrentClient::new(ClientConfig {
            download_dir: dir.to_path_buf(),
            ..ClientConfig::default()
        });
        let summary = client.run(torrent).await.unwrap();

        assert_eq!(summary.pieces, 0);
        assert!(dir.join("empty.txt").exists());
    }

    #[tokio::test]
    async fn test_no_usable_tracker() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let data = content(100);
        let torrent = torrent(&data, vec![FileInfo::new(["x"], 100)], [2; 20]);

        let client = TorrentClient::new(ClientConfig {
            download_dir: dir.to_path_buf(),
            ..ClientConfig::default()
        });
        let result = client.run(torrent).await;

        assert!(matches!(result, Err(BittorrentError::TrackerError(_))));
    }

    #[tokio::test]
    async fn test_rejects_peer_with_other_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seeder = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut handshake).await.unwrap();
            stream
                .write_all(&Handshake::new([0xEE; 20], [7; 20]).to_bytes())
                .await
                .unwrap();

            // Nothing may follow the handshake; the client just hangs up.
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            seen_tx.send(rest).await.unwrap();
        });

        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let data = content(100);
        let torrent = torrent(&data, vec![FileInfo::new(["x"], 100)], [3; 20]);
        let client = Arc::new(TorrentClient::new(config(dir, seeder)));

        let running = {
            let client = client.clone();
            tokio::spawn(async move { client.run(torrent).await })
        };

        let after_handshake = seen_rx.recv().await.unwrap();
        assert!(after_handshake.is_empty());

        client.shutdown();
        let result = running.await.unwrap();
        assert!(matches!(result, Err(BittorrentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_verify_download() {
        let data = content(2 * PIECE_LENGTH + 10);
        let torrent = torrent(&data, vec![FileInfo::new(["v.bin"], data.len() as u64)], [4; 20]);
        let tmp = tempdir().unwrap();
        let dir = tmp.path();

        let mut damaged = data.clone();
        damaged[PIECE_LENGTH + 3] ^= 0xFF;
        std::fs::write(dir.join("v.bin"), &damaged).unwrap();
        assert_eq!(verify_download(dir, &torrent).await.unwrap(), 2);

        std::fs::write(dir.join("v.bin"), &data).unwrap();
        assert_eq!(verify_download(dir, &torrent).await.unwrap(), 3);

        std::fs::remove_file(dir.join("v.bin")).unwrap();
        assert!(matches!(
            verify_download(dir, &torrent).await,
            Err(BittorrentError::IoError(_))
        ));
    }

    #[test]
    fn test_tracker_order() {
        let trackers: Vec<TrackerUrl> = [
            "http://a.example/announce",
            "udp://b.example:80/announce",
            "https://c.example/announce",
            "udp://d.example:6969",
        ]
        .iter()
        .map(|url| TrackerUrl::parse(url).unwrap())
        .collect();

        let client = TorrentClient::default();
        let order: Vec<&str> = client
            .tracker_order(&trackers)
            .into_iter()
            .map(TrackerUrl::as_str)
            .collect();
        assert_eq!(
            order,
            ["udp://b.example:80/announce", "udp://d.example:6969"]
        );

        let client = TorrentClient::new(ClientConfig {
            http_fallback: true,
            ..ClientConfig::default()
        });
        assert_eq!(client.tracker_order(&trackers).len(), 4);
        assert!(client.tracker_order(&trackers)[2].is_http());
    }
}
