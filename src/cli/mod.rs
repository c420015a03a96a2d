use crate::client::{verify_download, ClientConfig, TorrentClient, DEFAULT_LOCAL_PEER, DEFAULT_PORT};
use crate::error::Result;
use crate::torrent::TorrentDescriptor;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "torrent-fetch")]
#[command(about = "Download torrents from UDP tracker peers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent file
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Port announced to trackers
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Number of concurrent peer sessions
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Skip trackers and connect to a single loopback peer
        #[arg(long, env = "TEST_LOCAL_CLIENT")]
        local_test: bool,

        /// Peer address used in local-test mode
        #[arg(long, default_value_t = DEFAULT_LOCAL_PEER)]
        local_peer: SocketAddr,

        /// Fall back to HTTP trackers when no UDP tracker answers
        #[arg(long)]
        http_trackers: bool,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Check an existing download against the torrent's piece hashes
    Verify {
        /// Path to the .torrent file
        torrent: PathBuf,

        /// Directory the torrent was downloaded into
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                port,
                workers,
                local_test,
                local_peer,
                http_trackers,
            } => {
                let config = ClientConfig {
                    download_dir: output.clone(),
                    listen_port: *port,
                    workers: *workers,
                    local_peer: local_test.then_some(*local_peer),
                    http_fallback: *http_trackers,
                    ..ClientConfig::default()
                };

                let client = Arc::new(TorrentClient::new(config));
                let interrupt = {
                    let client = client.clone();
                    tokio::spawn(async move {
                        match tokio::signal::ctrl_c().await {
                            Ok(()) => client.shutdown(),
                            Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
                        }
                    })
                };

                let result = client.download(torrent).await;
                interrupt.abort();

                let summary = result?;
                println!(
                    "Downloaded {} pieces ({} bytes) into {}",
                    summary.pieces,
                    summary.bytes_written,
                    client.config().download_dir.display()
                );
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }

            Commands::Verify { torrent, output } => {
                let descriptor = crate::torrent::load_torrent_file(torrent).await?;
                info!("Verifying {} in {}", descriptor.name, output.display());

                let valid = verify_download(output, &descriptor).await?;
                println!("{}/{} pieces valid", valid, descriptor.num_pieces());
            }
        }

        Ok(())
    }

    async fn show_torrent_info(&self, torrent_path: &Path) -> Result<()> {
        let torrent = crate::torrent::load_torrent_file(torrent_path).await?;
        print_torrent_info(&torrent);
        Ok(())
    }
}

fn print_torrent_info(torrent: &TorrentDescriptor) {
    println!("Torrent Information");
    println!("==================");
    println!("Name: {}", torrent.name);
    println!("Info Hash: {}", torrent.info_hash_hex());
    println!("Total Size: {} bytes", torrent.total_length);
    println!("Piece Length: {} bytes", torrent.piece_length);
    println!("Number of Pieces: {}", torrent.num_pieces());

    println!("\nTrackers:");
    for tracker in &torrent.trackers {
        println!("  - {}", tracker.as_str());
    }

    println!("\nFiles:");
    for (i, file) in torrent.files.iter().enumerate() {
        println!(
            "  {}: {} ({} bytes)",
            i + 1,
            file.path.join("/"),
            file.length
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_defaults() {
        let cli = Cli::try_parse_from(["torrent-fetch", "download", "-t", "a.torrent"]).unwrap();
        let Commands::Download {
            output,
            port,
            workers,
            local_peer,
            http_trackers,
            ..
        } = cli.command
        else {
            panic!("expected download");
        };

        assert_eq!(output, PathBuf::from("./downloads"));
        assert_eq!(port, 25771);
        assert_eq!(workers, 4);
        assert_eq!(local_peer, "127.0.0.1:25771".parse().unwrap());
        assert!(!http_trackers);
    }

    #[test]
    fn test_verify_args() {
        let cli =
            Cli::try_parse_from(["torrent-fetch", "verify", "a.torrent", "-o", "/tmp/out"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Verify { ref output, .. } if output == Path::new("/tmp/out")
        ));
    }
}
