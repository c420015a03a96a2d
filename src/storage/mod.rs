use crate::error::{BittorrentError, Result};
use crate::torrent::TorrentDescriptor;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// An open output file and its place in the torrent's byte stream
struct FileEntry {
    path: PathBuf,
    file: File,
    length: u64,
    /// Global offset of the file's first byte
    offset: u64,
}

impl FileEntry {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Writes pieces into the torrent's files at their byte offsets.
///
/// Owned by the coordinator alone, so no per-file locking is needed.
pub struct FileWriter {
    files: Vec<FileEntry>,
    piece_length: u64,
    total_length: u64,
    multi_file: bool,
}

impl FileWriter {
    /// Create every output file (and parent directory) under `download_dir`.
    pub async fn create<P: AsRef<Path>>(download_dir: P, torrent: &TorrentDescriptor) -> Result<Self> {
        let writer = Self::open_with(download_dir.as_ref(), torrent, true).await?;
        info!(
            "Storage initialized: {} files, {} bytes total",
            writer.files.len(),
            writer.total_length
        );
        Ok(writer)
    }

    /// Open the files of an existing download for reading back.
    pub async fn open_existing<P: AsRef<Path>>(
        download_dir: P,
        torrent: &TorrentDescriptor,
    ) -> Result<Self> {
        Self::open_with(download_dir.as_ref(), torrent, false).await
    }

    async fn open_with(download_dir: &Path, torrent: &TorrentDescriptor, create: bool) -> Result<Self> {
        let mut files = Vec::with_capacity(torrent.files.len());
        let mut offset = 0u64;

        for info in &torrent.files {
            let path: PathBuf = std::iter::once(download_dir)
                .chain(info.path.iter().map(Path::new))
                .collect();

            if create {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
            }

            let file = OpenOptions::new()
                .read(true)
                .write(create)
                .create(create)
                .open(&path)
                .await?;
            if create {
                // Drop any stale tail left by an earlier, longer file.
                file.set_len(info.length).await?;
            }

            files.push(FileEntry {
                path,
                file,
                length: info.length,
                offset,
            });
            offset += info.length;
        }

        Ok(Self {
            files,
            piece_length: torrent.piece_length,
            total_length: torrent.total_length,
            multi_file: torrent.is_multi_file(),
        })
    }

    /// Write a verified piece at its global offset.
    pub async fn write_piece(&mut self, order: usize, data: &[u8]) -> Result<()> {
        let offset = order as u64 * self.piece_length;
        debug!(
            "Writing piece {} at global offset {} ({} bytes)",
            order,
            offset,
            data.len()
        );
        self.write_at(offset, data).await
    }

    /// Write `data` at global `offset`, splitting it across every file the
    /// range `[offset, offset + len)` touches.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;

        if !self.multi_file {
            let entry = &mut self.files[0];
            entry.file.seek(SeekFrom::Start(offset)).await?;
            entry.file.write_all(data).await?;
            return Ok(());
        }

        let mut position = offset;
        let mut rest = data;

        for entry in self.files.iter_mut() {
            if rest.is_empty() {
                break;
            }
            if position >= entry.end() {
                continue;
            }

            let relative = position - entry.offset;
            let len = (entry.length - relative).min(rest.len() as u64) as usize;

            entry.file.seek(SeekFrom::Start(relative)).await?;
            entry.file.write_all(&rest[..len]).await?;
            debug!(
                "Wrote {} bytes to {} at offset {}",
                len,
                entry.path.display(),
                relative
            );

            position += len as u64;
            rest = &rest[len..];
        }

        Ok(())
    }

    /// Read back piece `order`.
    pub async fn read_piece(&mut self, order: usize) -> Result<Vec<u8>> {
        let offset = order as u64 * self.piece_length;
        let length = self.piece_length.min(self.total_length.saturating_sub(offset));
        self.read_at(offset, length as usize).await
    }

    /// Read `length` bytes at global `offset`, spanning files as needed.
    pub async fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.check_range(offset, length)?;

        let mut result = vec![0u8; length];
        let mut position = offset;
        let mut filled = 0usize;

        for entry in self.files.iter_mut() {
            if filled == length {
                break;
            }
            if position >= entry.end() {
                continue;
            }

            let relative = position - entry.offset;
            let len = (entry.length - relative).min((length - filled) as u64) as usize;

            entry.file.seek(SeekFrom::Start(relative)).await?;
            entry.file.read_exact(&mut result[filled..filled + len]).await?;

            position += len as u64;
            filled += len;
        }

        Ok(result)
    }

    /// Flush and sync every file.
    pub async fn close(mut self) -> Result<()> {
        for entry in self.files.iter_mut() {
            entry.file.flush().await?;
            entry.file.sync_all().await?;
        }
        debug!("Closed {} files", self.files.len());
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.total_length {
            return Err(BittorrentError::StorageError(format!(
                "Range {}..{} beyond torrent length {}",
                offset,
                offset + len as u64,
                self.total_length
            )));
        }
        Ok(())
    }
}
