use super::PeerMessage;
use crate::error::{BittorrentError, Result};
use bytes::BytesMut;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Frames longer than this are treated as a protocol violation.
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Decoded messages buffered between the reader task and the session.
pub const MESSAGE_QUEUE_DEPTH: usize = 10;

fn read_failure(addr: SocketAddr, err: std::io::Error) -> BittorrentError {
    match err.kind() {
        ErrorKind::UnexpectedEof => {
            BittorrentError::ConnectionError(format!("{} closed the connection", addr))
        }
        _ => BittorrentError::ConnectionError(format!("Read from {} failed: {}", addr, err)),
    }
}

/// Read one length-prefixed message.
pub async fn read_message<R>(reader: &mut R, addr: SocketAddr) -> Result<PeerMessage>
where
    R: AsyncRead + Unpin,
{
    let length = reader
        .read_u32()
        .await
        .map_err(|e| read_failure(addr, e))? as usize;

    if length > MAX_MESSAGE_LEN {
        return Err(BittorrentError::ProtocolError(format!(
            "{} sent a {} byte frame",
            addr, length
        )));
    }

    let mut frame = BytesMut::zeroed(length);
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|e| read_failure(addr, e))?;

    PeerMessage::from_frame(frame.freeze())
}

/// Reader half of a peer connection, running as its own task.
///
/// Messages arrive on `messages`; the first read or decode failure is sent
/// once on `failure` and the task stops. Dropping the reader aborts the task.
pub struct MessageReader {
    pub messages: mpsc::Receiver<PeerMessage>,
    pub failure: oneshot::Receiver<BittorrentError>,
    task: JoinHandle<()>,
}

impl MessageReader {
    pub fn spawn<R>(mut reader: R, addr: SocketAddr) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (message_tx, messages) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        let (failure_tx, failure) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader, addr).await {
                    Ok(PeerMessage::KeepAlive) => trace!("({}) keep-alive", addr),
                    Ok(message) => {
                        if message_tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Reader for {} stopped: {}", addr, e);
                        let _ = failure_tx.send(e);
                        return;
                    }
                }
            }
        });

        Self {
            messages,
            failure,
            task,
        }
    }
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}
