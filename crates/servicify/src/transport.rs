//! # Framed Byte Streams
//!
//! Everything above this module speaks in whole frames; everything below is a
//! byte stream. A frame on the wire is `[len: u32 big-endian][body: len bytes]`
//! and bodies are opaque here. Matching replies to calls is left to
//! [`crate::peer::Peer`].

use std::net::SocketAddr;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

/// The largest frame body either side will accept.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Could not connect, or the other side went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("frame of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
    #[error("i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Moves whole frames in both directions. Used as `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues a payload for delivery.
    ///
    /// # invariants
    /// - A payload is either handed over whole or not at all; cancelling the
    ///   returned future never leaves half a frame on the wire.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next inbound payload. `Ok(None)` means the stream closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(Error::PayloadTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes one frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// A framed TCP connection.
///
/// Writes go through a dedicated writer task fed by a channel, so `send` is
/// a channel push and is safe to cancel.
pub struct TcpTransport {
    peer_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<OwnedReadHalf>,
}

impl TcpTransport {
    /// Opens a connection to `addr`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionLost(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream)
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(payload) = outbound.recv().await {
                if let Err(e) = write_frame(&mut write_half, &payload).await {
                    tracing::debug!(%peer_addr, error = %e, "writer stopped");
                    break;
                }
            }
        });

        Ok(Self {
            peer_addr,
            tx,
            rx: Mutex::new(read_half),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        self.tx
            .send(payload.to_vec())
            .map_err(|_| Error::ConnectionLost("writer closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        read_frame(&mut *rx).await
    }
}
