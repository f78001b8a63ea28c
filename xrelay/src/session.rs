//! Transport session: the single outbound stream connection.
//!
//! The session is a small state machine whose transitions are published on a
//! `watch` channel:
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected
//!       │                        │                 │
//!       └────────cancel──────────┴──cancel/error───┴──► Cancelled / Failed
//! ```
//!
//! Reads and writes are only served while `Connected`; anywhere else they
//! return [`Error::NotConnected`] without touching the stream. Cancelling the
//! session wakes any pending read or write with [`Error::Cancelled`].

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_vsock::{VsockAddr, VsockStream};

use crate::config::Endpoint;
use crate::error::{Error, Result};

/// Connection state of a [`TransportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no connection attempted yet.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Stream established; pumps may run.
    Connected,
    /// Torn down locally.
    Cancelled,
    /// Connection attempt failed or the stream broke.
    Failed,
}

impl SessionState {
    /// Returns true for states the session never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Cancelled | SessionState::Failed)
    }

    fn can_move_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disconnected, Connecting | Connected | Cancelled) => true,
            (Connecting, Connected | Failed | Cancelled) => true,
            (Connected, Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Owns one outbound stream connection.
///
/// Shared between the controller and both pumps behind an `Arc`. The state
/// is only ever changed through [`TransportSession::connect`],
/// [`TransportSession::attach`], [`TransportSession::cancel`] and the
/// session's own read path; everyone else observes.
pub struct TransportSession {
    state: watch::Sender<SessionState>,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    cancel: CancellationToken,
}

impl TransportSession {
    /// Creates a session in the `Disconnected` state.
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            state,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns true while the stream is usable.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Resolves once the session has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Starts connecting to `endpoint` in the background.
    ///
    /// Returns immediately; completion is observed through [`subscribe`].
    ///
    /// [`subscribe`]: TransportSession::subscribe
    pub fn connect(self: &Arc<Self>, endpoint: Endpoint) -> Result<()> {
        if !self.transition(SessionState::Connecting) {
            return Err(Error::InvalidState("session already used"));
        }

        info!("Connecting to server: {}", endpoint);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = session.cancel.cancelled() => {
                    debug!("Connect to {} abandoned", endpoint);
                    return;
                }
                result = open_stream(&endpoint) => result,
            };

            match result {
                Ok(stream) => session.attach(stream).await,
                Err(e) => {
                    warn!("Failed to connect to {}: {}", endpoint, e);
                    session.transition(SessionState::Failed);
                }
            }
        });

        Ok(())
    }

    /// Adopts an already established stream and moves to `Connected`.
    ///
    /// For hosts that open the connection through their own APIs. Has no
    /// effect once the session reached a terminal state.
    pub async fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        *self.reader.lock().await = Some(Box::new(reader));
        *self.writer.lock().await = Some(Box::new(writer));

        if !self.transition(SessionState::Connected) {
            self.reader.lock().await.take();
            self.writer.lock().await.take();
        }
    }

    /// Reads exactly `n` bytes.
    ///
    /// Partial deliveries from the stream are accumulated. If the peer
    /// closes the stream after some but not all bytes arrived, the short
    /// buffer is returned and the session moves to `Failed`; if it closes
    /// before any byte arrived, [`Error::ConnectionClosed`] is returned.
    pub async fn read_exact(&self, n: usize) -> Result<Bytes> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(Error::NotConnected(state));
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::NotConnected(self.state()))?;

        let mut buf = BytesMut::zeroed(n);
        let mut filled = 0;
        while filled < n {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                read = reader.read(&mut buf[filled..]) => read,
            };

            match read {
                Ok(0) => {
                    debug!("Server closed the stream after {} of {} bytes", filled, n);
                    self.transition(SessionState::Failed);
                    if filled == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                    buf.truncate(filled);
                    return Ok(buf.freeze());
                }
                Ok(len) => filled += len,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Error reading from server: {}", e);
                    self.transition(SessionState::Failed);
                    return Err(Error::Io(e));
                }
            }
        }

        trace!("Read {} bytes from server", n);
        Ok(buf.freeze())
    }

    /// Writes the whole buffer and flushes it.
    ///
    /// A failed write is logged and reported but leaves the session state
    /// alone; whether it is fatal is the caller's decision.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(Error::NotConnected(state));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected(self.state()))?;

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
        };

        result.map_err(|e| {
            warn!("Write of {} bytes to server failed: {}", data.len(), e);
            Error::Io(e)
        })
    }

    /// Tears the connection down. Idempotent.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.transition(SessionState::Cancelled);

        // A half locked by a pending call is dropped along with the session.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    pub(crate) fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if !state.can_move_to(next) {
                return false;
            }
            debug!("Connection state changed: {} -> {}", state, next);
            *state = next;
            true
        })
    }
}

impl Default for TransportSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn open_stream(endpoint: &Endpoint) -> io::Result<Box<dyn RelayStream>> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            info!("TCP socket connected.");
            Ok(Box::new(stream))
        }
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            info!("Unix socket connected.");
            Ok(Box::new(stream))
        }
        Endpoint::Vsock { cid, port } => {
            let stream = VsockStream::connect(VsockAddr::new(*cid, *port)).await?;
            info!("Vsock socket connected.");
            Ok(Box::new(stream))
        }
    }
}
