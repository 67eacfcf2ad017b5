//! Transport engine: one WebSocket connection over one stream socket.
//!
//! [`Transport`] is a thin handle. The connection itself runs in a spawned
//! task that exclusively owns the socket halves, the frame parser and the
//! close-handshake flags, so no state is shared across threads.
//!
//! ```text
//!   Disconnected ──► Handshaking ──► Open ──► Closing ──► Closed
//!                         │            │
//!                         ▼            ▼ (peer hung up without a close)
//!                   HandshakeError  Disconnected + TransportEvent::Dropped
//! ```

use std::fmt;
use std::ops::ControlFlow;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::session::Endpoint;
use crate::websocket::{
    ClientHandshake, ControlFrame, Decoded, Frame, FrameParser, FrameReader, FrameWriter,
    HandshakeError, close_code,
};

/// Identifies one transport instance within its owner.
pub type ConnectionId = u64;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No socket, or the socket dropped without a close handshake
    Disconnected,
    /// Upgrade request sent, awaiting the response
    Handshaking,
    /// Frames flow in both directions
    Open,
    /// A close frame went one way; waiting for the other
    Closing,
    /// Close frames went both ways and the socket is shut down
    Closed,
}

/// Notifications raised by a running transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake succeeded and reads have started
    Connected,
    /// A complete text message arrived
    Message(String),
    /// An outbound frame finished writing
    MessageSent,
    /// The close handshake completed
    Closed,
    /// The peer closed the socket without a close handshake
    Dropped,
}

/// A [`TransportEvent`] tagged with the transport that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportNotice {
    /// Which transport raised the event
    pub connection: ConnectionId,
    /// What happened
    pub event: TransportEvent,
}

/// Channel the transport publishes its notices on.
pub type NoticeSink = mpsc::UnboundedSender<TransportNotice>;

/// Errors surfaced by the transport handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Socket-level failure while connecting
    Io(String),
    /// The opening handshake failed
    Handshake(HandshakeError),
    /// The connection task has already finished
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(msg) => write!(f, "I/O error: {}", msg),
            TransportError::Handshake(err) => write!(f, "Handshake failed: {}", err),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<HandshakeError> for TransportError {
    fn from(err: HandshakeError) -> Self {
        TransportError::Handshake(err)
    }
}

/// Settings for the handshake and read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Request path of the Upgrade request
    pub path: String,
    /// `Origin` header value
    pub origin: String,
    /// Bytes requested per socket read
    pub read_buffer_size: usize,
    /// Largest frame payload accepted from the peer
    pub max_payload_len: u64,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            path: "/socket.io/websocket".to_string(),
            origin: "http://turntable.fm".to_string(),
            read_buffer_size: 8192,
            max_payload_len: isize::MAX as u64,
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// Handle to a running WebSocket connection.
///
/// Dropping the handle starts the close handshake.
#[derive(Debug)]
pub struct Transport {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<TransportState>,
}

impl Transport {
    /// Open a TCP connection to `endpoint` and perform the handshake.
    pub async fn connect(
        id: ConnectionId,
        endpoint: &Endpoint,
        options: &TransportOptions,
        notices: NoticeSink,
    ) -> Result<Self, TransportError> {
        log::info!("[Transport] #{} connecting to {}", id, endpoint);
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        stream.set_nodelay(true)?;
        Self::start(id, stream, &endpoint.host_header(), options, notices).await
    }

    /// Perform the handshake over an already connected stream and start the
    /// connection task.
    pub async fn start<S>(
        id: ConnectionId,
        mut stream: S,
        host: &str,
        options: &TransportOptions,
        notices: NoticeSink,
    ) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(TransportState::Handshaking);

        let handshake = ClientHandshake::new(host, &options.path, &options.origin)?;
        let leftover = match handshake.perform(&mut stream).await {
            Ok(leftover) => leftover,
            Err(err) => {
                log::warn!("[Transport] #{} handshake failed: {}", id, err);
                return Err(err.into());
            }
        };

        log::info!("[Transport] #{} open", id);
        state_tx.send_replace(TransportState::Open);
        let _ = notices.send(TransportNotice {
            connection: id,
            event: TransportEvent::Connected,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let parser = FrameParser::with_max_payload_len(options.max_payload_len);
        let connection = Connection {
            id,
            reader: FrameReader::new(read_half, parser, options.read_buffer_size),
            writer: FrameWriter::new(write_half),
            notices,
            state: state_tx,
            close_sent: false,
            close_received: false,
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection.run(outbound_rx, leftover));

        Ok(Transport {
            id,
            outbound: outbound_tx,
            state: state_rx,
        })
    }

    /// Identifier given at construction.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Queue a text message; completion is reported as
    /// [`TransportEvent::MessageSent`].
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Start the close handshake with a normal-closure frame.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Task-side connection state.
struct Connection<S> {
    id: ConnectionId,
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    notices: NoticeSink,
    state: watch::Sender<TransportState>,
    close_sent: bool,
    close_received: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, mut outbound: mpsc::UnboundedReceiver<Outbound>, leftover: BytesMut) {
        if !leftover.is_empty() {
            let decoded = self.reader.feed(&leftover);
            if self.handle_decoded(decoded).await.is_break() {
                return;
            }
        }

        let mut handle_alive = true;
        loop {
            tokio::select! {
                chunk = self.reader.read_chunk() => {
                    let flow = match chunk {
                        Ok(Some(decoded)) => self.handle_decoded(decoded).await,
                        Ok(None) => self.peer_hung_up().await,
                        Err(err) => {
                            log::warn!("[Transport] #{} read failed: {}", self.id, err);
                            self.peer_hung_up().await
                        }
                    };
                    if flow.is_break() {
                        return;
                    }
                }
                command = outbound.recv(), if handle_alive => {
                    let flow = match command {
                        Some(Outbound::Text(text)) => {
                            if self.close_sent {
                                log::debug!("[Transport] #{} dropping message queued after close", self.id);
                            } else {
                                self.write(&Frame::text(text)).await;
                            }
                            ControlFlow::Continue(())
                        }
                        Some(Outbound::Close) => {
                            self.send_close(close_code::NORMAL, "").await
                        }
                        None => {
                            handle_alive = false;
                            self.send_close(close_code::NORMAL, "").await
                        }
                    };
                    if flow.is_break() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_decoded(&mut self, decoded: Vec<Decoded>) -> ControlFlow<()> {
        for item in decoded {
            match item {
                Decoded::Text(text) => {
                    log::debug!("[Transport] #{} received {} bytes", self.id, text.len());
                    self.notify(TransportEvent::Message(text));
                }
                Decoded::Control(ControlFrame::Ping(payload)) => {
                    if !self.close_sent {
                        self.write(&Frame::pong(payload)).await;
                    }
                }
                Decoded::Control(ControlFrame::Pong(_)) => {
                    log::debug!("[Transport] #{} pong received", self.id);
                }
                Decoded::Control(ControlFrame::Close { code, reason }) => {
                    log::info!(
                        "[Transport] #{} peer sent close ({:?} {:?})",
                        self.id,
                        code,
                        reason
                    );
                    self.close_received = true;
                    if self.close_sent {
                        return self.finish().await;
                    }
                    self.send_close(close_code::NORMAL, "").await?;
                }
                Decoded::Violation(violation) => {
                    log::warn!("[Transport] #{} protocol violation: {}", self.id, violation);
                    self.send_close(violation.close_code(), violation.reason())
                        .await?;
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Send our close frame once; finish if the peer's already arrived.
    async fn send_close(&mut self, code: u16, reason: &str) -> ControlFlow<()> {
        if !self.close_sent {
            self.close_sent = true;
            self.state.send_replace(TransportState::Closing);
            self.write(&Frame::close(code, reason)).await;
        }
        if self.close_received {
            return self.finish().await;
        }
        ControlFlow::Continue(())
    }

    async fn peer_hung_up(&mut self) -> ControlFlow<()> {
        if self.close_sent {
            return self.finish().await;
        }
        log::info!("[Transport] #{} dropped by peer", self.id);
        let _ = self.writer.shutdown().await;
        self.state.send_replace(TransportState::Disconnected);
        self.notify(TransportEvent::Dropped);
        ControlFlow::Break(())
    }

    async fn finish(&mut self) -> ControlFlow<()> {
        let _ = self.writer.shutdown().await;
        self.state.send_replace(TransportState::Closed);
        log::info!("[Transport] #{} closed", self.id);
        self.notify(TransportEvent::Closed);
        ControlFlow::Break(())
    }

    async fn write(&mut self, frame: &Frame) {
        match self.writer.write_frame(frame).await {
            Ok(()) => self.notify(TransportEvent::MessageSent),
            Err(err) => log::warn!("[Transport] #{} write failed: {}", self.id, err),
        }
    }

    fn notify(&self, event: TransportEvent) {
        let _ = self.notices.send(TransportNotice {
            connection: self.id,
            event,
        });
    }
}
