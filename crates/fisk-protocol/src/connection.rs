//! Framed connection with handshake, payload tracking and an ordered writer.
//!
//! Reads happen on the task that owns the [`Connection`]. Writes go through
//! a cloneable [`FrameSender`] feeding a single writer task, so frames from
//! different tasks never interleave inside a payload and a slow peer applies
//! backpressure through the bounded channel.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::assembler::{Inbound, PayloadAssembler};
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameCodec, FrameError};

/// Depth of the outbound frame queue per connection.
pub const SEND_QUEUE_DEPTH: usize = 64;

/// Role announced by the first frame of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Builder registering with the scheduler.
    Builder,
    /// Client asking the scheduler for a builder.
    Client,
    /// Client submitting a compile job to a builder.
    Job,
    /// Read-only monitor feed subscriber.
    Monitor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Builder => write!(f, "builder"),
            Role::Client => write!(f, "client"),
            Role::Job => write!(f, "job"),
            Role::Monitor => write!(f, "monitor"),
        }
    }
}

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub role: Role,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Handshake {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            headers: BTreeMap::new(),
        }
    }

    /// Builder-style header insertion.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound connection not yet announced.
    Connecting,
    /// Inbound connection waiting for the handshake frame.
    Handshake,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// Errors surfaced by [`Connection`] and [`FrameSender`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("peer reported error: {0}")]
    Remote(ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// The structured error to show the peer, if this error is one the
    /// peer caused.
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            ConnectionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Cloneable handle for queueing outbound frames.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    /// Create a sender with a detached receiving end.
    ///
    /// Used by components that want to capture what would be written.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a raw frame.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.tx.send(frame).await.map_err(|_| ConnectionError::Closed)
    }

    /// Serialize `message` and queue it as a JSON frame.
    pub async fn send_json<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(message)?;
        self.send_frame(Frame::Text(text)).await
    }

    /// Queue a binary frame.
    pub async fn send_binary(&self, data: Bytes) -> Result<(), ConnectionError> {
        self.send_frame(Frame::Binary(data)).await
    }

    /// Queue an error frame.
    pub async fn send_error(&self, error: &ProtocolError) -> Result<(), ConnectionError> {
        self.send_json(&error.to_frame()).await
    }

    /// True once the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// One framed, handshaken connection.
pub struct Connection {
    reader: FramedRead<BoxedReader, FrameCodec>,
    sender: FrameSender,
    assembler: PayloadAssembler,
    state: ConnectionState,
    handshake: Option<Handshake>,
    peer: Option<SocketAddr>,
    shutdown: CancellationToken,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wrap an accepted socket. The peer must send the handshake first.
    pub fn accept(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let mut conn = Self::from_stream(stream, ConnectionState::Handshake);
        conn.peer = peer;
        conn
    }

    /// Open an outbound connection and announce `handshake`.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        handshake: Handshake,
    ) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr().ok();
        stream.set_nodelay(true)?;
        let mut conn = Self::from_stream(stream, ConnectionState::Connecting);
        conn.peer = peer;
        conn.announce(handshake).await?;
        Ok(conn)
    }

    /// Wrap any byte stream. `state` is `Connecting` for the initiating
    /// side and `Handshake` for the accepting side.
    pub fn from_stream<S>(stream: S, state: ConnectionState) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let codec = FrameCodec::default();
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);

        let (sender, rx) = FrameSender::channel(SEND_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let sink = FramedWrite::new(write_half, codec.clone());
        let writer = tokio::spawn(write_loop(sink, rx, shutdown.clone()));

        Self {
            reader: FramedRead::new(reader, codec),
            sender,
            assembler: PayloadAssembler::new(),
            state,
            handshake: None,
            peer: None,
            shutdown,
            writer: Some(writer),
        }
    }

    /// Send our handshake (initiating side).
    pub async fn announce(&mut self, handshake: Handshake) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(ConnectionError::Protocol(ProtocolError::violation(
                "handshake already sent",
            )));
        }
        self.sender.send_json(&handshake).await?;
        self.handshake = Some(handshake);
        self.state = ConnectionState::Open;
        Ok(())
    }

    /// Read the peer's handshake (accepting side).
    ///
    /// An invalid handshake is answered with an error frame and the
    /// connection is closed.
    pub async fn accept_handshake(&mut self) -> Result<Handshake, ConnectionError> {
        if self.state != ConnectionState::Handshake {
            return Err(ConnectionError::Protocol(ProtocolError::violation(
                "handshake already received",
            )));
        }

        let frame = match self.reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                let error = ProtocolError::violation(e.to_string());
                self.fail(&error).await;
                return Err(ConnectionError::Frame(e));
            }
            None => {
                self.finish(ConnectionState::Closed).await;
                return Err(ConnectionError::Closed);
            }
        };

        let parsed = match frame {
            Frame::Text(text) => serde_json::from_str::<Handshake>(&text)
                .map_err(|e| ProtocolError::invalid_request(format!("invalid handshake: {}", e))),
            Frame::Binary(_) => Err(ProtocolError::violation(
                "binary frame received before handshake",
            )),
        };

        match parsed {
            Ok(handshake) => {
                self.handshake = Some(handshake.clone());
                self.state = ConnectionState::Open;
                Ok(handshake)
            }
            Err(error) => {
                self.fail(&error).await;
                Err(ConnectionError::Protocol(error))
            }
        }
    }

    /// Receive the next logical event.
    ///
    /// Returns `None` once the connection is closed. Framing violations are
    /// reported to the peer, the connection moves to `Errored` and the error
    /// is returned once.
    pub async fn recv(&mut self) -> Option<Result<Inbound, ConnectionError>> {
        if self.state != ConnectionState::Open {
            return None;
        }

        let frame = match self.reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(FrameError::Io(e))) => {
                self.finish(ConnectionState::Errored).await;
                return Some(Err(ConnectionError::Io(e)));
            }
            Some(Err(e)) => {
                let error = ProtocolError::violation(e.to_string());
                self.fail(&error).await;
                return Some(Err(ConnectionError::Frame(e)));
            }
            None => {
                self.finish(ConnectionState::Closed).await;
                return None;
            }
        };

        let result = match frame {
            Frame::Text(text) => self.assembler.on_text(&text),
            Frame::Binary(data) => self.assembler.on_binary(data),
        };

        match result {
            Ok(Inbound::Message(value)) => match ProtocolError::from_frame(&value) {
                Some(remote) => {
                    self.finish(ConnectionState::Errored).await;
                    Some(Err(ConnectionError::Remote(remote)))
                }
                None => Some(Ok(Inbound::Message(value))),
            },
            Ok(data) => Some(Ok(data)),
            Err(error) => {
                self.fail(&error).await;
                Some(Err(ConnectionError::Protocol(error)))
            }
        }
    }

    /// Receive the next JSON message, treating payload data as a violation.
    pub async fn recv_message(&mut self) -> Result<Value, ConnectionError> {
        match self.recv().await {
            Some(Ok(Inbound::Message(value))) => Ok(value),
            Some(Ok(Inbound::Data { .. })) => {
                let error = ProtocolError::violation("unexpected binary payload");
                self.fail(&error).await;
                Err(ConnectionError::Protocol(error))
            }
            Some(Err(e)) => Err(e),
            None => Err(ConnectionError::Closed),
        }
    }

    /// Receive the next fragment of the payload currently outstanding.
    pub async fn recv_data(&mut self) -> Result<(Bytes, bool), ConnectionError> {
        match self.recv().await {
            Some(Ok(Inbound::Data { data, last })) => Ok((data, last)),
            Some(Ok(Inbound::Message(_))) => {
                let error = ProtocolError::violation("expected payload data");
                self.fail(&error).await;
                Err(ConnectionError::Protocol(error))
            }
            Some(Err(e)) => Err(e),
            None => Err(ConnectionError::Closed),
        }
    }

    /// Collect a whole payload of `len` bytes into memory.
    pub async fn recv_payload(&mut self, len: u64) -> Result<Vec<u8>, ConnectionError> {
        let mut out = Vec::with_capacity(len as usize);
        if len == 0 {
            return Ok(out);
        }
        loop {
            let (data, last) = self.recv_data().await?;
            out.extend_from_slice(&data);
            if last {
                return Ok(out);
            }
        }
    }

    /// Report `error` to the peer, then close. The state becomes `Errored`.
    pub async fn fail(&mut self, error: &ProtocolError) {
        if self.state.is_terminal() {
            return;
        }
        tracing::debug!(peer = ?self.peer, code = %error.code, "{}", error.message);
        let _ = self.sender.send_error(error).await;
        self.finish(ConnectionState::Errored).await;
    }

    /// Flush queued frames and shut the socket down.
    pub async fn close(&mut self) {
        self.finish(ConnectionState::Closed).await;
    }

    async fn finish(&mut self, state: ConnectionState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        self.shutdown.cancel();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }

    /// A clone of the outbound handle.
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Payload bytes still expected from the peer.
    pub fn outstanding(&self) -> u64 {
        self.assembler.outstanding()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        tracing::debug!(error = %e, "connection writer stopped");
                        return;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(frame) = rx.recv().await {
                    if sink.send(frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}
