//! Supervisor channel - owns the connection and its single write path.
//!
//! Flow:
//! 1. `connect` opens a TCP stream (or `attach` adopts any duplex stream)
//! 2. The read half goes to the receive loop, the write half behind a mutex
//! 3. A `connection` message announces the pid
//! 4. `close` says `disconnect`, releases the stream and joins the receive loop
//!
//! State only moves forward: Disconnected -> Connected -> Closing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::bridge::codec::{JsonCodec, frame_codec};
use crate::bridge::protocol::{LinkStatus, Message, MessageType};
use crate::receiver;
use crate::router::Router;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECEIVE_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<Message>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Disconnected = 0,
    Connected = 1,
    Closing = 2,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connected,
            _ => Self::Closing,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("channel is {0:?} and cannot be opened again")]
    NotReusable(ChannelState),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    /// How long one `receive` waits before reporting "nothing yet".
    pub receive_poll: Duration,
    /// Bound on waiting for the receive loop during `close`.
    pub close_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receive_poll: DEFAULT_RECEIVE_POLL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

struct Shared {
    state: AtomicU8,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Cloneable handle onto the channel's write path.
///
/// The main path (status events, workload emits) and the router (replies)
/// both send through here; the writer mutex keeps each prefix+body frame
/// contiguous on the wire.
#[derive(Clone)]
pub struct ChannelSender {
    shared: Arc<Shared>,
}

impl ChannelSender {
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Send one message. Returns false when not connected or on I/O failure.
    pub async fn send(&self, kind: MessageType, payload: Value) -> bool {
        if !self.is_connected() {
            tracing::debug!(message_type = %kind, "Cannot send message: channel not connected");
            return false;
        }

        let message = Message::new(kind, payload);
        let message_id = message.id().to_string();

        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        match writer.send(message).await {
            Ok(()) => {
                tracing::debug!(message_id = %message_id, "Message sent");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to send message");
                self.mark_closing();
                false
            }
        }
    }

    /// Serialize `payload` and send it.
    pub async fn send_json<T: Serialize>(&self, kind: MessageType, payload: &T) -> bool {
        match serde_json::to_value(payload) {
            Ok(value) => self.send(kind, value).await,
            Err(e) => {
                tracing::warn!(message_type = %kind, error = %e, "Failed to encode payload");
                false
            }
        }
    }

    /// Connected -> Closing. Any other state is left as is.
    pub(crate) fn mark_closing(&self) {
        let _ = self.shared.state.compare_exchange(
            ChannelState::Connected as u8,
            ChannelState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Reader side of the channel.
///
/// Framing and parsing are separate steps: a frame whose body is not a
/// valid [`Message`] is dropped without losing the frame boundary.
pub struct FrameReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

/// Result of one bounded receive.
#[derive(Debug)]
pub enum Received {
    Message(Message),
    /// Nothing usable arrived within the wait; the stream is still open.
    Idle,
    /// Peer closed, short read, I/O failure or an oversized length prefix.
    Closed,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, frame_codec()),
        }
    }

    /// Wait up to `wait` for one complete frame.
    ///
    /// A partially received frame stays buffered across `Idle` results; a
    /// stream that ends mid-frame is reported as `Closed`, never as a
    /// truncated message. A complete frame that does not parse is logged
    /// and reported as `Idle`.
    pub async fn receive(&mut self, wait: Duration) -> Received {
        match tokio::time::timeout(wait, self.inner.next()).await {
            Err(_) => Received::Idle,
            Ok(Some(Ok(body))) => match serde_json::from_slice::<Message>(&body) {
                Ok(message) => {
                    tracing::debug!(message_id = message.id(), "Message received");
                    Received::Message(message)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        body_bytes = body.len(),
                        "Dropping frame that is not a valid message"
                    );
                    Received::Idle
                }
            },
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "Failed to receive message");
                Received::Closed
            }
            Ok(None) => {
                tracing::debug!("Peer closed the channel");
                Received::Closed
            }
        }
    }
}

pub struct Channel {
    shared: Arc<Shared>,
    receiver: Option<JoinHandle<()>>,
    config: ChannelConfig,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(ChannelState::Disconnected as u8),
                writer: tokio::sync::Mutex::new(None),
            }),
            receiver: None,
            config,
        }
    }

    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Connect over TCP and start the receive loop. Failures are logged and
    /// reported as `false`; running without a channel is a valid mode.
    pub async fn connect(&mut self, host: &str, port: u16, router: Router) -> bool {
        tracing::info!(host, port, "Establishing communication");
        match self.open_tcp(host, port).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                self.attach(stream, router).await
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to establish communication");
                false
            }
        }
    }

    async fn open_tcp(&self, host: &str, port: u16) -> Result<TcpStream, ChannelError> {
        let state = self.state();
        if state != ChannelState::Disconnected {
            return Err(ChannelError::NotReusable(state));
        }

        let addr = format!("{host}:{port}");
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ChannelError::Connect { addr, source }),
            Err(_) => Err(ChannelError::ConnectTimeout { addr, timeout }),
        }
    }

    /// Adopt an already-open duplex stream as the channel transport.
    pub async fn attach<S>(&mut self, stream: S, router: Router) -> bool
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let state = self.state();
        if state != ChannelState::Disconnected {
            tracing::warn!(error = %ChannelError::NotReusable(state), "Refusing to attach stream");
            return false;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        *self.shared.writer.lock().await = Some(FramedWrite::new(writer, JsonCodec::new()));
        self.shared.set_state(ChannelState::Connected);

        self.receiver = Some(tokio::spawn(receiver::run(
            FrameReader::new(read_half),
            router,
            self.sender(),
            self.config.receive_poll,
        )));

        tracing::info!("Communication channel established");

        let hello = LinkStatus::Connected {
            pid: std::process::id(),
        };
        if !self.sender().send_json(MessageType::Connection, &hello).await {
            tracing::warn!("Failed to announce connection");
        }
        true
    }

    /// Best-effort `disconnect`, release the stream, join the receive loop.
    /// Safe to call any number of times, including on a never-opened channel.
    pub async fn close(&mut self) {
        if self.state() == ChannelState::Disconnected {
            return;
        }

        let limit = self.config.close_timeout;
        if self.is_connected() {
            tracing::info!("Closing communication channel");
            let sender = self.sender();
            let goodbye = sender.send_json(MessageType::Disconnect, &LinkStatus::Disconnecting);
            if tokio::time::timeout(limit, goodbye).await.is_err() {
                tracing::warn!(timeout = ?limit, "Peer did not take disconnect in time");
            }
        }
        self.shared.set_state(ChannelState::Closing);

        let release = async {
            let writer = self.shared.writer.lock().await.take();
            if let Some(mut writer) = writer
                && let Err(e) = writer.close().await
            {
                tracing::debug!(error = %e, "Error shutting down channel writer");
            }
        };
        if tokio::time::timeout(limit, release).await.is_err() {
            tracing::warn!(timeout = ?limit, "Channel writer did not shut down in time");
        }

        if let Some(mut handle) = self.receiver.take() {
            match tokio::time::timeout(limit, &mut handle).await {
                Ok(_) => tracing::info!("Communication channel closed"),
                Err(_) => {
                    tracing::warn!(
                        timeout = ?limit,
                        "Receive loop did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::inbox::Inbox;
    use crate::limits::ResourceLimits;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// The supervising side of an in-memory channel.
    pub struct Peer {
        pub reader: FramedRead<ReadHalf<DuplexStream>, JsonCodec<Message>>,
        pub writer: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Message>>,
    }

    impl Peer {
        pub async fn next(&mut self) -> Option<Message> {
            match tokio::time::timeout(Duration::from_secs(5), self.reader.next()).await {
                Ok(Some(Ok(m))) => Some(m),
                _ => None,
            }
        }

        /// Next message that is not the `connection` greeting.
        pub async fn next_non_greeting(&mut self) -> Option<Message> {
            loop {
                let m = self.next().await?;
                if m.kind() != &MessageType::Connection {
                    return Some(m);
                }
            }
        }

        pub async fn send(&mut self, kind: MessageType, payload: Value) {
            self.writer.send(Message::new(kind, payload)).await.unwrap();
        }
    }

    pub fn fast_config() -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_millis(500),
            receive_poll: Duration::from_millis(20),
            close_timeout: Duration::from_secs(2),
        }
    }

    /// Channel attached to an in-memory peer, plus the shared inbox.
    pub async fn connected_pair() -> (Channel, Peer, Arc<Inbox>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let mut channel = Channel::with_config(fast_config());
        let inbox = Arc::new(Inbox::new());
        let router = Router::new(
            channel.sender(),
            Arc::clone(&inbox),
            Arc::new(ResourceLimits::requested(512, 80.0)),
        );
        assert!(channel.attach(ours, router).await);

        let (r, w) = tokio::io::split(theirs);
        let peer = Peer {
            reader: FramedRead::new(r, JsonCodec::new()),
            writer: FramedWrite::new(w, JsonCodec::new()),
        };
        (channel, peer, inbox)
    }
}
