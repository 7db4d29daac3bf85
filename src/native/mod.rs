mod message;
mod options;
mod split;
mod upgrade;

use crate::{
    close::{CloseCode, CloseFrame},
    frame, Result, WebSocketError,
};

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::Response;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Instant,
};

pub use frame::{Frame, OpCode};
pub use message::{MessageReader, MessageType, MessageWriter};
pub use options::Options;
pub use upgrade::{HttpStream, UpgradeFut};

use split::{ReadHalf, WriteHalf};

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit will be rejected to ensure memory safety
/// and prevent excessively large messages from impacting performance.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum allowed size of a message, summed over all of its frames, set to 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default capacity of the read and write buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Type alias for HTTP responses used during WebSocket upgrade.
///
/// This alias represents the HTTP response sent back to clients after a WebSocket upgrade request.
/// It uses hyper's `Response` type with an empty body.
pub type HttpResponse = Response<Empty<Bytes>>;

/// Type alias for the result of a hyper WebSocket upgrade, the response to
/// send and the future resolving to the connection.
pub type UpgradeResult = Result<(HttpResponse, UpgradeFut)>;

/// The role the WebSocket stream is taking.
///
/// The server reads masked frames and writes unmasked ones, the client does the opposite.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

type PingHandler = Arc<dyn Fn(&[u8]) -> Option<Bytes> + Send + Sync>;
type PongHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&CloseFrame) -> CloseFrame + Send + Sync>;

#[derive(Default)]
struct Handlers {
    ping: Option<PingHandler>,
    pong: Option<PongHandler>,
    close: Option<CloseHandler>,
}

/// Deadlines applying to the next operations on each path.
#[derive(Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

/// Runs `fut` to completion, or fails with [`WebSocketError::Timeout`] once `deadline` passes.
pub(crate) async fn with_deadline<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| WebSocketError::Timeout),
        None => Ok(fut.await),
    }
}

/// A WebSocket connection over a byte stream `S`.
///
/// The connection is driven entirely by its callers; it starts no tasks. All
/// methods take `&self`, and the connection can be shared across tasks with an
/// [`Arc`]. The read path and the write path are guarded independently:
///
/// - One message is read at a time. [`WebSocket::next_message`] holds the read
///   side until the returned [`MessageReader`] is dropped; a concurrent call
///   waits for it.
/// - One message is written at a time. A second [`WebSocket::begin_message`]
///   while a [`MessageWriter`] is open fails with [`WebSocketError::WriterBusy`].
/// - Control frames ([`WebSocket::ping`], [`WebSocket::pong`],
///   [`WebSocket::send_close`], [`WebSocket::send_control`]) and
///   [`WebSocket::close`] can be sent at any time. Frames are written whole,
///   so a control frame lands between two frames of an open writer.
///
/// Ping, pong and close frames received while reading are handled
/// automatically: pings are answered, pongs are passed to the pong handler,
/// and a close frame is answered before the read fails with
/// [`WebSocketError::Closed`].
///
/// # Example
/// ```no_run
/// use tokio::net::TcpStream;
/// use wsconn::{MessageType, Options, Role, WebSocket};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     // a stream that already completed the opening handshake
///     let stream = TcpStream::connect("127.0.0.1:9001").await?;
///     let ws = WebSocket::from_stream(Role::Client, stream, Options::default());
///
///     ws.write_message(MessageType::Text, b"hello").await?;
///     let (kind, payload) = ws.read_message().await?;
///     println!("{kind:?}: {payload:?}");
///
///     Ok(())
/// }
/// ```
pub struct WebSocket<S> {
    role: Role,
    read_half: tokio::sync::Mutex<ReadHalf<S>>,
    write_half: WriteHalf<S>,
    handlers: Mutex<Handlers>,
    deadlines: Mutex<Deadlines>,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream that already completed the opening handshake.
    pub fn from_stream(role: Role, stream: S, options: Options) -> Self {
        let (read, write) = tokio::io::split(stream);

        Self {
            role,
            read_half: tokio::sync::Mutex::new(ReadHalf::new(role, read, &options)),
            write_half: WriteHalf::new(role, write, &options),
            handlers: Mutex::new(Handlers::default()),
            deadlines: Mutex::new(Deadlines::default()),
        }
    }

    /// Validates the request `headers` and completes the server handshake over `io`.
    ///
    /// Shorthand for [`Handshake::validate`](crate::Handshake::validate) followed by
    /// [`Handshake::upgrade`](crate::Handshake::upgrade).
    pub async fn upgrade<H>(io: H, headers: &hyper::HeaderMap, options: Options) -> Result<Self>
    where
        H: crate::Hijack<Stream = S>,
    {
        crate::Handshake::validate(headers)?
            .upgrade(io, options)
            .await
    }

    /// The role this endpoint plays.
    pub fn role(&self) -> Role {
        self.role
    }

    // ======== reading =============

    /// Waits for the next data message and returns a reader over its frames.
    ///
    /// Whatever is left of a previous message that was not read to its end is
    /// skipped first.
    pub async fn next_message(&self) -> Result<MessageReader<'_, S>> {
        let mut read = self.read_half.lock().await;

        while read.in_message() {
            self.read_data(&mut read).await?;
        }

        let (kind, first, fin) = self.read_data(&mut read).await?;
        Ok(MessageReader::new(self, read, kind, first, fin))
    }

    /// Reads a whole message.
    pub async fn read_message(&self) -> Result<(MessageType, Bytes)> {
        let reader = self.next_message().await?;
        let kind = reader.message_type();
        Ok((kind, reader.read_to_end().await?))
    }

    /// Reads the next message and deserializes it from JSON.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn read_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let (_, payload) = self.read_message().await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Reads frames until the next data frame, handling control frames on the way.
    async fn read_data(&self, read: &mut ReadHalf<S>) -> Result<(MessageType, Bytes, bool)> {
        loop {
            let frame = self.read_frame(read).await?;
            match frame.opcode {
                OpCode::Ping => self.on_ping(frame).await?,
                OpCode::Pong => self.on_pong(frame),
                OpCode::Close => return Err(self.on_close(read, frame).await),
                _ => {
                    return match read.on_data_frame(frame) {
                        Ok(data) => Ok(data),
                        Err(err) => Err(self.fail(read, err).await),
                    }
                }
            }
        }
    }

    async fn read_frame(&self, read: &mut ReadHalf<S>) -> Result<Frame> {
        let deadline = self.lock_deadlines().read;

        let next = tokio::select! {
            biased;
            _ = self.write_half.cancelled() => None,
            next = read.next_frame(deadline) => Some(next),
        };

        match next {
            None => {
                read.terminated = true;
                Err(WebSocketError::ConnectionClosed)
            }
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) if err.is_protocol() => Err(self.fail(read, err).await),
            // recoverable, or the read side already ended
            Some(Err(err @ (WebSocketError::Timeout | WebSocketError::ConnectionClosed))) => Err(err),
            Some(Err(err)) => Err(self.terminate(read, err).await),
        }
    }

    async fn on_ping(&self, frame: Frame) -> Result<()> {
        let handler = self.lock_handlers().ping.clone();
        let reply = match handler {
            Some(handler) => handler(&frame.payload),
            None => Some(frame.into_payload()),
        };

        let Some(payload) = reply else {
            return Ok(());
        };

        match self
            .write_half
            .send_frame(Frame::pong(payload), self.write_deadline())
            .await
        {
            // a pong after our close frame is not needed
            Err(WebSocketError::ConnectionClosed)
                if !self.write_half.is_broken() && self.write_half.close_sent() =>
            {
                Ok(())
            }
            res => res,
        }
    }

    fn on_pong(&self, frame: Frame) {
        let handler = self.lock_handlers().pong.clone();
        if let Some(handler) = handler {
            handler(&frame.payload);
        }
    }

    /// Handles a close frame from the peer and returns the error ending the read.
    async fn on_close(&self, read: &mut ReadHalf<S>, frame: Frame) -> WebSocketError {
        let close = match CloseFrame::parse(&frame.payload) {
            Ok(close) => close,
            Err(err) => return self.fail(read, err).await,
        };
        read.terminated = true;

        #[cfg(feature = "logging")]
        log::debug!("{} received {close}", self.role);

        match self.write_half.on_close_received().await {
            Ok(true) => {
                let handler = self.lock_handlers().close.clone();
                let echo = || CloseFrame::new(close.code.unwrap_or(CloseCode::Normal), "");
                let reply = match handler {
                    Some(handler) => Some(handler(&close))
                        .filter(|reply| reply.code.is_none_or(CloseCode::is_allowed))
                        .unwrap_or_else(echo),
                    None => echo(),
                };

                let _ = self
                    .write_half
                    .send_frame(Frame::close(&reply), self.write_deadline())
                    .await;
            }
            Ok(false) => {}
            Err(err) => return err,
        }

        WebSocketError::Closed(close)
    }

    /// Fails the connection on a protocol violation, telling the peer why.
    async fn fail(&self, read: &mut ReadHalf<S>, err: WebSocketError) -> WebSocketError {
        #[cfg(feature = "logging")]
        log::warn!("{} failing connection: {err}", self.role);

        let close = CloseFrame::new(err.close_code(), err.to_string());
        let _ = self
            .write_half
            .send_frame(Frame::close(&close), self.write_deadline())
            .await;

        self.terminate(read, err).await
    }

    /// Ends both directions after a fatal read error.
    async fn terminate(&self, read: &mut ReadHalf<S>, err: WebSocketError) -> WebSocketError {
        read.terminated = true;

        #[cfg(feature = "logging")]
        log::debug!("{} connection terminated: {err}", self.role);

        let _ = self.write_half.close().await;
        err
    }

    // ======== writing =============

    /// Opens a writer for a new message of type `kind`.
    ///
    /// Fails with [`WebSocketError::WriterBusy`] if another writer is open.
    pub fn begin_message(&self, kind: MessageType) -> Result<MessageWriter<'_, S>> {
        self.write_half.acquire_writer()?;
        Ok(MessageWriter::new(
            self,
            kind,
            self.write_half.write_buffer_size,
        ))
    }

    /// Writes a whole message, fragmented into frames of at most the write buffer size.
    pub async fn write_message(&self, kind: MessageType, payload: &[u8]) -> Result<()> {
        let mut writer = self.begin_message(kind)?;
        writer.write(payload).await?;
        writer.finish().await
    }

    /// Serializes `value` as JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn write_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.write_message(MessageType::Text, &payload).await
    }

    /// Sends a single control frame, waiting at most until `deadline`.
    ///
    /// The frame is written whole, between the frames of any message being written.
    pub async fn send_control(&self, frame: Frame, deadline: Option<Instant>) -> Result<()> {
        if !frame.opcode.is_control() {
            return Err(WebSocketError::NotControlFrame);
        }

        if frame.payload.len() > frame::MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        // close payloads follow the same rules in both directions
        if frame.opcode == OpCode::Close {
            CloseFrame::parse(&frame.payload)?;
        }

        #[cfg(feature = "logging")]
        if frame.opcode == OpCode::Close {
            log::debug!("{} sending close", self.role);
        }

        self.write_half.send_frame(frame, deadline).await
    }

    /// Sends a ping with `payload`, using the write deadline.
    pub async fn ping(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_control(Frame::ping(payload), self.write_deadline())
            .await
    }

    /// Sends an unsolicited pong with `payload`, using the write deadline.
    pub async fn pong(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_control(Frame::pong(payload), self.write_deadline())
            .await
    }

    /// Starts the close handshake by sending `close`.
    ///
    /// Keep reading until the peer's close frame arrives as
    /// [`WebSocketError::Closed`]; the transport is then shut down.
    pub async fn send_close(&self, close: CloseFrame) -> Result<()> {
        self.send_control(Frame::close(&close), self.write_deadline())
            .await
    }

    /// Closes the transport immediately, without a close handshake.
    ///
    /// Pending reads and writes fail with [`WebSocketError::ConnectionClosed`].
    pub async fn close(&self) -> Result<()> {
        #[cfg(feature = "logging")]
        log::debug!("{} closing connection", self.role);

        self.write_half.close().await
    }
}

impl<S> WebSocket<S> {
    // ======== deadlines and handlers =============

    /// Sets the deadline for reads. `None` disables it.
    ///
    /// A read that times out fails with [`WebSocketError::Timeout`] and can be retried.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.lock_deadlines().read = deadline;
    }

    /// Sets the deadline for writes. `None` disables it.
    ///
    /// A write that times out fails with [`WebSocketError::Timeout`] and leaves the
    /// connection broken, since the peer may have received part of a frame.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.lock_deadlines().write = deadline;
    }

    /// Installs the handler for received pings.
    ///
    /// The handler returns the payload of the pong to send back, or `None` to
    /// stay silent. By default a ping is answered with its own payload.
    pub fn set_ping_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.lock_handlers().ping = Some(Arc::new(handler));
    }

    /// Installs the handler for received pongs. By default pongs are ignored.
    pub fn set_pong_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.lock_handlers().pong = Some(Arc::new(handler));
    }

    /// Installs the handler choosing the close frame sent in reply to the peer's.
    ///
    /// By default the peer's status code is echoed, or `1000` if it sent none.
    pub fn set_close_handler<F>(&self, handler: F)
    where
        F: Fn(&CloseFrame) -> CloseFrame + Send + Sync + 'static,
    {
        self.lock_handlers().close = Some(Arc::new(handler));
    }

    fn write_deadline(&self) -> Option<Instant> {
        self.lock_deadlines().write
    }

    fn lock_deadlines(&self) -> std::sync::MutexGuard<'_, Deadlines> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
