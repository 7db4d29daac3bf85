//! Read and write halves of a WebSocket connection.
//!
//! The transport is split with [`tokio::io::split`] so reading and writing
//! never wait on each other. [`ReadHalf`] is owned by whoever holds the read
//! lock of the connection. [`WriteHalf`] is shared: frames go through a sink
//! behind its own lock, taken once per frame, so a control frame can be sent
//! while a message writer is between two frames.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, PoisonError,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    codec::{Decoder, Encoder},
    frame::{Frame, OpCode},
    utf8::Utf8Validator,
    Result, WebSocketError,
};

use super::{with_deadline, MessageType, Options, Role};

// ================ ReadHalf ====================

/// The read side of a connection: the frame decoder and the state of the
/// message currently being received.
pub(super) struct ReadHalf<S> {
    stream: FramedRead<io::ReadHalf<S>, Decoder>,
    /// Message in progress, `None` between messages.
    message: Option<Incoming>,
    max_message_size: usize,
    check_utf8: bool,
    /// Set once the read side can not produce frames anymore.
    pub(super) terminated: bool,
}

/// State of a message whose final frame has not arrived yet.
struct Incoming {
    kind: MessageType,
    size: usize,
    utf8: Option<Utf8Validator>,
}

impl<S> ReadHalf<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(super) fn new(role: Role, stream: io::ReadHalf<S>, options: &Options) -> Self {
        let decoder = Decoder::new(role, options.payload_limit());
        Self {
            stream: FramedRead::with_capacity(stream, decoder, options.read_buffer()),
            message: None,
            max_message_size: options.message_limit(),
            check_utf8: options.check_utf8,
            terminated: false,
        }
    }

    /// Polls the decoder for the next frame, waiting at most until `deadline`.
    ///
    /// Decoding is cancellation safe, so a timeout leaves the half usable.
    pub(super) async fn next_frame(&mut self, deadline: Option<Instant>) -> Result<Frame> {
        if self.terminated {
            return Err(WebSocketError::ConnectionClosed);
        }

        match with_deadline(deadline, self.stream.next()).await? {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) => {
                self.terminated = true;
                Err(err)
            }
            None => {
                self.terminated = true;
                Err(WebSocketError::UnexpectedEof)
            }
        }
    }

    /// Returns `true` while a fragmented message is being received.
    pub(super) fn in_message(&self) -> bool {
        self.message.is_some()
    }

    /// Applies a data frame to the message state.
    ///
    /// Returns the message type, the frame payload and whether the frame
    /// completed the message.
    pub(super) fn on_data_frame(&mut self, frame: Frame) -> Result<(MessageType, Bytes, bool)> {
        match frame.opcode {
            OpCode::Continuation => {
                if self.message.is_none() {
                    return Err(WebSocketError::InvalidContinuationFrame);
                }
            }
            opcode => {
                if self.message.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                let kind = MessageType::from_opcode(opcode).ok_or(WebSocketError::InvalidFragment)?;
                let utf8 = (self.check_utf8 && kind == MessageType::Text)
                    .then(Utf8Validator::default);
                self.message = Some(Incoming {
                    kind,
                    size: 0,
                    utf8,
                });
            }
        }

        let Some(message) = self.message.as_mut() else {
            return Err(WebSocketError::InvalidContinuationFrame);
        };

        message.size += frame.payload.len();
        if message.size > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge);
        }

        if let Some(validator) = message.utf8.as_mut() {
            validator.feed(&frame.payload, frame.fin)?;
        }

        let kind = message.kind;
        let fin = frame.fin;
        if fin {
            self.message = None;
        }

        Ok((kind, frame.into_payload(), fin))
    }
}

// ================ WriteHalf ====================

/// The write side of a connection.
///
/// Every frame is written and flushed while holding the sink lock. Sends
/// race against [`WriteHalf::close`], which cancels them.
pub(super) struct WriteHalf<S> {
    sink: tokio::sync::Mutex<FramedWrite<io::WriteHalf<S>, Encoder>>,
    close_state: Mutex<CloseState>,
    /// A message writer is open.
    writer_open: AtomicBool,
    /// A write failed halfway; no further frames may be sent.
    broken: AtomicBool,
    /// Cancelled by [`WriteHalf::close`], wakes pending reads and writes.
    closed: CancellationToken,
    pub(super) write_buffer_size: usize,
}

/// Progress of the close handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum CloseState {
    /// No close frame was sent or received.
    Open,
    /// A close frame was sent, waiting for the peer.
    CloseSent,
    /// The peer sent a close frame that was not answered yet.
    CloseReceived,
    /// Both directions are closed, or the connection was closed abruptly.
    Closed,
}

impl<S> WriteHalf<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(super) fn new(role: Role, stream: io::WriteHalf<S>, options: &Options) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(FramedWrite::new(stream, Encoder::new(role))),
            close_state: Mutex::new(CloseState::Open),
            writer_open: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            closed: CancellationToken::new(),
            write_buffer_size: options.write_buffer(),
        }
    }

    /// Sends a single frame and flushes it, waiting at most until `deadline`.
    ///
    /// Sending a close frame moves the close state forward, and shuts the
    /// transport down once both directions are closed. A timed out or failed
    /// write leaves the connection broken since part of the frame may have
    /// been written.
    pub(super) async fn send_frame(&self, frame: Frame, deadline: Option<Instant>) -> Result<()> {
        let is_close = frame.opcode == OpCode::Close;

        let send = async {
            let mut sink = self.sink.lock().await;
            if self.is_broken() || self.close_sent() {
                return Err(WebSocketError::ConnectionClosed);
            }

            sink.send(frame).await?;

            if is_close && self.advance(CloseState::CloseSent) == CloseState::Closed {
                sink.get_mut().shutdown().await?;
            }

            Ok::<_, WebSocketError>(())
        };

        let res = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(WebSocketError::ConnectionClosed),
            res = with_deadline(deadline, send) => res.and_then(|res| res),
        };

        if let Err(WebSocketError::Timeout | WebSocketError::IoError(_)) = &res {
            self.mark_broken();
        }

        res
    }

    /// Records a received close frame.
    ///
    /// Returns `true` if no close frame was sent yet, meaning the caller
    /// has to answer it.
    pub(super) async fn on_close_received(&self) -> Result<bool> {
        match self.advance(CloseState::CloseReceived) {
            CloseState::Closed => {
                let mut sink = self.sink.lock().await;
                sink.get_mut().shutdown().await?;
                Ok(false)
            }
            _ => Ok(!self.is_broken()),
        }
    }

    /// Closes the connection without a close handshake.
    ///
    /// Pending sends fail with [`WebSocketError::ConnectionClosed`] and a
    /// blocked reader is woken up.
    pub(super) async fn close(&self) -> Result<()> {
        *self.lock_state() = CloseState::Closed;
        self.mark_broken();
        self.closed.cancel();

        let mut sink = self.sink.lock().await;
        sink.get_mut().shutdown().await?;
        Ok(())
    }

    /// Moves the close state forward after a close frame was sent
    /// (`CloseSent`) or received (`CloseReceived`), returning the new state.
    fn advance(&self, event: CloseState) -> CloseState {
        let mut state = self.lock_state();
        *state = match (*state, event) {
            (CloseState::Open, event) => event,
            (CloseState::CloseSent, CloseState::CloseReceived)
            | (CloseState::CloseReceived, CloseState::CloseSent) => CloseState::Closed,
            (current, _) => current,
        };
        *state
    }

    pub(super) fn close_state(&self) -> CloseState {
        *self.lock_state()
    }

    pub(super) fn close_sent(&self) -> bool {
        matches!(
            self.close_state(),
            CloseState::CloseSent | CloseState::Closed
        )
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CloseState> {
        self.close_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(super) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Waits until the connection is closed with [`WriteHalf::close`].
    pub(super) async fn cancelled(&self) {
        self.closed.cancelled().await
    }

    /// Claims the single message writer slot.
    pub(super) fn acquire_writer(&self) -> Result<()> {
        if self.is_broken() || self.close_sent() {
            return Err(WebSocketError::ConnectionClosed);
        }

        if self.writer_open.swap(true, Ordering::AcqRel) {
            return Err(WebSocketError::WriterBusy);
        }

        Ok(())
    }

    pub(super) fn release_writer(&self) {
        self.writer_open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn halves(options: &Options) -> (ReadHalf<io::DuplexStream>, WriteHalf<io::DuplexStream>, io::DuplexStream) {
        let (local, remote) = io::duplex(1024);
        let (read, write) = io::split(local);
        (
            ReadHalf::new(Role::Client, read, options),
            WriteHalf::new(Role::Server, write, options),
            remote,
        )
    }

    #[tokio::test]
    async fn test_close_state_transitions() {
        let (_read, write, _remote) = halves(&Options::default());
        assert_eq!(write.close_state(), CloseState::Open);

        write.send_frame(Frame::close_raw(b""), None).await.unwrap();
        assert_eq!(write.close_state(), CloseState::CloseSent);

        // nothing can be sent after a close frame
        assert!(matches!(
            write.send_frame(Frame::ping(b""), None).await,
            Err(WebSocketError::ConnectionClosed)
        ));

        assert!(!write.on_close_received().await.unwrap());
        assert_eq!(write.close_state(), CloseState::Closed);
    }

    #[tokio::test]
    async fn test_close_received_first_requires_reply() {
        let (_read, write, _remote) = halves(&Options::default());
        assert!(write.on_close_received().await.unwrap());
        assert_eq!(write.close_state(), CloseState::CloseReceived);

        write.send_frame(Frame::close_raw(b""), None).await.unwrap();
        assert_eq!(write.close_state(), CloseState::Closed);
    }

    #[tokio::test]
    async fn test_single_writer_slot() {
        let (_read, write, _remote) = halves(&Options::default());
        write.acquire_writer().unwrap();
        assert!(matches!(write.acquire_writer(), Err(WebSocketError::WriterBusy)));
        write.release_writer();
        write.acquire_writer().unwrap();
    }

    #[tokio::test]
    async fn test_fragment_ordering() {
        let (mut read, _write, _remote) = halves(&Options::default());

        assert!(matches!(
            read.on_data_frame(Frame::new(true, OpCode::Continuation, None, &b"x"[..])),
            Err(WebSocketError::InvalidContinuationFrame)
        ));

        let (kind, _, fin) = read
            .on_data_frame(Frame::new(false, OpCode::Text, None, &b"ab"[..]))
            .unwrap();
        assert_eq!(kind, MessageType::Text);
        assert!(!fin);
        assert!(read.in_message());

        assert!(matches!(
            read.on_data_frame(Frame::binary(b"x")),
            Err(WebSocketError::InvalidFragment)
        ));
    }

    #[tokio::test]
    async fn test_message_size_limit() {
        let (mut read, _write, _remote) = halves(&Options::default().with_max_message_size(4));

        read.on_data_frame(Frame::new(false, OpCode::Binary, None, &b"abc"[..]))
            .unwrap();
        assert!(matches!(
            read.on_data_frame(Frame::new(true, OpCode::Continuation, None, &b"de"[..])),
            Err(WebSocketError::MessageTooLarge)
        ));
    }
}
