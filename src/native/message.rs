//! Streaming access to single messages.
//!
//! A [`MessageReader`] yields the payload of an incoming message one frame at
//! a time, without buffering the whole message. A [`MessageWriter`] slices an
//! outgoing message into frames as the caller supplies bytes.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite},
    sync::MutexGuard,
};
use tokio_util::io::StreamReader;

use crate::{
    frame::{Frame, OpCode},
    Result,
};

use super::{split::ReadHalf, WebSocket};

/// The type of a data message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// UTF-8 text.
    Text,
    /// Arbitrary bytes.
    Binary,
}

impl MessageType {
    /// The opcode of the first frame of a message of this type.
    pub fn opcode(self) -> OpCode {
        match self {
            Self::Text => OpCode::Text,
            Self::Binary => OpCode::Binary,
        }
    }

    /// The message type started by a frame with `opcode`, if any.
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::Text => Some(Self::Text),
            OpCode::Binary => Some(Self::Binary),
            _ => None,
        }
    }
}

// ================ MessageReader ====================

/// Reads one incoming message frame by frame.
///
/// The reader holds the read side of the connection until it is dropped. It
/// can be dropped before the message ends: the next call to
/// [`WebSocket::next_message`] skips whatever is left of it.
pub struct MessageReader<'a, S> {
    ws: &'a WebSocket<S>,
    read: MutexGuard<'a, ReadHalf<S>>,
    kind: MessageType,
    /// Payload of the first frame, read while locating the message.
    first: Option<Bytes>,
    done: bool,
}

impl<'a, S> MessageReader<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(super) fn new(
        ws: &'a WebSocket<S>,
        read: MutexGuard<'a, ReadHalf<S>>,
        kind: MessageType,
        first: Bytes,
        done: bool,
    ) -> Self {
        Self {
            ws,
            read,
            kind,
            first: Some(first),
            done,
        }
    }

    /// The type of the message being read.
    pub fn message_type(&self) -> MessageType {
        self.kind
    }

    /// Returns the payload of the next frame of the message, or `None` once
    /// the final frame was returned.
    ///
    /// Control frames arriving in between are handled on the way. After an
    /// error the reader returns `None`.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }

        if self.done {
            return Ok(None);
        }

        match self.ws.read_data(&mut self.read).await {
            Ok((_, chunk, fin)) => {
                self.done = fin;
                Ok(Some(chunk))
            }
            Err(err) => {
                self.done = true;
                Err(err)
            }
        }
    }

    /// Reads the rest of the message into a single buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let Some(first) = self.next_chunk().await? else {
            return Ok(Bytes::new());
        };

        // a message of a single frame needs no copy
        let Some(second) = self.next_chunk().await? else {
            return Ok(first);
        };

        let mut payload = BytesMut::with_capacity(first.len() + second.len());
        payload.extend_from_slice(&first);
        payload.extend_from_slice(&second);
        while let Some(chunk) = self.next_chunk().await? {
            payload.extend_from_slice(&chunk);
        }

        Ok(payload.freeze())
    }

    /// Turns the reader into a stream of payload chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + 'a {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), reader)),
                Ok(None) => None,
                Err(err) => Some((Err(err), reader)),
            }
        })
    }

    /// Turns the reader into an [`AsyncBufRead`] over the message payload.
    ///
    /// WebSocket errors surface as [`std::io::Error`]s. The returned reader
    /// is not `Unpin`; pin it before use, e.g. with [`tokio::pin!`].
    pub fn into_async_read(self) -> impl AsyncBufRead + 'a {
        StreamReader::new(self.into_stream())
    }
}

// ================ MessageWriter ====================

/// Writes one outgoing message, emitting a frame each time the write buffer
/// fills up.
///
/// Only one writer can be open per connection. Call [`MessageWriter::finish`]
/// to send the final frame. Dropping a writer that already sent frames
/// leaves the peer with half a message, so the connection is marked broken
/// and refuses further writes.
pub struct MessageWriter<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws: &'a WebSocket<S>,
    kind: MessageType,
    buf: BytesMut,
    capacity: usize,
    started: bool,
    finished: bool,
}

impl<'a, S> MessageWriter<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(super) fn new(ws: &'a WebSocket<S>, kind: MessageType, capacity: usize) -> Self {
        Self {
            ws,
            kind,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            started: false,
            finished: false,
        }
    }

    /// Appends `data` to the message.
    ///
    /// A non-final frame is sent whenever the buffer is full and more data
    /// follows, so the final frame is never empty unless the whole message is.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.buf.len() == self.capacity {
                self.flush_frame(false).await?;
            }

            let n = (self.capacity - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
        }

        Ok(())
    }

    /// Sends the final frame of the message.
    pub async fn finish(mut self) -> Result<()> {
        self.flush_frame(true).await?;
        self.finished = true;
        Ok(())
    }

    async fn flush_frame(&mut self, fin: bool) -> Result<()> {
        let opcode = if self.started {
            OpCode::Continuation
        } else {
            self.kind.opcode()
        };

        let payload = self.buf.split();
        self.buf.reserve(self.capacity);

        self.started = true;
        self.ws
            .write_half
            .send_frame(Frame::new(fin, opcode, None, payload), self.ws.write_deadline())
            .await
    }
}

impl<S> Drop for MessageWriter<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn drop(&mut self) {
        if self.started && !self.finished {
            #[cfg(feature = "logging")]
            log::warn!("message writer dropped in the middle of a message");

            self.ws.write_half.mark_broken();
        }

        self.ws.write_half.release_writer();
    }
}
