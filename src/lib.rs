//! # wsconn
//! Implementation of the WebSocket protocol (RFC 6455) as a connection engine: it validates the
//! opening handshake, takes over the transport of an HTTP request, and then frames, masks,
//! fragments and reassembles messages over it until the close handshake completes.
//!
//! The engine does not run background tasks. Every operation is driven by the caller and all
//! methods on [`WebSocket`] take `&self`, so one task can read while another writes and a third
//! sends pings.
//!
//! # Features
//! The crate provides several optional features that can be enabled in your `Cargo.toml`:
//!
//! - `logging`: Enables debug logging for the handshake, the close handshake and protocol errors
//!   using the `log` crate.
//!
//! - `simd`: Uses `simdutf8` for UTF-8 validation of text messages.
//!
//! - `json`: Enables [`WebSocket::write_json`] and [`WebSocket::read_json`].
//!
//! ## Usage Example
//! ```toml
//! [dependencies]
//! wsconn = { version = "0.1", features = ["logging"] }
//! ```
//!
//! # Server Example
//! ```rust
//! use http_body_util::Empty;
//! use hyper::{Request, body::{Incoming, Bytes}, Response};
//! use wsconn::{Options, WebSocket};
//!
//! async fn server_upgrade(
//!     mut req: Request<Incoming>,
//! ) -> wsconn::Result<Response<Empty<Bytes>>> {
//!     let (response, fut) = WebSocket::upgrade_request(&mut req, Options::default())?;
//!
//!     tokio::spawn(async move {
//!         if let Ok(ws) = fut.await {
//!             while let Ok((kind, payload)) = ws.read_message().await {
//!                 if ws.write_message(kind, &payload).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         }
//!     });
//!
//!     Ok(response)
//! }
//! ```
//!
//! # Streaming Example
//! Messages do not have to be held in memory at once. A reader yields one chunk per frame and a
//! writer emits a frame each time its buffer fills up:
//! ```rust
//! use wsconn::{MessageType, WebSocket};
//! use tokio::io::{AsyncRead, AsyncWrite};
//!
//! async fn shout<S>(ws: &WebSocket<S>) -> wsconn::Result<()>
//! where
//!     S: AsyncRead + AsyncWrite + Unpin,
//! {
//!     let mut reader = ws.next_message().await?;
//!     let mut writer = ws.begin_message(reader.message_type())?;
//!     while let Some(chunk) = reader.next_chunk().await? {
//!         writer.write(&chunk.to_ascii_uppercase()).await?;
//!     }
//!     drop(reader);
//!     writer.finish().await
//! }
//! ```
//!
//! # Memory Safety
//! - Maximum frame payload and message size limits (configurable, 1 MiB and 2 MiB by default)
//! - Fixed capacity read and write buffers
//! - Optional UTF-8 validation for text messages

#![cfg_attr(docsrs, feature(doc_cfg))]

mod native;

pub mod close;
pub mod codec;
pub mod frame;
pub mod handshake;
pub mod hijack;
mod mask;
mod utf8;

use thiserror::Error;

pub use close::{CloseCode, CloseFrame};
pub use handshake::{accept_key, Handshake};
pub use hijack::Hijack;
pub use native::*;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Reasons an HTTP request cannot be upgraded.
///
/// These are recoverable: the caller still owns the request and should
/// answer it with a regular HTTP error, typically `400 Bad Request`.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// `Sec-WebSocket-Version` is missing or not `13`.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidVersion,

    /// The `Connection` header does not contain the `upgrade` token.
    #[error("Connection header must contain upgrade")]
    MissingConnectionUpgrade,

    /// The `Upgrade` header does not contain the `websocket` token.
    #[error("Upgrade header must contain websocket")]
    MissingUpgradeWebsocket,

    /// `Sec-WebSocket-Key` is missing or empty.
    #[error("Sec-WebSocket-Key header is missing or blank")]
    MissingKey,

    /// The client sent bytes before the handshake response.
    #[error("client sent data before handshake complete")]
    DataBeforeHandshake,

    /// A response header could not be represented as an HTTP header.
    #[error("invalid response header: {0}")]
    InvalidHeader(String),
}

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Handshake errors, wrapped in [`WebSocketError::Handshake`]
/// - Protocol errors (see [`WebSocketError::is_protocol`]), which fail the connection
/// - The close handshake ([`WebSocketError::Closed`]) and abrupt ends ([`WebSocketError::UnexpectedEof`])
/// - Deadlines ([`WebSocketError::Timeout`])
/// - API misuse ([`WebSocketError::WriterBusy`], [`WebSocketError::NotControlFrame`])
/// - I/O and HTTP errors
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The request is not a valid WebSocket upgrade.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Occurs when receiving a WebSocket fragment that violates RFC 6455 fragmentation rules,
    /// such as receiving a new data frame before completing the previous message.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Indicates that a text message or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Returned when attempting to perform operations on a closed WebSocket connection.
    /// Once a connection is closed, no further communication is possible.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The peer closed the connection. Carries the close frame it sent.
    #[error("{0}")]
    Closed(CloseFrame),

    /// The transport ended without a close frame.
    #[error("unexpected EOF")]
    UnexpectedEof,

    /// Indicates that a received close frame has an invalid format, such as
    /// containing a payload of 1 byte (close frames must be either empty or ≥2 bytes).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame contains a status code that may not be sent over the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Indicates that reserved bits in the WebSocket frame header are set.
    /// No extension is negotiated, so they must be 0.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit
    /// not set. RFC 6455 requires that control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a received frame's payload length exceeds the maximum configured size.
    /// This helps prevent memory exhaustion attacks.
    #[error("Frame too large")]
    FrameTooLarge,

    /// The accumulated size of a fragmented message exceeds the configured maximum.
    #[error("Message too large")]
    MessageTooLarge,

    /// Indicates receipt of a frame with a reserved opcode.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A masked frame travelling from server to client, or a masked frame handed to a server encoder.
    #[error("Unexpected masked frame")]
    UnexpectedMask,

    /// An unmasked frame travelling from client to server.
    #[error("Missing frame mask")]
    MissingMask,

    /// A read or write deadline expired.
    #[error("deadline exceeded")]
    Timeout,

    /// A message writer is already open on this connection.
    #[error("concurrent message writers")]
    WriterBusy,

    /// A data frame was passed where only control frames are accepted.
    #[error("not a control frame")]
    NotControlFrame,

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from the hyper HTTP library that may occur during the
    /// connection upgrade.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Returns `true` if the error is a violation of the framing protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::InvalidFragment
                | Self::InvalidUTF8
                | Self::InvalidContinuationFrame
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode
                | Self::ReservedBitsNotZero
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::FrameTooLarge
                | Self::MessageTooLarge
                | Self::InvalidOpCode(_)
                | Self::UnexpectedMask
                | Self::MissingMask
        )
    }

    /// Returns the close frame received from the peer, if this error reports one.
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        match self {
            Self::Closed(frame) => Some(frame),
            _ => None,
        }
    }

    /// The status code sent to the peer when this error fails the connection.
    pub(crate) fn close_code(&self) -> CloseCode {
        match self {
            Self::FrameTooLarge | Self::MessageTooLarge => CloseCode::Size,
            Self::InvalidOpCode(_) => CloseCode::Unsupported,
            Self::InvalidUTF8 => CloseCode::Invalid,
            err if err.is_protocol() => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}

impl From<WebSocketError> for std::io::Error {
    fn from(err: WebSocketError) -> Self {
        use std::io::ErrorKind;

        match err {
            WebSocketError::IoError(err) => err,
            WebSocketError::Timeout => Self::new(ErrorKind::TimedOut, err),
            WebSocketError::UnexpectedEof => Self::new(ErrorKind::UnexpectedEof, err),
            WebSocketError::ConnectionClosed | WebSocketError::Closed(_) => {
                Self::new(ErrorKind::ConnectionAborted, err)
            }
            err if err.is_protocol() => Self::new(ErrorKind::InvalidData, err),
            err => Self::other(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(WebSocketError::FrameTooLarge.close_code(), CloseCode::Size);
        assert_eq!(WebSocketError::MessageTooLarge.close_code(), CloseCode::Size);
        assert_eq!(WebSocketError::InvalidOpCode(3).close_code(), CloseCode::Unsupported);
        assert_eq!(WebSocketError::InvalidUTF8.close_code(), CloseCode::Invalid);
        assert_eq!(WebSocketError::MissingMask.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::Timeout.close_code(), CloseCode::Error);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: std::io::Error = WebSocketError::Timeout.into();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        let err: std::io::Error = WebSocketError::ReservedBitsNotZero.into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let inner = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: std::io::Error = WebSocketError::IoError(inner).into();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_close_frame_accessor() {
        let err = WebSocketError::Closed(CloseFrame::new(CloseCode::Away, "bye"));
        assert_eq!(err.close_frame().and_then(|f| f.code), Some(CloseCode::Away));
        assert!(WebSocketError::Timeout.close_frame().is_none());
    }
}
