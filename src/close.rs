//! # Close
//!
//! Status codes and payload parsing for close frames, as defined in
//! [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! A close frame payload is either empty, or a 2-byte big-endian status code
//! optionally followed by a UTF-8 reason. An empty payload is a valid signal on
//! its own: the peer closed without giving a status, which [`CloseFrame`]
//! represents with `code == None`.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{frame::MAX_CONTROL_PAYLOAD, WebSocketError};

/// Status code carried by a close frame.
///
/// The named variants are the codes registered by RFC 6455 and the IANA
/// registry. Codes outside those ranges are kept as raw values so they can be
/// echoed back or inspected by the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: the endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: the connection was closed without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007: data within a message was inconsistent with its type (e.g. invalid UTF-8).
    Invalid,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension.
    Extension,
    /// 1011: the server encountered an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: the server is overloaded, try again later.
    Again,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// 1004, 1014 and 1016..=2999: reserved by the protocol.
    Reserved(u16),
    /// 3000..=3999: registered with IANA.
    Iana(u16),
    /// 4000..=4999: reserved for private use by applications.
    Library(u16),
    /// Anything below 1000 or above 4999.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if this code may legally appear in a close frame sent over the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Bad(_)
                | CloseCode::Reserved(_)
                | CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1004 | 1014 | 1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code: u16 = (*self).into();
        write!(f, "{code}")
    }
}

/// The decoded payload of a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code, or `None` when the peer sent an empty close frame.
    pub code: Option<CloseCode>,
    /// Reason text, empty when absent.
    pub reason: String,
}

impl CloseFrame {
    /// Creates a close frame payload with the given code and reason.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    /// A close frame without status code.
    pub fn empty() -> Self {
        Self {
            code: None,
            reason: String::new(),
        }
    }

    /// Parses a received close frame payload.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseFrame`] for a 1-byte payload
    /// - [`WebSocketError::InvalidUTF8`] when the reason is not UTF-8
    /// - [`WebSocketError::InvalidCloseCode`] when the code may not be sent on the wire
    pub fn parse(payload: &[u8]) -> Result<Self, WebSocketError> {
        match payload.len() {
            0 => Ok(Self::empty()),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }

                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WebSocketError::InvalidUTF8)?;

                Ok(Self {
                    code: Some(code),
                    reason: reason.to_owned(),
                })
            }
        }
    }

    /// Serializes the frame into a close payload.
    ///
    /// The reason is truncated on a character boundary so the payload never
    /// exceeds the 125 byte control frame limit.
    pub fn to_payload(&self) -> Bytes {
        let Some(code) = self.code else {
            return Bytes::new();
        };

        let mut end = self.reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(code.into());
        payload.put_slice(&self.reason.as_bytes()[..end]);
        payload.freeze()
    }
}

impl std::fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) if self.reason.is_empty() => write!(f, "close {code}"),
            Some(code) => write!(f, "close {code}: {}", self.reason),
            None => write!(f, "close without status"),
        }
    }
}
