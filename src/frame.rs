//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! A frame is the smallest unit on the wire; a message is one data frame plus
//! zero or more continuation frames.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Data frames (`Text`, `Binary`, `Continuation`) carry application bytes.
//! Control frames (`Close`, `Ping`, `Pong`) manage the connection; they are
//! never fragmented and carry at most 125 bytes of payload.
use bytes::{Bytes, BytesMut};

use crate::{close::CloseFrame, WebSocketError};

/// Largest possible frame header: 2 fixed bytes, 8 bytes of extended length and a 4 byte mask.
pub const MAX_HEAD_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A single WebSocket frame.
///
/// Most code works with messages through [`crate::WebSocket`]; frames are
/// exposed for sending control frames and for driving the codec directly.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key, present on frames travelling client to server.
    pub(crate) mask: Option<[u8; 4]>,
    /// The payload, unmasked once decoded.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// A complete, unfragmented text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, payload.as_ref())
    }

    /// A complete, unfragmented binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, payload.as_ref())
    }

    /// A ping frame.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, payload.as_ref())
    }

    /// A pong frame.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, payload.as_ref())
    }

    /// A close frame built from a code and reason.
    pub fn close(close: &CloseFrame) -> Self {
        Self::new(true, OpCode::Close, None, &close.to_payload()[..])
    }

    /// A close frame with a raw payload. The payload is checked when the frame is sent
    /// through [`crate::WebSocket::send_control`].
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, None, payload.as_ref())
    }

    /// Returns the masking key, if any.
    #[inline]
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Returns whether the frame is masked.
    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Consumes the frame, returning its payload as immutable bytes.
    pub fn into_payload(self) -> Bytes {
        self.payload.freeze()
    }

    /// Masks the payload with the frame key, generating a random key first when none is set.
    pub(crate) fn mask(&mut self) {
        let key = *self.mask.get_or_insert_with(rand::random);
        crate::mask::apply_mask(&mut self.payload, key);
    }

    /// Reverses the masking and clears the key.
    pub(crate) fn unmask(&mut self) {
        if let Some(key) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, key);
        }
    }

    /// Formats the frame header into `head` and returns the number of bytes written.
    ///
    /// The extended length uses the smallest encoding that fits the payload.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::CloseCode;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8_invalid() {
            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(WebSocketError::InvalidOpCode(c)) if c == code
                ));
            }
        }

        #[test]
        fn test_u8_conversions_agree() {
            for op in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(op)).unwrap(), op);
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_close_frame_payload() {
            let frame = Frame::close(&CloseFrame::new(CloseCode::Normal, "Goodbye"));
            assert!(frame.fin);
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..], b"\x03\xE8Goodbye");
        }

        #[test]
        fn test_mask_unmask() {
            let payload = BytesMut::from("Mask me");
            let mut frame = Frame::new(true, OpCode::Binary, Some([1, 2, 3, 4]), payload.clone());

            frame.mask();
            assert_ne!(frame.payload, payload);

            frame.unmask();
            assert_eq!(frame.payload, payload);
            assert!(!frame.is_masked());
        }

        #[test]
        fn test_mask_generates_key() {
            let mut frame = Frame::text("hello");
            frame.mask();
            assert!(frame.is_masked());
        }

        #[test]
        fn test_fmt_head_small_masked() {
            let mask_key = [0xAA, 0xBB, 0xCC, 0xDD];
            let frame = Frame::new(true, OpCode::Text, Some(mask_key), &b"Header test"[..]);

            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);

            assert_eq!(size, 2 + 4);
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &mask_key);
        }

        #[test]
        fn test_fmt_head_length_tiers() {
            let mut head = [0u8; MAX_HEAD_SIZE];

            let frame = Frame::binary(vec![0; 125]);
            assert_eq!(frame.fmt_head(&mut head), 2);
            assert_eq!(head[1], 125);

            let frame = Frame::binary(vec![0; 126]);
            assert_eq!(frame.fmt_head(&mut head), 4);
            assert_eq!(head[1], 126);
            assert_eq!(&head[2..4], &126u16.to_be_bytes());

            let frame = Frame::binary(vec![0; 65535]);
            assert_eq!(frame.fmt_head(&mut head), 4);
            assert_eq!(&head[2..4], &[0xFF, 0xFF]);

            let frame = Frame::binary(vec![0; 65536]);
            assert_eq!(frame.fmt_head(&mut head), 10);
            assert_eq!(head[1], 127);
            assert_eq!(&head[2..10], &65536u64.to_be_bytes());
        }

        #[test]
        fn test_fmt_head_continuation_not_final() {
            let frame = Frame::new(false, OpCode::Continuation, None, &b"x"[..]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            frame.fmt_head(&mut head);
            assert_eq!(head[0], 0x00);
        }
    }
}
