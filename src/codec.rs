//! Frame encoding and decoding on top of [`tokio_util::codec`].
//!
//! Both halves are role aware: frames travelling client to server must be
//! masked, frames travelling server to client must not be.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    OpCode, Role, WebSocketError,
};

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The two fixed header bytes were parsed, waiting for the extended length and mask.
    Header(Header),
    /// The full header was parsed, waiting for the payload.
    Payload(HeaderAndMask),
}

/// The fields parsed from the two fixed header bytes.
struct Header {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// Size of the extended length field (0, 2 or 8).
    extra: usize,
    /// The 7-bit length field.
    length_code: u8,
    /// Bytes still needed to finish the header (extended length plus mask).
    header_size: usize,
}

/// Header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Decoder for WebSocket frames.
///
/// Decoding is incremental: a partially received frame stays in the source
/// buffer (and in the decoder state) until enough bytes arrive, so dropping a
/// pending read never loses data.
pub struct Decoder {
    role: Role,
    state: Option<ReadState>,
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a decoder for an endpoint playing `role`, rejecting payloads
    /// larger than `max_payload_size` bytes.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes a single frame, unmasking its payload.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` once a whole frame was read.
    /// - `Ok(None)` if more data is needed.
    /// - `Err(WebSocketError)` on a protocol violation.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    if src[0] & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    match (self.role, masked) {
                        (Role::Server, false) => return Err(WebSocketError::MissingMask),
                        (Role::Client, true) => return Err(WebSocketError::UnexpectedMask),
                        _ => {}
                    }

                    if opcode.is_control() {
                        if !fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if usize::from(length_code) > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => u64::from(header.length_code),
                        2 => u64::from(src.get_u16()),
                        _ => {
                            let len = src.get_u64();
                            if len >> 63 != 0 {
                                return Err(WebSocketError::FrameTooLarge);
                            }
                            len
                        }
                    };

                    let payload_len = match usize::try_from(payload_len) {
                        Ok(len) if len <= self.max_payload_size => len,
                        _ => return Err(WebSocketError::FrameTooLarge),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    // make room for the payload up front instead of growing in steps
                    src.reserve(payload_len.saturating_sub(src.remaining()));

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let payload = src.split_to(header_and_mask.payload_len);

                    let mut frame =
                        Frame::new(header.fin, header.opcode, header_and_mask.mask, payload);
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Encoder serializing frames into a write buffer.
///
/// A client encoder masks every frame with a fresh random key; a server
/// encoder refuses masked frames.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates an encoder for an endpoint playing `role`.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if frame.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }

        match self.role {
            Role::Server if frame.is_masked() => return Err(WebSocketError::UnexpectedMask),
            Role::Server => {}
            Role::Client => frame.mask(),
        }

        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    fn encode(role: Role, frame: Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        Encoder::new(role).encode(frame, &mut dst).unwrap();
        dst
    }

    fn decode(role: Role, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        Decoder::new(role, usize::MAX).decode(src)
    }

    #[test]
    fn test_roundtrip_across_length_tiers() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            // server to client, unmasked
            let mut wire = encode(Role::Server, Frame::new(false, OpCode::Binary, None, &payload[..]));
            let frame = decode(Role::Client, &mut wire).unwrap().unwrap();
            assert!(!frame.fin);
            assert_eq!(frame.opcode, OpCode::Binary);
            assert_eq!(&frame.payload[..], &payload[..]);
            assert!(wire.is_empty());

            // client to server, masked
            let mut wire = encode(Role::Client, Frame::text(&payload));
            let frame = decode(Role::Server, &mut wire).unwrap().unwrap();
            assert!(frame.fin);
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(&frame.payload[..], &payload[..]);
        }
    }

    #[test]
    fn test_client_encoder_masks_payload() {
        let wire = encode(Role::Client, Frame::binary(b"abcd"));
        assert_eq!(wire[1] & 0x80, 0x80);
        assert_eq!(wire.len(), 2 + 4 + 4);

        let key = [wire[2], wire[3], wire[4], wire[5]];
        let mut payload = wire[6..].to_vec();
        crate::mask::apply_mask(&mut payload, key);
        assert_eq!(&payload, b"abcd");
    }

    #[test]
    fn test_server_encoder_rejects_masked_frame() {
        let frame = Frame::new(true, OpCode::Text, Some([1, 2, 3, 4]), &b"x"[..]);
        let mut dst = BytesMut::new();
        assert!(matches!(
            Encoder::new(Role::Server).encode(frame, &mut dst),
            Err(WebSocketError::UnexpectedMask)
        ));
    }

    #[test]
    fn test_encoder_rejects_oversized_control_frame() {
        let mut dst = BytesMut::new();
        assert!(matches!(
            Encoder::new(Role::Server).encode(Frame::ping(vec![0; 126]), &mut dst),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn test_decode_incomplete_input() {
        let full = encode(Role::Server, Frame::binary(vec![7u8; 300]));
        let mut decoder = Decoder::new(Role::Client, usize::MAX);

        let mut src = BytesMut::new();
        for byte in &full[..full.len() - 1] {
            src.extend_from_slice(&[*byte]);
            assert!(decoder.decode(&mut src).unwrap().is_none());
        }
        src.extend_from_slice(&full[full.len() - 1..]);
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn test_decode_rejects_reserved_bits() {
        let mut src = BytesMut::from(&[0b1100_0001, 0x00][..]);
        assert!(matches!(
            decode(Role::Client, &mut src),
            Err(WebSocketError::ReservedBitsNotZero)
        ));
    }

    #[test]
    fn test_decode_rejects_reserved_opcode() {
        let mut src = BytesMut::from(&[0x83, 0x00][..]);
        assert!(matches!(
            decode(Role::Client, &mut src),
            Err(WebSocketError::InvalidOpCode(3))
        ));
    }

    #[test]
    fn test_decode_enforces_mask_direction() {
        let mut src = BytesMut::from(&[0x81, 0x00][..]);
        assert!(matches!(
            decode(Role::Server, &mut src),
            Err(WebSocketError::MissingMask)
        ));

        let mut src = BytesMut::from(&[0x81, 0x80, 1, 2, 3, 4][..]);
        assert!(matches!(
            decode(Role::Client, &mut src),
            Err(WebSocketError::UnexpectedMask)
        ));
    }

    #[test]
    fn test_decode_rejects_bad_control_frames() {
        let mut src = BytesMut::from(&[0x89, 126, 0, 126][..]);
        assert!(matches!(
            decode(Role::Client, &mut src),
            Err(WebSocketError::ControlFrameTooLarge)
        ));

        let mut src = BytesMut::from(&[0x09, 0x00][..]);
        assert!(matches!(
            decode(Role::Client, &mut src),
            Err(WebSocketError::ControlFrameFragmented)
        ));
    }

    #[test]
    fn test_decode_rejects_payload_over_limit() {
        let mut src = encode(Role::Server, Frame::binary(vec![0; 11]));
        let mut decoder = Decoder::new(Role::Client, 10);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_decode_rejects_64bit_length_high_bit() {
        let mut src = BytesMut::from(&[0x82, 127, 0x80, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            decode(Role::Client, &mut src),
            Err(WebSocketError::FrameTooLarge)
        ));
    }
}
