//! Incremental UTF-8 validation for text messages split across frames.
//!
//! A multi-byte character may straddle a frame boundary, so the validator
//! keeps the incomplete tail of one frame and completes it with the head of
//! the next one.
use crate::WebSocketError;

/// Checks `data`, returning `(valid_up_to, error_len)` on failure.
///
/// `error_len == None` means the input ended in the middle of a character.
#[inline]
fn check(data: &[u8]) -> Result<(), (usize, Option<usize>)> {
    #[cfg(feature = "simd")]
    let res = simdutf8::compat::from_utf8(data)
        .map(|_| ())
        .map_err(|e| (e.valid_up_to(), e.error_len()));
    #[cfg(not(feature = "simd"))]
    let res = std::str::from_utf8(data)
        .map(|_| ())
        .map_err(|e| (e.valid_up_to(), e.error_len()));
    res
}

/// Validates a text message chunk by chunk.
#[derive(Debug, Default)]
pub(crate) struct Utf8Validator {
    partial: [u8; 4],
    partial_len: usize,
}

impl Utf8Validator {
    /// Feeds the next chunk of the message. `fin` marks the final chunk, after
    /// which no incomplete character may remain.
    pub(crate) fn feed(&mut self, mut data: &[u8], fin: bool) -> Result<(), WebSocketError> {
        while self.partial_len > 0 {
            let Some((&byte, rest)) = data.split_first() else {
                return self.finish(fin);
            };
            data = rest;

            self.partial[self.partial_len] = byte;
            self.partial_len += 1;

            match check(&self.partial[..self.partial_len]) {
                Ok(()) => self.partial_len = 0,
                Err((_, Some(_))) => return Err(WebSocketError::InvalidUTF8),
                Err((_, None)) => {}
            }
        }

        if let Err((valid_up_to, error_len)) = check(data) {
            if error_len.is_some() {
                return Err(WebSocketError::InvalidUTF8);
            }

            let tail = &data[valid_up_to..];
            self.partial[..tail.len()].copy_from_slice(tail);
            self.partial_len = tail.len();
        }

        self.finish(fin)
    }

    fn finish(&self, fin: bool) -> Result<(), WebSocketError> {
        if fin && self.partial_len > 0 {
            Err(WebSocketError::InvalidUTF8)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_character_split_across_chunks() {
        let text = "héllo wörld €𝄞".as_bytes();
        for split in 0..=text.len() {
            let mut validator = Utf8Validator::default();
            validator.feed(&text[..split], false).unwrap();
            validator.feed(&text[split..], true).unwrap();
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let text = "€𝄞ö".as_bytes();
        let mut validator = Utf8Validator::default();
        for (i, byte) in text.iter().enumerate() {
            validator.feed(&[*byte], i + 1 == text.len()).unwrap();
        }
    }

    #[test]
    fn test_invalid_sequence() {
        let mut validator = Utf8Validator::default();
        assert!(validator.feed(&[b'a', 0xFF], false).is_err());
    }

    #[test]
    fn test_invalid_continuation_across_chunks() {
        let mut validator = Utf8Validator::default();
        validator.feed(&[0xE2, 0x82], false).unwrap();
        assert!(validator.feed(&[b'a'], true).is_err());
    }

    #[test]
    fn test_truncated_at_end_of_message() {
        let mut validator = Utf8Validator::default();
        validator.feed(&[0xE2, 0x82], false).unwrap();
        assert!(validator.feed(&[], true).is_err());
    }
}
