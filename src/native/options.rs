use crate::frame::MAX_HEAD_SIZE;

use super::{DEFAULT_BUFFER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_READ};

/// Configuration options for a WebSocket connection.
///
/// `Options` allows users to set parameters that govern the behavior of a WebSocket connection,
/// including payload size limits, buffer sizes and UTF-8 validation requirements.
///
/// # Example
/// ```rust
/// use wsconn::Options;
///
/// let options = Options::default()
///     .with_max_payload_read(64 * 1024)
///     .with_write_buffer_size(16 * 1024)
///     .with_utf8();
/// ```
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Maximum allowed payload size of a single incoming frame, in bytes.
    ///
    /// If a frame exceeds this size, the connection is closed with status
    /// 1009 to prevent overloading the receiving end.
    ///
    /// Default: 1 MiB (1,048,576 bytes) as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Maximum total size of an incoming message across all of its frames.
    ///
    /// Default: 2 MiB (2,097,152 bytes) as defined in [`MAX_MESSAGE_SIZE`], or twice the
    /// configured `max_payload_read` value if that is set.
    pub max_message_size: Option<usize>,

    /// Initial capacity of the read buffer.
    ///
    /// This is not a fixed size: the buffer grows to hold a whole frame, so a single frame
    /// can make it as large as `max_payload_read` plus its header. Memory per connection
    /// is bounded by `max_payload_read`, not by this value.
    ///
    /// Default: [`DEFAULT_BUFFER_SIZE`]. Never smaller than the largest frame header.
    pub read_buffer_size: Option<usize>,

    /// Size of the buffer a [`MessageWriter`](super::MessageWriter) fills before emitting a frame.
    ///
    /// Unlike the read buffer this one is fixed: outgoing frames never carry more payload.
    ///
    /// Default: [`DEFAULT_BUFFER_SIZE`]. Never smaller than the largest frame header.
    pub write_buffer_size: Option<usize>,

    /// Flag to determine whether incoming text messages should be validated for UTF-8 encoding.
    ///
    /// If `true`, text messages are validated frame by frame as they arrive and the connection
    /// is closed with status 1007 on any validation failure.
    ///
    /// Default: `false`
    pub check_utf8: bool,
}

impl Options {
    /// Sets the maximum allowed payload size for incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of an incoming message, summed over all of its frames.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Sets the initial read buffer capacity.
    pub fn with_read_buffer_size(self, size: usize) -> Self {
        Self {
            read_buffer_size: Some(size),
            ..self
        }
    }

    /// Sets the write buffer size, which is also the largest frame payload a
    /// message writer emits.
    pub fn with_write_buffer_size(self, size: usize) -> Self {
        Self {
            write_buffer_size: Some(size),
            ..self
        }
    }

    /// Enables UTF-8 validation for incoming text messages.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    pub(crate) fn payload_limit(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    // message limit should be at least 2 times the payload read if not specified
    pub(crate) fn message_limit(&self) -> usize {
        self.max_message_size.unwrap_or(
            self.max_payload_read
                .map(|payload_read| payload_read.saturating_mul(2))
                .unwrap_or(MAX_MESSAGE_SIZE),
        )
    }

    pub(crate) fn read_buffer(&self) -> usize {
        self.read_buffer_size
            .unwrap_or(DEFAULT_BUFFER_SIZE)
            .max(MAX_HEAD_SIZE)
    }

    pub(crate) fn write_buffer(&self) -> usize {
        self.write_buffer_size
            .unwrap_or(DEFAULT_BUFFER_SIZE)
            .max(MAX_HEAD_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.payload_limit(), MAX_PAYLOAD_READ);
        assert_eq!(options.message_limit(), MAX_MESSAGE_SIZE);
        assert_eq!(options.read_buffer(), DEFAULT_BUFFER_SIZE);
        assert_eq!(options.write_buffer(), DEFAULT_BUFFER_SIZE);
        assert!(!options.check_utf8);
    }

    #[test]
    fn test_message_limit_follows_payload_limit() {
        let options = Options::default().with_max_payload_read(100);
        assert_eq!(options.message_limit(), 200);

        let options = options.with_max_message_size(150);
        assert_eq!(options.message_limit(), 150);
    }

    #[test]
    fn test_buffers_fit_a_frame_header() {
        let options = Options::default()
            .with_read_buffer_size(1)
            .with_write_buffer_size(0);
        assert_eq!(options.read_buffer(), MAX_HEAD_SIZE);
        assert_eq!(options.write_buffer(), MAX_HEAD_SIZE);
    }
}
