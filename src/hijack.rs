//! Taking exclusive ownership of an established transport.
//!
//! An HTTP server parses the upgrade request from a connection it owns. To
//! turn that connection into a WebSocket the server has to hand over the raw
//! byte stream together with anything it already read past the end of the
//! request. [`Hijack`] is that hand-over.
use bytes::Bytes;
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
};

/// A transport that can give up its byte stream.
pub trait Hijack {
    /// The raw stream the connection will own.
    type Stream: AsyncRead + AsyncWrite + Unpin;

    /// Returns the stream and the bytes buffered but not yet consumed.
    fn hijack(self) -> (Self::Stream, Bytes);
}

impl Hijack for TcpStream {
    type Stream = TcpStream;

    fn hijack(self) -> (Self::Stream, Bytes) {
        (self, Bytes::new())
    }
}

impl<S> Hijack for BufReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Stream = S;

    fn hijack(self) -> (Self::Stream, Bytes) {
        let buffered = Bytes::copy_from_slice(self.buffer());
        (self.into_inner(), buffered)
    }
}

/// A stream paired with bytes its previous owner already read.
impl<S> Hijack for (S, Bytes)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Stream = S;

    fn hijack(self) -> (Self::Stream, Bytes) {
        self
    }
}

/// The parts of a hyper upgrade downcast to the server's IO type, e.g.
/// `upgraded.downcast::<TokioIo<TcpStream>>()`.
impl<S> Hijack for hyper::upgrade::Parts<TokioIo<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Stream = S;

    fn hijack(self) -> (Self::Stream, Bytes) {
        (self.io.into_inner(), self.read_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bufreader_yields_buffered_bytes() {
        let (a, mut b) = tokio::io::duplex(64);
        b.write_all(b"GET / HTTP/1.1\r\nextra").await.unwrap();

        let mut reader = BufReader::new(a);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "GET / HTTP/1.1\r\n");

        let (_stream, buffered) = reader.hijack();
        assert_eq!(&buffered[..], b"extra");
    }

    #[tokio::test]
    async fn test_pair_passes_through() {
        let (a, _b) = tokio::io::duplex(64);
        let (_stream, buffered) = (a, Bytes::from_static(b"xy")).hijack();
        assert_eq!(&buffered[..], b"xy");
    }
}
