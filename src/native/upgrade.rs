//! hyper server integration.
//!
//! hyper parses the request and writes the `101` response itself, then hands
//! the connection over through [`hyper::upgrade::on`]. When the server runs on
//! a plain [`TcpStream`] the upgraded connection is downcast back to it, so
//! bytes hyper already read past the request can be inspected: a client that
//! sent frames before the response is rejected with
//! [`HandshakeError::DataBeforeHandshake`](crate::HandshakeError::DataBeforeHandshake).
//! Other IO types (TLS streams, custom transports) can not be downcast; their
//! read-ahead bytes are replayed by [`Upgraded`] into the frame decoder.

use std::{
    future::Future,
    io,
    pin::{pin, Pin},
    task::{ready, Context, Poll},
};

use hyper::{upgrade::Upgraded, Request};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{Handshake, HandshakeError, Hijack, Result};

use super::{Options, Role, UpgradeResult, WebSocket};

/// The stream of a connection upgraded by hyper.
pub enum HttpStream {
    /// A TCP connection recovered from the upgrade.
    Tcp(TcpStream),
    /// Any other IO type, behind hyper's upgrade wrapper.
    Hyper(TokioIo<Upgraded>),
}

impl HttpStream {
    /// Recovers the transport of `upgraded`, failing if the client sent data
    /// before the handshake response.
    fn from_upgraded(upgraded: Upgraded) -> Result<Self> {
        match upgraded.downcast::<TokioIo<TcpStream>>() {
            Ok(parts) => {
                let (stream, buffered) = parts.hijack();
                if !buffered.is_empty() {
                    #[cfg(feature = "logging")]
                    log::warn!(
                        "client sent {} bytes before the handshake completed",
                        buffered.len()
                    );

                    // dropping the socket closes it
                    drop(stream);
                    return Err(HandshakeError::DataBeforeHandshake.into());
                }

                Ok(Self::Tcp(stream))
            }
            Err(upgraded) => Ok(Self::Hyper(TokioIo::new(upgraded))),
        }
    }
}

impl From<TokioIo<Upgraded>> for HttpStream {
    fn from(value: TokioIo<Upgraded>) -> Self {
        Self::Hyper(value)
    }
}

impl AsyncRead for HttpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => pin!(stream).poll_read(cx, buf),
            Self::Hyper(stream) => pin!(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => pin!(stream).poll_write(cx, buf),
            Self::Hyper(stream) => pin!(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => pin!(stream).poll_flush(cx),
            Self::Hyper(stream) => pin!(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => pin!(stream).poll_shutdown(cx),
            Self::Hyper(stream) => pin!(stream).poll_shutdown(cx),
        }
    }
}

/// Future that completes the WebSocket upgrade process on a server, returning a WebSocket stream.
///
/// This future is returned by [`WebSocket::upgrade_request`] and [`Handshake::respond`]
/// after validating the request.
///
/// # Important
/// The associated HTTP upgrade response must be sent to the client before polling this future.
/// The future will not complete until the response is sent and the HTTP connection is upgraded
/// to the WebSocket protocol.
///
/// # Example
/// ```no_run
/// use hyper::{
///     body::{Bytes, Incoming},
///     Request, Response,
/// };
/// use http_body_util::Empty;
/// use wsconn::{Options, UpgradeFut, WebSocket};
///
/// async fn handle_client(fut: UpgradeFut) -> wsconn::Result<()> {
///     let ws = fut.await?;
///     // use `ws`
///     Ok(())
/// }
///
/// async fn server_upgrade(mut req: Request<Incoming>) -> wsconn::Result<Response<Empty<Bytes>>> {
///     let (response, fut) = WebSocket::upgrade_request(&mut req, Options::default())?;
///
///     tokio::task::spawn(async move {
///         if let Err(e) = handle_client(fut).await {
///             eprintln!("Error in websocket connection: {}", e);
///         }
///     });
///
///     Ok(response)
/// }
/// ```
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
    options: Option<Options>,
}

impl Future for UpgradeFut {
    type Output = Result<WebSocket<HttpStream>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = ready!(this.inner.poll(cx))?;
        let options = this.options.take().unwrap_or_default();

        let stream = HttpStream::from_upgraded(upgraded)?;
        Poll::Ready(Ok(WebSocket::from_stream(Role::Server, stream, options)))
    }
}

impl Handshake {
    /// Answers a hyper request: returns the `101` response to send and a
    /// future resolving to the connection once hyper hands it over.
    pub fn respond<B>(
        self,
        mut request: impl std::borrow::BorrowMut<Request<B>>,
        options: Options,
    ) -> UpgradeResult {
        let response = self.into_response()?;

        #[cfg(feature = "logging")]
        log::debug!("upgrading {}", request.borrow_mut().uri());

        let fut = UpgradeFut {
            inner: hyper::upgrade::on(request.borrow_mut()),
            options: Some(options),
        };

        Ok((response, fut))
    }
}

impl WebSocket<HttpStream> {
    /// Validates a hyper request and prepares its upgrade.
    ///
    /// On a [`HandshakeError`](crate::HandshakeError) nothing was consumed and the
    /// request can still be answered with a regular HTTP error.
    pub fn upgrade_request<B>(
        mut request: impl std::borrow::BorrowMut<Request<B>>,
        options: Options,
    ) -> UpgradeResult {
        let handshake = Handshake::validate(request.borrow_mut().headers())?;
        handshake.respond(request, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CloseCode, CloseFrame, MessageType, WebSocketError};
    use http_body_util::Empty;
    use hyper::{body::Bytes, server::conn::http1, service::service_fn, Response, StatusCode};
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{TcpListener, TcpStream},
    };

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|mut req: Request<hyper::body::Incoming>| async move {
                match WebSocket::upgrade_request(&mut req, Options::default()) {
                    Ok((response, fut)) => {
                        tokio::spawn(async move {
                            let Ok(ws) = fut.await else {
                                return;
                            };
                            while let Ok((kind, payload)) = ws.read_message().await {
                                ws.write_message(kind, &payload).await.unwrap();
                            }
                        });
                        Ok::<_, hyper::Error>(response)
                    }
                    Err(_) => {
                        let mut response = Response::new(Empty::<Bytes>::new());
                        *response.status_mut() = StatusCode::BAD_REQUEST;
                        Ok(response)
                    }
                }
            });

            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await;
        });

        addr
    }

    /// Sends the opening handshake followed by `early` in the same write, and
    /// returns the stream positioned after the response.
    async fn connect_with(
        addr: std::net::SocketAddr,
        key: &str,
        early: &[u8],
    ) -> (BufReader<TcpStream>, Vec<String>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /ws HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        let mut bytes = request.into_bytes();
        bytes.extend_from_slice(early);
        stream.write_all(&bytes).await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            lines.push(line.trim_end().to_owned());
        }

        (reader, lines)
    }

    async fn connect(addr: std::net::SocketAddr, key: &str) -> (BufReader<TcpStream>, Vec<String>) {
        connect_with(addr, key, b"").await
    }

    #[tokio::test]
    async fn test_hyper_upgrade_echo() {
        let addr = echo_server().await;
        let (reader, lines) = connect(addr, "dGhlIHNhbXBsZSBub25jZQ==").await;

        assert_eq!(lines[0], "HTTP/1.1 101 Switching Protocols");
        assert!(lines
            .iter()
            .any(|l| l.eq_ignore_ascii_case("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")));

        let ws = WebSocket::from_stream(Role::Client, reader.into_inner(), Options::default());
        ws.write_message(MessageType::Text, b"echo me").await.unwrap();
        let (kind, payload) = ws.read_message().await.unwrap();
        assert_eq!(kind, MessageType::Text);
        assert_eq!(&payload[..], b"echo me");

        ws.send_close(CloseFrame::new(CloseCode::Normal, "")).await.unwrap();
        assert!(matches!(
            ws.read_message().await,
            Err(WebSocketError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_hyper_rejects_plain_request() {
        let addr = echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        assert!(line.starts_with("HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_hyper_rejects_data_before_handshake() {
        use tokio::io::AsyncReadExt;
        use tokio_util::codec::Encoder as _;

        let mut early = bytes::BytesMut::new();
        crate::codec::Encoder::new(Role::Client)
            .encode(crate::Frame::text("early"), &mut early)
            .unwrap();

        let addr = echo_server().await;
        let (mut reader, lines) = connect_with(addr, "dGhlIHNhbXBsZSBub25jZQ==", &early).await;
        assert_eq!(lines[0], "HTTP/1.1 101 Switching Protocols");

        // the frame is not echoed, the server drops the connection instead
        let mut rest = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(5), reader.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }
}
