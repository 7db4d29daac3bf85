//! # Handshake
//!
//! Server side of the opening handshake, [RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2).
//!
//! [`Handshake::validate`] inspects the request headers and derives the accept
//! key without touching the transport. If the request is not a WebSocket
//! request the caller gets a [`HandshakeError`] and can still answer with a
//! regular HTTP error. On success the handshake is completed with
//! [`Handshake::upgrade`], which takes ownership of the transport through the
//! [`Hijack`] capability and writes the `101 Switching Protocols` response, or
//! with [`Handshake::into_response`] when the HTTP server writes the response
//! itself.
//!
//! ```no_run
//! use tokio::net::TcpStream;
//! use hyper::HeaderMap;
//! use wsconn::{Handshake, Options};
//!
//! async fn accept(stream: TcpStream, headers: &HeaderMap) -> wsconn::Result<()> {
//!     let ws = Handshake::validate(headers)?
//!         .with_subprotocol("chat")
//!         .upgrade(stream, Options::default())
//!         .await?;
//!
//!     let message = ws.read_message().await?;
//!     ws.write_message(message.0, &message.1).await
//! }
//! ```
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::Empty;
use hyper::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Response, StatusCode,
};
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;

use crate::{hijack::Hijack, HandshakeError, HttpResponse, Options, Result, Role, WebSocket};

/// The GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this crate speaks.
pub const WEBSOCKET_VERSION: &[u8] = b"13";

/// Derives the `Sec-WebSocket-Accept` value for a client key.
///
/// # Example
/// ```
/// assert_eq!(
///     wsconn::accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID);
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// Returns true if any instance of header `name` contains `token` in its
/// comma separated list, ignoring ASCII case.
fn token_list_contains(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .as_bytes()
            .split(|b| *b == b',')
            .any(|item| item.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
    })
}

/// Replaces control bytes (0..=31) with a space so a caller supplied header
/// can never break out of its line.
fn sanitize(input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .map(|b| if *b <= 31 { b' ' } else { *b })
        .collect()
}

/// A validated upgrade request, ready to be answered.
#[derive(Debug, Clone)]
pub struct Handshake {
    accept: String,
    subprotocol: Option<Vec<u8>>,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Handshake {
    /// Checks that `headers` describe a WebSocket upgrade request.
    ///
    /// The checks run in order and the first failure is returned:
    /// 1. `Sec-WebSocket-Version` is `13`
    /// 2. `Connection` contains the `upgrade` token
    /// 3. `Upgrade` contains the `websocket` token
    /// 4. `Sec-WebSocket-Key` is present and not empty
    pub fn validate(headers: &HeaderMap) -> std::result::Result<Self, HandshakeError> {
        if headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(|v| v.as_bytes())
            != Some(WEBSOCKET_VERSION)
        {
            return Err(HandshakeError::InvalidVersion);
        }

        if !token_list_contains(headers, header::CONNECTION, "upgrade") {
            return Err(HandshakeError::MissingConnectionUpgrade);
        }

        if !token_list_contains(headers, header::UPGRADE, "websocket") {
            return Err(HandshakeError::MissingUpgradeWebsocket);
        }

        let key = match headers.get(header::SEC_WEBSOCKET_KEY) {
            Some(key) if !key.is_empty() => key,
            _ => return Err(HandshakeError::MissingKey),
        };

        Ok(Self {
            accept: accept_key(key.as_bytes()),
            subprotocol: None,
            headers: Vec::new(),
        })
    }

    /// Lists the subprotocols offered by the client in `Sec-WebSocket-Protocol`,
    /// in the order they were sent.
    pub fn subprotocols(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|proto| !proto.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// The computed `Sec-WebSocket-Accept` value.
    pub fn accept(&self) -> &str {
        &self.accept
    }

    /// Selects the subprotocol announced in the response.
    pub fn with_subprotocol(self, protocol: impl AsRef<[u8]>) -> Self {
        Self {
            subprotocol: Some(sanitize(protocol.as_ref())),
            ..self
        }
    }

    /// Appends an extra response header.
    pub fn with_header(mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        self.headers
            .push((sanitize(name.as_ref()), sanitize(value.as_ref())));
        self
    }

    /// Serializes the `101 Switching Protocols` response.
    pub fn response_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.put_slice(b"Upgrade: websocket\r\n");
        buf.put_slice(b"Connection: Upgrade\r\n");
        buf.put_slice(b"Sec-WebSocket-Accept: ");
        buf.put_slice(self.accept.as_bytes());
        buf.put_slice(b"\r\n");

        if let Some(protocol) = &self.subprotocol {
            buf.put_slice(b"Sec-WebSocket-Protocol: ");
            buf.put_slice(protocol);
            buf.put_slice(b"\r\n");
        }

        for (name, value) in &self.headers {
            buf.put_slice(name);
            buf.put_slice(b": ");
            buf.put_slice(value);
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Builds the response as a hyper [`Response`] for servers that write it themselves.
    pub fn into_response(self) -> std::result::Result<HttpResponse, HandshakeError> {
        let mut response = Response::new(Empty::new());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

        let headers = response.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::try_from(self.accept)
                .map_err(|_| HandshakeError::InvalidHeader("Sec-WebSocket-Accept".into()))?,
        );

        if let Some(protocol) = self.subprotocol {
            let value = HeaderValue::from_bytes(&protocol).map_err(|_| {
                HandshakeError::InvalidHeader(header::SEC_WEBSOCKET_PROTOCOL.to_string())
            })?;
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }

        for (name, value) in self.headers {
            let invalid = || HandshakeError::InvalidHeader(String::from_utf8_lossy(&name).into());
            let header_name = HeaderName::from_bytes(&name).map_err(|_| invalid())?;
            let header_value = HeaderValue::from_bytes(&value).map_err(|_| invalid())?;
            headers.append(header_name, header_value);
        }

        Ok(response)
    }

    /// Takes over the transport, writes the response and returns the server side connection.
    ///
    /// Bytes the client sent after its request but before this response are a
    /// protocol violation: the transport is shut down and
    /// [`HandshakeError::DataBeforeHandshake`] is returned. A failed response
    /// write also shuts the transport down.
    pub async fn upgrade<H: Hijack>(self, io: H, options: Options) -> Result<WebSocket<H::Stream>> {
        let (mut stream, buffered) = io.hijack();

        if !buffered.is_empty() {
            #[cfg(feature = "logging")]
            log::warn!(
                "client sent {} bytes before the handshake completed",
                buffered.len()
            );

            let _ = stream.shutdown().await;
            return Err(HandshakeError::DataBeforeHandshake.into());
        }

        let response = self.response_bytes();
        let written = async {
            stream.write_all(&response).await?;
            stream.flush().await
        }
        .await;

        if let Err(err) = written {
            let _ = stream.shutdown().await;
            return Err(err.into());
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "websocket upgraded, subprotocol={:?}",
            self.subprotocol
                .as_deref()
                .map(String::from_utf8_lossy)
        );

        Ok(WebSocket::from_stream(Role::Server, stream, options))
    }
}
