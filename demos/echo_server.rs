//! A WebSocket echo server implementation using wsconn and hyper.
//! This server accepts WebSocket connections and echoes back any text or binary messages it receives,
//! streaming each message frame by frame, while a second task keeps the connection alive with pings.

use std::{sync::Arc, time::Duration};

use http_body_util::Empty;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use tokio::{net::TcpListener, time::Instant};
use wsconn::{Frame, HttpStream, Options, WebSocket, WebSocketError};

const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Echoes every message back as it arrives, without buffering whole messages.
async fn echo(ws: &WebSocket<HttpStream>) -> wsconn::Result<()> {
    loop {
        let mut reader = ws.next_message().await?;
        let mut writer = ws.begin_message(reader.message_type())?;

        while let Some(chunk) = reader.next_chunk().await? {
            writer.write(&chunk).await?;
        }

        writer.finish().await?;
    }
}

/// Handles an individual WebSocket client connection by echoing back any received messages.
///
/// # Arguments
/// * `fut` - Future that resolves to the WebSocket connection
///
/// # Returns
/// * `wsconn::Result<()>` - Result indicating success or failure of the WebSocket connection handling
async fn handle_client(fut: wsconn::UpgradeFut) -> wsconn::Result<()> {
    let ws = Arc::new(fut.await?);

    let pinger = tokio::spawn({
        let ws = ws.clone();
        async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let deadline = Instant::now() + Duration::from_secs(5);
                if ws.send_control(Frame::ping(b""), Some(deadline)).await.is_err() {
                    break;
                }
            }
        }
    });

    let res = echo(&ws).await;
    pinger.abort();

    match res {
        Err(WebSocketError::Closed(close)) => {
            log::debug!("Client disconnected: {close}");
            Ok(())
        }
        res => res,
    }
}

/// Upgrades an HTTP connection to a WebSocket connection with specific options.
///
/// # Arguments
/// * `req` - The HTTP request to upgrade
///
/// # Returns
/// * `wsconn::Result<Response<Empty<Bytes>>>` - The HTTP response for the upgrade
async fn server_upgrade(mut req: Request<Incoming>) -> wsconn::Result<Response<Empty<Bytes>>> {
    let options = Options::default()
        .with_utf8()
        .with_max_payload_read(16 * 1024 * 1024)
        .with_write_buffer_size(64 * 1024);

    let (response, fut) = match WebSocket::upgrade_request(&mut req, options) {
        Ok(upgrade) => upgrade,
        Err(WebSocketError::Handshake(err)) => {
            log::warn!("Rejected request: {err}");
            let mut response = Response::new(Empty::new());
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
        Err(err) => return Err(err),
    };

    tokio::task::spawn(async move {
        if let Err(e) = handle_client(fut).await {
            log::error!("Error in websocket connection: {}", e);
        }
    });

    Ok(response)
}

/// Main entry point for the WebSocket server.
///
/// Initializes logging and starts listening for WebSocket connections on port 8080.
/// Each client connection is handled in a separate task.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    let listener = TcpListener::bind("0.0.0.0:8080").await?;

    log::debug!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, _) = listener.accept().await?;
        log::info!("Client connected");

        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            let conn_fut = http1::Builder::new()
                .serve_connection(io, service_fn(server_upgrade))
                .with_upgrades();
            if let Err(e) = conn_fut.await {
                log::error!("An error occurred: {:?}", e);
            }
        });
    }
}
