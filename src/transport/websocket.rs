//! WebSocket carrier
//!
//! TCP (optionally TLS) with an HTTP upgrade to WebSocket. Each write is
//! sent as one binary message; reads drain messages in order.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as ServerRequest, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{accept_hdr_async_with_config, client_async_with_config, WebSocketStream};
use tracing::{debug, trace};

use super::tls::{self, TlsSettings};
use super::{
    timed_out, BoxedConnection, Connection, ConnectionCache, Deadline, Listener, ResolvedStream, TransportBinder,
    TransportContext, TransportDialer, TransportSettings,
};
use crate::common::{Address, Destination};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    pub path: String,
    /// Extra request headers; `Host` overrides the destination host
    pub headers: BTreeMap<String, String>,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            path: "/".into(),
            headers: BTreeMap::new(),
        }
    }
}

impl TransportSettings for WebSocketSettings {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    }
}

fn ws_io_error(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Run the client side of the upgrade over an established connection
pub async fn client_handshake(
    conn: BoxedConnection,
    settings: &WebSocketSettings,
    dest: &Destination,
    secure: bool,
) -> Result<WebSocketConnection> {
    let host = settings
        .headers
        .get("Host")
        .cloned()
        .unwrap_or_else(|| dest.address.host());
    let scheme = if secure { "wss" } else { "ws" };
    let uri = format!("{}://{}{}", scheme, host, settings.path);

    let mut request = Request::builder()
        .uri(&uri)
        .header("Host", &host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());
    for (key, value) in settings.headers.iter().filter(|(k, _)| k.as_str() != "Host") {
        request = request.header(key.as_str(), value.as_str());
    }
    let request = request
        .body(())
        .map_err(|e| Error::Protocol(format!("Failed to build WebSocket request: {}", e)))?;

    let (local, remote) = (conn.local_addr(), conn.remote_addr());
    let (ws, _response) = client_async_with_config(request, conn, Some(ws_config()))
        .await
        .map_err(|e| Error::Protocol(format!("WebSocket handshake failed: {}", e)))?;
    debug!("WebSocket client connected to {}", uri);
    Ok(WebSocketConnection::new(ws, local, remote))
}

/// Run the server side of the upgrade; requests for another path get a 404
pub async fn server_handshake(conn: BoxedConnection, path: &str) -> Result<WebSocketConnection> {
    let expected = path.to_string();
    let check_path = move |req: &ServerRequest, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        if req.uri().path() == expected {
            return Ok(resp);
        }
        trace!("WebSocket request for unknown path {}", req.uri().path());
        let mut err = ErrorResponse::new(Some("not found".into()));
        *err.status_mut() = StatusCode::NOT_FOUND;
        Err(err)
    };

    let (local, remote) = (conn.local_addr(), conn.remote_addr());
    let ws = accept_hdr_async_with_config(conn, check_path, Some(ws_config()))
        .await
        .map_err(|e| Error::Protocol(format!("WebSocket handshake failed: {}", e)))?;
    debug!("WebSocket server accepted {:?}", remote);
    Ok(WebSocketConnection::new(ws, local, remote))
}

/// WebSocket stream exposed as a byte stream
pub struct WebSocketConnection {
    inner: WebSocketStream<BoxedConnection>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_deadline: Deadline,
    write_deadline: Deadline,
    closed: bool,
}

impl WebSocketConnection {
    fn new(inner: WebSocketStream<BoxedConnection>, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        Self {
            inner,
            local,
            remote,
            read_buf: Vec::new(),
            read_pos: 0,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            closed: false,
        }
    }
}

impl AsyncRead for WebSocketConnection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.read_pos < this.read_buf.len() {
                let remaining = &this.read_buf[this.read_pos..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                this.read_pos += to_copy;
                if this.read_pos >= this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if this.closed {
                return Poll::Ready(Ok(()));
            }
            if this.read_deadline.poll_expired(cx).is_ready() {
                return Poll::Ready(Err(timed_out()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    trace!("WebSocket received {} bytes", data.len());
                    this.read_buf = data;
                }
                Some(Ok(Message::Text(text))) => this.read_buf = text.into_bytes(),
                // Pongs are queued by tungstenite itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket received close frame: {:?}", frame);
                    this.closed = true;
                }
                Some(Ok(Message::Frame(_))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected raw frame")));
                }
                Some(Err(e)) => {
                    this.closed = true;
                    return Poll::Ready(Err(ws_io_error(e)));
                }
                None => this.closed = true,
            }
        }
    }
}

impl AsyncWrite for WebSocketConnection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.closed {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")));
        }
        if this.write_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }

        if let Err(e) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
            this.closed = true;
            return Poll::Ready(Err(ws_io_error(e)));
        }
        match Pin::new(&mut this.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => {
                this.closed = true;
                Poll::Ready(Err(ws_io_error(e)))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        if this.write_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let result = ready!(Pin::new(&mut this.inner).poll_close(cx));
        this.closed = true;
        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(ws_io_error(e))),
        }
    }
}

impl Connection for WebSocketConnection {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Outbound side of the `websocket` carrier
#[derive(Default)]
pub struct WebSocketDialer {
    cache: ConnectionCache,
}

impl WebSocketDialer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransportDialer for WebSocketDialer {
    async fn dial(
        &self,
        ctx: &TransportContext,
        src: Option<&Address>,
        dest: &Destination,
        stream: &ResolvedStream,
    ) -> Result<BoxedConnection> {
        let key = ConnectionCache::key(src, dest, &stream.fingerprint());
        if let Some(conn) = self.cache.get(&key) {
            debug!("Reusing cached websocket connection to {}", dest);
            return Ok(Box::new(self.cache.wrap(key, conn)));
        }

        let settings = stream.settings::<WebSocketSettings>()?;
        let mut conn = ctx.dial_system(src, dest, &stream.socket).await?;
        let tls = stream.tls();
        if let Some(tls) = tls {
            conn = tls.client(conn, dest).await?;
        }
        let ws = client_handshake(conn, settings, dest, tls.is_some()).await?;
        Ok(Box::new(self.cache.wrap(key, Box::new(ws))))
    }
}

/// Inbound side of the `websocket` carrier
pub struct WebSocketBinder;

#[async_trait]
impl TransportBinder for WebSocketBinder {
    async fn bind(&self, ctx: &TransportContext, addr: &Address, stream: &ResolvedStream) -> Result<Box<dyn Listener>> {
        let settings = stream.settings::<WebSocketSettings>()?;
        let acceptor = stream.tls().map(TlsSettings::acceptor).transpose()?;
        let listener = ctx.listen_system_tcp(addr, &stream.socket).await?;
        let local_addr = listener.local_addr()?;
        debug!("websocket listener bound on {}{}", local_addr, settings.path);

        Ok(Box::new(WebSocketListener {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            path: settings.path.clone(),
            acceptor,
        }))
    }
}

struct WebSocketListener {
    listener: Mutex<Option<Arc<tokio::net::TcpListener>>>,
    local_addr: SocketAddr,
    path: String,
    acceptor: Option<TlsAcceptor>,
}

#[async_trait]
impl Listener for WebSocketListener {
    async fn accept(&self) -> Result<BoxedConnection> {
        let listener = self.listener.lock().clone().ok_or(Error::ConnectionClosed)?;
        let (stream, _) = listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(super::RawConnection::from_tcp(stream)))
    }

    async fn upgrade(&self, conn: BoxedConnection) -> Result<BoxedConnection> {
        let conn = match &self.acceptor {
            Some(acceptor) => tls::accept(acceptor, conn).await?,
            None => conn,
        };
        Ok(Box::new(server_handshake(conn, &self.path).await?))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.local_addr))
    }

    async fn close(&self) -> Result<()> {
        self.listener.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawConnection;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn duplex_pair() -> (BoxedConnection, BoxedConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(RawConnection::new(a)), Box::new(RawConnection::new(b)))
    }

    fn dest() -> Destination {
        Destination::tcp(Address::domain("example.com", 80))
    }

    #[tokio::test]
    async fn test_handshake_and_echo() {
        let (client, server) = duplex_pair();
        let settings = WebSocketSettings {
            path: "/tunnel".into(),
            ..Default::default()
        };

        let server = tokio::spawn(async move {
            let mut conn = server_handshake(server, "/tunnel").await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            conn.flush().await.unwrap();
            conn
        });

        let mut conn = client_handshake(client, &settings, &dest(), false).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let _server = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_small_reads_drain_one_message() {
        let (client, server) = duplex_pair();
        let server = tokio::spawn(async move {
            let mut conn = server_handshake(server, "/").await.unwrap();
            conn.write_all(b"0123456789").await.unwrap();
            conn.flush().await.unwrap();
            conn
        });

        let mut conn = client_handshake(client, &WebSocketSettings::default(), &dest(), false)
            .await
            .unwrap();
        let mut head = [0u8; 3];
        conn.read_exact(&mut head).await.unwrap();
        let mut tail = [0u8; 7];
        conn.read_exact(&mut tail).await.unwrap();
        assert_eq!(&head, b"012");
        assert_eq!(&tail, b"3456789");
        let _server = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_path_is_rejected() {
        let (client, server) = duplex_pair();
        let server = tokio::spawn(async move { server_handshake(server, "/secret").await.is_err() });

        let settings = WebSocketSettings {
            path: "/guess".into(),
            ..Default::default()
        };
        assert!(client_handshake(client, &settings, &dest(), false).await.is_err());
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_is_seen_as_eof() {
        let (client, server) = duplex_pair();
        let server = tokio::spawn(async move {
            let mut conn = server_handshake(server, "/").await.unwrap();
            conn.shutdown().await.unwrap();
            assert!(conn.is_closed());
        });

        let mut conn = client_handshake(client, &WebSocketSettings::default(), &dest(), false)
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(conn.is_closed());
        server.await.unwrap();
    }
}
