//! HTTP/1.1 disguise for stream connections
//!
//! The client prefixes its first write with a request header and strips the
//! server's response header from the first read; the server does the mirror
//! image. After the headers, bytes pass through untouched.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use super::ConnectionAuthenticator;
use crate::error::{Error, Result};
use crate::transport::{BoxedConnection, Connection};

/// Upper bound on a peer's header block
const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRequestConfig {
    pub version: String,
    pub method: String,
    /// One path is picked at random per connection
    pub path: Vec<String>,
    /// One value per header is picked at random per connection
    pub headers: BTreeMap<String, Vec<String>>,
}

impl Default for HttpRequestConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Host".into(), vec!["www.baidu.com".into(), "www.bing.com".into()]);
        headers.insert(
            "User-Agent".into(),
            vec!["Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into()],
        );
        headers.insert("Accept-Encoding".into(), vec!["gzip, deflate".into()]);
        headers.insert("Connection".into(), vec!["keep-alive".into()]);
        headers.insert("Pragma".into(), vec!["no-cache".into()]);
        Self {
            version: "1.1".into(),
            method: "GET".into(),
            path: vec!["/".into()],
            headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpResponseConfig {
    pub version: String,
    pub status: String,
    pub reason: String,
    pub headers: BTreeMap<String, Vec<String>>,
}

impl Default for HttpResponseConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".into(), vec!["application/octet-stream".into(), "video/mpeg".into()]);
        headers.insert("Transfer-Encoding".into(), vec!["chunked".into()]);
        headers.insert("Connection".into(), vec!["keep-alive".into()]);
        headers.insert("Pragma".into(), vec!["no-cache".into()]);
        Self {
            version: "1.1".into(),
            status: "200".into(),
            reason: "OK".into(),
            headers,
        }
    }
}

/// Settings of the `http` connection authenticator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpHeaderConfig {
    pub request: HttpRequestConfig,
    pub response: HttpResponseConfig,
}

impl HttpHeaderConfig {
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Config(format!("invalid http header settings: {}", e)))
    }
}

fn pick<'a>(values: &'a [String], fallback: &'a str) -> &'a str {
    values
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
        .unwrap_or(fallback)
}

fn write_headers(out: &mut String, headers: &BTreeMap<String, Vec<String>>) {
    for (name, values) in headers {
        if values.is_empty() {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(pick(values, ""));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
}

fn is_request_head(head: &[u8]) -> bool {
    let method_len = head.iter().take_while(|b| b.is_ascii_uppercase()).count();
    method_len > 0 && head.get(method_len) == Some(&b' ')
}

fn is_response_head(head: &[u8]) -> bool {
    head.starts_with(b"HTTP/")
}

/// The `http` connection authenticator
pub struct HttpAuthenticator {
    config: HttpHeaderConfig,
}

impl HttpAuthenticator {
    pub fn new(config: HttpHeaderConfig) -> Self {
        Self { config }
    }

    fn request_head(&self) -> Vec<u8> {
        let req = &self.config.request;
        let mut out = format!("{} {} HTTP/{}\r\n", req.method, pick(&req.path, "/"), req.version);
        write_headers(&mut out, &req.headers);
        out.into_bytes()
    }

    fn response_head(&self) -> Vec<u8> {
        let resp = &self.config.response;
        let mut out = format!("HTTP/{} {} {}\r\n", resp.version, resp.status, resp.reason);
        write_headers(&mut out, &resp.headers);
        out.into_bytes()
    }
}

impl ConnectionAuthenticator for HttpAuthenticator {
    fn client(&self, conn: BoxedConnection) -> BoxedConnection {
        Box::new(HttpHeaderConnection::new(conn, self.request_head(), is_response_head))
    }

    fn server(&self, conn: BoxedConnection) -> BoxedConnection {
        Box::new(HttpHeaderConnection::new(conn, self.response_head(), is_request_head))
    }
}

enum ReadState {
    /// Accumulating the peer's header block
    Head(BytesMut),
    /// Body bytes that arrived together with the header
    Leftover(BytesMut),
    Body,
}

struct PendingWrite {
    data: Vec<u8>,
    offset: usize,
    payload_len: usize,
}

/// Connection wrapped by the HTTP disguise
pub struct HttpHeaderConnection {
    inner: BoxedConnection,
    head_to_send: Option<Vec<u8>>,
    pending: Option<PendingWrite>,
    read_state: ReadState,
    valid_head: fn(&[u8]) -> bool,
}

impl HttpHeaderConnection {
    fn new(inner: BoxedConnection, head_to_send: Vec<u8>, valid_head: fn(&[u8]) -> bool) -> Self {
        Self {
            inner,
            head_to_send: Some(head_to_send),
            pending: None,
            read_state: ReadState::Head(BytesMut::new()),
            valid_head,
        }
    }

    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<usize>>> {
        let Some(pending) = self.pending.as_mut() else {
            return Poll::Ready(Ok(None));
        };
        while pending.offset < pending.data.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &pending.data[pending.offset..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            pending.offset += n;
        }
        let payload_len = pending.payload_len;
        self.pending = None;
        Poll::Ready(Ok(Some(payload_len)))
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len()).position(|w| w == HEADER_END)
}

impl AsyncRead for HttpHeaderConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match &mut this.read_state {
                ReadState::Body => return Pin::new(&mut this.inner).poll_read(cx, buf),
                ReadState::Leftover(rest) => {
                    let n = rest.len().min(buf.remaining());
                    buf.put_slice(&rest[..n]);
                    rest.advance(n);
                    if rest.is_empty() {
                        this.read_state = ReadState::Body;
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::Head(acc) => {
                    let mut chunk = [0u8; 2048];
                    let mut chunk_buf = ReadBuf::new(&mut chunk);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
                    if chunk_buf.filled().is_empty() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside http header",
                        )));
                    }
                    acc.extend_from_slice(chunk_buf.filled());

                    if let Some(end) = find_header_end(acc) {
                        if !(this.valid_head)(&acc[..end]) {
                            return Poll::Ready(Err(Error::AuthFailed.into()));
                        }
                        let rest = acc.split_off(end + HEADER_END.len());
                        this.read_state = if rest.is_empty() {
                            ReadState::Body
                        } else {
                            ReadState::Leftover(rest)
                        };
                    } else if acc.len() > MAX_HEADER_SIZE {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "http header too large",
                        )));
                    }
                }
            }
        }
    }
}

impl AsyncWrite for HttpHeaderConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Some(head) = this.head_to_send.take() {
            let mut data = head;
            data.extend_from_slice(buf);
            this.pending = Some(PendingWrite {
                data,
                offset: 0,
                payload_len: buf.len(),
            });
        }
        if let Some(written) = ready!(this.poll_pending(cx))? {
            return Poll::Ready(Ok(written));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl Connection for HttpHeaderConnection {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.inner.set_write_deadline(deadline)
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
