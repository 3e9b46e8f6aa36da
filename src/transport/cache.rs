//! Connection reuse cache
//!
//! Outbound connections whose owner marked them reusable are parked here on
//! close, keyed by `"{src}|{dest}|{settings fingerprint}"`, and handed out
//! again by the next dial to the same key. Parked connections expire after a TTL; a sweep task
//! drops expired ones and exits once the cache is empty, to be restarted
//! by the next recycle.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::{BoxedConnection, Connection};
use crate::common::{Address, Destination};

/// How long a parked connection stays reusable
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7);

/// Interval between sweeps of expired connections
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(4);

struct AwaitingConnection {
    conn: BoxedConnection,
    expires_at: Instant,
}

impl AwaitingConnection {
    fn is_stale(&self, now: Instant) -> bool {
        self.expires_at <= now || self.conn.is_closed()
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, VecDeque<AwaitingConnection>>,
    sweeper: Option<JoinHandle<()>>,
    closed: bool,
}

struct CacheInner {
    state: Mutex<CacheState>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl CacheInner {
    fn recycle(self: &Arc<Self>, key: String, mut conn: BoxedConnection) {
        if conn.is_closed() {
            return;
        }
        conn.set_deadline(None);

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            return;
        }
        trace!("Parking connection for {}", key);
        state.entries.entry(key).or_default().push_back(AwaitingConnection {
            conn,
            expires_at: Instant::now() + self.ttl,
        });

        let running = state.sweeper.as_ref().is_some_and(|task| !task.is_finished());
        if !running {
            // Without a runtime the entries still expire lazily in `get`
            if let Ok(handle) = Handle::try_current() {
                state.sweeper = Some(handle.spawn(sweep(Arc::downgrade(self), self.sweep_interval)));
            }
        }
    }
}

async fn sweep(cache: Weak<CacheInner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(cache) = cache.upgrade() else {
            return;
        };

        let now = Instant::now();
        let mut expired = Vec::new();
        let finished = {
            let mut state = cache.state.lock();
            if state.closed {
                return;
            }
            for list in state.entries.values_mut() {
                for entry in std::mem::take(list) {
                    if entry.is_stale(now) {
                        expired.push(entry.conn);
                    } else {
                        list.push_back(entry);
                    }
                }
            }
            state.entries.retain(|_, list| !list.is_empty());

            let finished = state.entries.is_empty();
            if finished {
                state.sweeper = None;
            }
            finished
        };

        if !expired.is_empty() {
            trace!("Dropped {} expired connections", expired.len());
        }
        drop(expired);
        if finished {
            return;
        }
    }
}

/// Cache of idle reusable connections
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::with_timing(DEFAULT_CACHE_TTL, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_timing(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
                ttl,
                sweep_interval,
            }),
        }
    }

    /// Cache key of a dial from `src` to `dest` over a stream with the given
    /// settings fingerprint (see `ResolvedStream::fingerprint`)
    pub fn key(src: Option<&Address>, dest: &Destination, fingerprint: &str) -> String {
        match src {
            Some(src) => format!("{}|{}|{}", src, dest, fingerprint),
            None => format!("|{}|{}", dest, fingerprint),
        }
    }

    /// Park an idle connection under `key`
    pub fn recycle(&self, key: impl Into<String>, conn: BoxedConnection) {
        self.inner.recycle(key.into(), conn);
    }

    /// Take the oldest live connection parked under `key`
    pub fn get(&self, key: &str) -> Option<BoxedConnection> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut state = self.inner.state.lock();
            let list = state.entries.get_mut(key)?;
            let mut found = None;
            while let Some(entry) = list.pop_front() {
                if entry.is_stale(now) {
                    stale.push(entry.conn);
                } else {
                    found = Some(entry.conn);
                    break;
                }
            }
            if list.is_empty() {
                state.entries.remove(key);
            }
            found
        };
        drop(stale);
        if found.is_some() {
            trace!("Reusing connection for {}", key);
        }
        found
    }

    /// Wrap a fresh or reused connection so closing it may recycle it
    pub fn wrap(&self, key: impl Into<String>, conn: BoxedConnection) -> PooledConnection {
        PooledConnection {
            inner: Some(conn),
            key: key.into(),
            cache: Arc::downgrade(&self.inner),
            reusable: false,
            closing: false,
        }
    }

    /// Number of parked connections
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every parked connection and refuse new ones
    pub fn close(&self) {
        let (entries, sweeper) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            (std::mem::take(&mut state.entries), state.sweeper.take())
        };
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        drop(entries);
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

/// A cached connection handle
///
/// Closing it with `reusable()` set parks the underlying connection in the
/// cache instead of shutting it down. Once closed, reads return EOF and
/// writes fail with `BrokenPipe`.
pub struct PooledConnection {
    inner: Option<BoxedConnection>,
    key: String,
    cache: Weak<CacheInner>,
    reusable: bool,
    closing: bool,
}

impl PooledConnection {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.closing {
            return Poll::Ready(Ok(()));
        }
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.closing {
            return Poll::Ready(Err(closed_pipe()));
        }
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closing {
            return Poll::Ready(Ok(()));
        }
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.closing {
            return Poll::Ready(Ok(()));
        }
        let Some(inner) = this.inner.as_mut() else {
            this.closing = true;
            return Poll::Ready(Ok(()));
        };

        let result = if this.reusable && !inner.is_closed() {
            // Parked on drop, the peer must not see a FIN
            ready!(Pin::new(inner).poll_flush(cx))
        } else {
            ready!(Pin::new(inner).poll_shutdown(cx))
        };
        this.closing = true;
        Poll::Ready(result)
    }
}

impl Connection for PooledConnection {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().and_then(|c| c.local_addr())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().and_then(|c| c.remote_addr())
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        if let Some(inner) = self.inner.as_mut() {
            inner.set_read_deadline(deadline);
        }
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        if let Some(inner) = self.inner.as_mut() {
            inner.set_write_deadline(deadline);
        }
    }

    fn reusable(&self) -> bool {
        self.reusable
    }

    fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    fn is_closed(&self) -> bool {
        self.closing || self.inner.as_ref().map_or(true, |c| c.is_closed())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if !self.reusable || inner.is_closed() {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.recycle(std::mem::take(&mut self.key), inner);
        }
    }
}
