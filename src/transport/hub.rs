//! Listener hub
//!
//! A `Hub` owns one bound listener and one accept task. Accepted
//! connections are upgraded and handed to the `ConnHandler` on their own
//! task. Failed accepts are retried with exponential backoff; the hub
//! keeps accepting until it is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BoxedConnection, Connection, Listener};
use crate::common::Address;
use crate::error::Result;

/// Receives upgraded inbound connections
#[async_trait]
pub trait ConnHandler: Send + Sync {
    async fn handle(&self, conn: BoxedConnection);
}

/// Retry policy for failed accepts
///
/// The delay for the n-th consecutive failure is `base * 2^(n-1)`, capped at
/// `max`. After `max_retries` failures in a row the exhaustion is logged and
/// the delay stays at its last value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptBackoff {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
            max_retries: 10,
        }
    }
}

impl AcceptBackoff {
    /// Delay after the `attempt`-th consecutive failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let attempt = attempt.min(self.max_retries.max(1));
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Starting,
    Accepting,
    Closed,
}

struct HubInner {
    listener: Arc<dyn Listener>,
    local_addr: Address,
    state: Mutex<HubState>,
}

/// A running listener
pub struct Hub {
    inner: Arc<HubInner>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Start accepting on an already bound listener
    pub fn start(listener: Box<dyn Listener>, handler: Arc<dyn ConnHandler>, backoff: AcceptBackoff) -> Result<Hub> {
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(HubInner {
            listener: Arc::from(listener),
            local_addr,
            state: Mutex::new(HubState::Starting),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(inner.clone(), handler, backoff, shutdown_rx));
        info!("Listening on {}", inner.local_addr);

        Ok(Hub {
            inner,
            closed: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> &Address {
        &self.inner.local_addr
    }

    pub fn state(&self) -> HubState {
        *self.inner.state.lock()
    }

    /// Stop accepting and close the listener. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.inner.state.lock() = HubState::Closed;
        let _ = self.shutdown.send(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Closed listener on {}", self.inner.local_addr);
        self.inner.listener.close().await
    }
}

async fn accept_loop(
    inner: Arc<HubInner>,
    handler: Arc<dyn ConnHandler>,
    backoff: AcceptBackoff,
    mut shutdown: watch::Receiver<bool>,
) {
    {
        let mut state = inner.state.lock();
        if *state == HubState::Starting {
            *state = HubState::Accepting;
        }
    }

    let mut failures: u32 = 0;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = inner.listener.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                failures = 0;
                debug!("Accepted connection on {} from {:?}", inner.local_addr, conn.remote_addr());
                let listener = inner.listener.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let upgraded = listener.upgrade(conn).await;
                    drop(listener);
                    match upgraded {
                        Ok(conn) => handler.handle(conn).await,
                        Err(e) => debug!("Inbound handshake failed: {}", e),
                    }
                });
            }
            Err(e) => {
                if *shutdown.borrow() {
                    break;
                }
                if e.requires_user_action() {
                    warn!("Accept on {} failed: {}", inner.local_addr, e);
                } else {
                    debug!("Accept on {} failed: {}", inner.local_addr, e);
                }

                failures = failures.saturating_add(1);
                if failures == backoff.max_retries.saturating_add(1) {
                    warn!(
                        "Accept on {} failed {} times in a row, continuing at {:?} intervals",
                        inner.local_addr,
                        backoff.max_retries,
                        backoff.delay(failures)
                    );
                }

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(backoff.delay(failures)) => {}
                }
            }
        }
    }
    debug!("Accept loop on {} stopped", inner.local_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::RawConnection;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Fails `failures` times, then yields a single connection, then blocks
    struct FlakyListener {
        failures: AtomicUsize,
        delivered: AtomicBool,
        attempts: Arc<Mutex<Vec<Instant>>>,
        closes: Arc<AtomicUsize>,
        error_kind: io::ErrorKind,
    }

    impl FlakyListener {
        fn new(failures: usize, error_kind: io::ErrorKind) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                delivered: AtomicBool::new(false),
                attempts: Arc::new(Mutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
                error_kind,
            }
        }
    }

    #[async_trait]
    impl Listener for FlakyListener {
        async fn accept(&self) -> Result<BoxedConnection> {
            self.attempts.lock().push(Instant::now());
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Io(io::Error::from(self.error_kind)));
            }
            if !self.delivered.swap(true, Ordering::SeqCst) {
                let (a, _b) = tokio::io::duplex(16);
                return Ok(Box::new(RawConnection::new(a)));
            }
            std::future::pending().await
        }

        fn local_addr(&self) -> Result<Address> {
            Ok(Address::unspecified())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ChannelHandler(mpsc::UnboundedSender<BoxedConnection>);

    #[async_trait]
    impl ConnHandler for ChannelHandler {
        async fn handle(&self, conn: BoxedConnection) {
            let _ = self.0.send(conn);
        }
    }

    #[test]
    fn test_backoff_delays() {
        let backoff = AcceptBackoff::default();
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(7), Duration::from_millis(640));
        assert_eq!(backoff.delay(8), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_retries_then_delivers_once() {
        let listener = FlakyListener::new(4, io::ErrorKind::ConnectionAborted);
        let attempts = listener.attempts.clone();
        let closes = listener.closes.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let hub = Hub::start(Box::new(listener), Arc::new(ChannelHandler(tx)), AcceptBackoff::default()).unwrap();

        let conn = rx.recv().await.unwrap();
        assert!(!conn.is_closed());
        assert_eq!(hub.state(), HubState::Accepting);

        // Four failures and the delivering accept; the loop may already be parked in a sixth
        let gaps: Vec<Duration> = attempts.lock()[..5].windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 4);
        assert!(gaps[0] >= Duration::from_millis(10));
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]), "{:?}", gaps);

        // No second delivery
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.is_err());

        hub.close().await.unwrap();
        hub.close().await.unwrap();
        assert_eq!(hub.state(), HubState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_accepting_after_retry_budget() {
        let listener = FlakyListener::new(12, io::ErrorKind::PermissionDenied);
        let attempts = listener.attempts.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backoff = AcceptBackoff {
            max_retries: 3,
            ..Default::default()
        };

        let hub = Hub::start(Box::new(listener), Arc::new(ChannelHandler(tx)), backoff).unwrap();
        rx.recv().await.unwrap();

        let gaps: Vec<Duration> = attempts.lock()[..13].windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 12);
        assert_eq!(gaps[11], Duration::from_millis(40));
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]), "{:?}", gaps);
        hub.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_backoff() {
        let listener = FlakyListener::new(usize::MAX, io::ErrorKind::ConnectionAborted);
        let (tx, _rx) = mpsc::unbounded_channel();
        let hub = Hub::start(Box::new(listener), Arc::new(ChannelHandler(tx)), AcceptBackoff::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.close().await.unwrap();
        assert_eq!(hub.state(), HubState::Closed);
    }
}
