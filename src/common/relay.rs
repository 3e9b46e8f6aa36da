//! Bidirectional relay between two connections
//!
//! Each direction copies until EOF or error, then shuts its write side down
//! so the peer observes the half-close. The relay as a whole ends when both
//! directions are done, or when no byte has moved in either direction for
//! the idle timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

use crate::transport::BoxedConnection;

/// Default buffer size for relay operations (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Relay data between an inbound and an outbound connection
pub async fn relay(inbound: BoxedConnection, outbound: BoxedConnection, idle_timeout: Duration) -> RelayStats {
    let (in_reader, in_writer) = tokio::io::split(inbound);
    let (out_reader, out_writer) = tokio::io::split(outbound);

    // Millis since `start` of the last successful transfer, shared by both directions
    let start = Instant::now();
    let activity = Arc::new(AtomicU64::new(0));

    let upload = copy_half(in_reader, out_writer, start, activity.clone());
    let download = copy_half(out_reader, in_writer, start, activity.clone());
    tokio::pin!(upload, download);

    let mut stats = RelayStats::default();
    let mut upload_done = false;
    let mut download_done = false;

    while !(upload_done && download_done) {
        let last = Duration::from_millis(activity.load(Ordering::Relaxed));
        let deadline = start + last + idle_timeout;

        tokio::select! {
            n = &mut upload, if !upload_done => {
                stats.uploaded = n;
                upload_done = true;
            }
            n = &mut download, if !download_done => {
                stats.downloaded = n;
                download_done = true;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let last = Duration::from_millis(activity.load(Ordering::Relaxed));
                if Instant::now() >= start + last + idle_timeout {
                    trace!("relay idle for {:?}, closing", idle_timeout);
                    break;
                }
            }
        }
    }

    stats
}

async fn copy_half<R, W>(mut reader: R, mut writer: W, start: Instant, activity: Arc<AtomicU64>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = BytesMut::zeroed(RELAY_BUFFER_SIZE);

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() || writer.flush().await.is_err() {
            break;
        }
        total += n as u64;
        activity.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawConnection;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (client, a) = tokio::io::duplex(1024);
        let (b, server) = tokio::io::duplex(1024);

        let task = tokio::spawn(relay(
            Box::new(RawConnection::new(a)),
            Box::new(RawConnection::new(b)),
            Duration::from_secs(30),
        ));

        let (mut client, mut server) = (client, server);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        drop(server);
        let stats = task.await.unwrap();
        assert_eq!(stats, RelayStats { uploaded: 4, downloaded: 5 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_idle_timeout() {
        let (_client, a) = tokio::io::duplex(1024);
        let (b, _server) = tokio::io::duplex(1024);

        let stats = relay(
            Box::new(RawConnection::new(a)),
            Box::new(RawConnection::new(b)),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(stats, RelayStats::default());
    }
}
