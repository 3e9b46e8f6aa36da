//! Unix domain socket carrier
//!
//! The socket path comes from the settings; the dial destination is only
//! used for logging. On Linux the path may name an abstract socket,
//! optionally NUL-padded to the full `sun_path` length.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::tls::{self, TlsSettings};
use super::{BoxedConnection, Listener, ResolvedStream, TransportBinder, TransportContext, TransportDialer, TransportSettings};
use crate::common::{Address, Destination};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainSocketSettings {
    pub path: String,
    /// Linux abstract namespace
    #[serde(rename = "abstract")]
    pub is_abstract: bool,
    /// Pad the abstract name with NULs to the full address length
    pub padding: bool,
}

impl TransportSettings for DomainSocketSettings {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(target_os = "linux")]
const SUN_PATH_LEN: usize = 108;

impl DomainSocketSettings {
    fn check(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::Config("domainsocket requires a path".into()));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn abstract_addr(&self) -> Result<std::os::unix::net::SocketAddr> {
        use std::os::linux::net::SocketAddrExt;

        let mut name = self.path.as_bytes().to_vec();
        if self.padding {
            // The leading NUL is implied by the abstract namespace
            name.resize(SUN_PATH_LEN - 1, 0);
        }
        Ok(std::os::unix::net::SocketAddr::from_abstract_name(name)?)
    }
}

#[cfg(unix)]
async fn connect(settings: &DomainSocketSettings) -> Result<tokio::net::UnixStream> {
    #[cfg(target_os = "linux")]
    if settings.is_abstract {
        let addr = settings.abstract_addr()?;
        let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
        stream.set_nonblocking(true)?;
        return Ok(tokio::net::UnixStream::from_std(stream)?);
    }
    Ok(tokio::net::UnixStream::connect(&settings.path).await?)
}

#[cfg(unix)]
fn bind(settings: &DomainSocketSettings) -> Result<tokio::net::UnixListener> {
    #[cfg(target_os = "linux")]
    if settings.is_abstract {
        let addr = settings.abstract_addr()?;
        let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
        listener.set_nonblocking(true)?;
        return Ok(tokio::net::UnixListener::from_std(listener)?);
    }

    // A socket file left behind by a previous run blocks the bind
    let path = std::path::Path::new(&settings.path);
    if path.exists() {
        debug!("Removing stale socket file {}", settings.path);
        std::fs::remove_file(path)?;
    }
    Ok(tokio::net::UnixListener::bind(path)?)
}

/// Outbound side of the `domainsocket` carrier
pub struct DomainSocketDialer;

#[async_trait]
impl TransportDialer for DomainSocketDialer {
    #[cfg(unix)]
    async fn dial(
        &self,
        _ctx: &TransportContext,
        _src: Option<&Address>,
        dest: &Destination,
        stream: &ResolvedStream,
    ) -> Result<BoxedConnection> {
        let settings = stream.settings::<DomainSocketSettings>()?;
        settings.check()?;
        debug!("Dialing {} through unix socket {}", dest, settings.path);

        let conn: BoxedConnection = Box::new(super::RawConnection::new(connect(settings).await?));
        match stream.tls() {
            Some(tls) => tls.client(conn, dest).await,
            None => Ok(conn),
        }
    }

    #[cfg(not(unix))]
    async fn dial(
        &self,
        _ctx: &TransportContext,
        _src: Option<&Address>,
        _dest: &Destination,
        _stream: &ResolvedStream,
    ) -> Result<BoxedConnection> {
        Err(Error::Unsupported("domainsocket".into()))
    }
}

/// Inbound side of the `domainsocket` carrier
pub struct DomainSocketBinder;

#[async_trait]
impl TransportBinder for DomainSocketBinder {
    #[cfg(unix)]
    async fn bind(&self, _ctx: &TransportContext, addr: &Address, stream: &ResolvedStream) -> Result<Box<dyn Listener>> {
        let settings = stream.settings::<DomainSocketSettings>()?;
        settings.check()?;
        let acceptor = stream.tls().map(TlsSettings::acceptor).transpose()?;
        let listener = bind(settings)?;
        debug!("domainsocket listener bound on {} (for {})", settings.path, addr);

        Ok(Box::new(UnixSocketListener {
            listener: Mutex::new(Some(Arc::new(listener))),
            settings: settings.clone(),
            acceptor,
        }))
    }

    #[cfg(not(unix))]
    async fn bind(&self, _ctx: &TransportContext, _addr: &Address, _stream: &ResolvedStream) -> Result<Box<dyn Listener>> {
        Err(Error::Unsupported("domainsocket".into()))
    }
}

#[cfg(unix)]
struct UnixSocketListener {
    listener: Mutex<Option<Arc<tokio::net::UnixListener>>>,
    settings: DomainSocketSettings,
    acceptor: Option<TlsAcceptor>,
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixSocketListener {
    async fn accept(&self) -> Result<BoxedConnection> {
        let listener = self.listener.lock().clone().ok_or(Error::ConnectionClosed)?;
        let (stream, _) = listener.accept().await?;
        Ok(Box::new(super::RawConnection::new(stream)))
    }

    async fn upgrade(&self, conn: BoxedConnection) -> Result<BoxedConnection> {
        match &self.acceptor {
            Some(acceptor) => tls::accept(acceptor, conn).await,
            None => Ok(conn),
        }
    }

    /// Unix sockets have no IP address; report the unspecified one
    fn local_addr(&self) -> Result<Address> {
        Ok(Address::unspecified())
    }

    async fn close(&self) -> Result<()> {
        let listener = self.listener.lock().take();
        if listener.is_some() && !self.settings.is_abstract {
            let _ = std::fs::remove_file(&self.settings.path);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::transport::{StreamSettings, TransportConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn stream_for(ctx: &TransportContext, settings: DomainSocketSettings) -> ResolvedStream {
        let mut stream = StreamSettings::with_protocol("domainsocket");
        stream
            .transport_settings
            .push(TransportConfig::new("domainsocket", Arc::new(settings)));
        ctx.resolve(&stream).unwrap()
    }

    async fn round_trip(settings: DomainSocketSettings) {
        let ctx = TransportContext::new(Registry::builtin().unwrap());
        let stream = stream_for(&ctx, settings);

        let listener = DomainSocketBinder
            .bind(&ctx, &Address::unspecified(), &stream)
            .await
            .unwrap();
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            listener.close().await.unwrap();
        });

        let dest = Destination::tcp(Address::domain("unused", 0));
        let mut conn = DomainSocketDialer.dial(&ctx, None, &dest, &stream).await.unwrap();
        conn.write_all(b"unix").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"unix");
        server.await.unwrap();
    }

    fn unique_name(tag: &str) -> String {
        format!("netium-{}-{}-{}", tag, std::process::id(), rand::random::<u32>())
    }

    #[tokio::test]
    async fn test_path_socket_round_trip() {
        let path = std::env::temp_dir().join(format!("{}.sock", unique_name("ds")));
        let settings = DomainSocketSettings {
            path: path.to_string_lossy().into_owned(),
            ..Default::default()
        };
        round_trip(settings).await;
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abstract_socket_round_trip() {
        for padding in [false, true] {
            round_trip(DomainSocketSettings {
                path: unique_name("abstract"),
                is_abstract: true,
                padding,
            })
            .await;
        }
    }

    #[tokio::test]
    async fn test_empty_path_rejected() {
        let ctx = TransportContext::new(Registry::builtin().unwrap());
        let stream = ctx.resolve(&StreamSettings::with_protocol("domainsocket")).unwrap();
        let dest = Destination::tcp(Address::domain("unused", 0));
        assert!(matches!(
            DomainSocketDialer.dial(&ctx, None, &dest, &stream).await,
            Err(Error::Config(_))
        ));
    }
}
