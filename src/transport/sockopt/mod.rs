//! Socket option applier
//!
//! Raw-socket tuning applied right after a socket is created and before it
//! connects (outbound) or binds (inbound). The configuration is platform
//! neutral; each target OS gets one `SocketOptionApplier` implementation.
//!
//! Mark and TCP Fast Open are best effort: failures are logged and the
//! socket is used as-is. Transparent-proxy setup is required for the
//! listener to see redirected traffic, so its failure is returned.

mod fallback;
#[cfg(target_os = "freebsd")]
mod freebsd;
#[cfg(target_os = "linux")]
mod linux;

pub use fallback::FallbackApplier;

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use socket2::Socket;
use tokio::net::TcpStream;

use crate::common::Network;
use crate::error::Result;

/// TCP Fast Open state
///
/// Serialized as a lowercase name; the numeric form (0 = as-is, 1 = enable,
/// 2 = disable) is accepted as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "TfoRepr")]
pub enum TfoState {
    /// Leave the system default untouched
    #[default]
    AsIs,
    Enable,
    Disable,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TfoRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<TfoRepr> for TfoState {
    type Error = String;

    fn try_from(repr: TfoRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            TfoRepr::Code(0) => Ok(TfoState::AsIs),
            TfoRepr::Code(1) => Ok(TfoState::Enable),
            TfoRepr::Code(2) => Ok(TfoState::Disable),
            TfoRepr::Code(n) => Err(format!("unknown tfo state {}", n)),
            TfoRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "asis" | "as_is" => Ok(TfoState::AsIs),
                "enable" => Ok(TfoState::Enable),
                "disable" => Ok(TfoState::Disable),
                other => Err(format!("unknown tfo state '{}'", other)),
            },
        }
    }
}

/// Transparent proxy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TproxyMode {
    #[default]
    Off,
    /// IP_TRANSPARENT / IP_BINDANY: the socket sees the original destination as its local address
    #[serde(rename = "tproxy")]
    TProxy,
    /// NAT redirect: the original destination is queried from the conntrack table
    Redirect,
}

/// Per-socket tuning, immutable for one dial/listen call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketConfig {
    /// Connection mark, 0 = unset
    pub mark: u32,
    pub tfo: TfoState,
    pub tproxy: TproxyMode,
    pub receive_original_dest_address: bool,
}

impl SocketConfig {
    /// Whether any option would touch the socket
    pub fn is_default(&self) -> bool {
        *self == SocketConfig::default()
    }
}

/// Platform-specific raw socket tuning
pub trait SocketOptionApplier: Send + Sync {
    /// Tune a socket that is about to connect to `target`
    fn apply_outbound(&self, socket: &Socket, config: &SocketConfig, network: Network, target: &SocketAddr) -> Result<()>;

    /// Tune a socket that is about to bind to `bind`
    fn apply_inbound(&self, socket: &Socket, config: &SocketConfig, network: Network, bind: &SocketAddr) -> Result<()>;

    /// Recover the pre-redirect destination of an accepted connection.
    /// Returns `Error::Unsupported` where the platform has no such query.
    fn original_destination(&self, stream: &TcpStream, mode: TproxyMode) -> Result<SocketAddr>;
}

/// The applier for the platform this binary was built for
pub fn platform_applier() -> Arc<dyn SocketOptionApplier> {
    #[cfg(target_os = "linux")]
    return Arc::new(linux::LinuxApplier);

    #[cfg(target_os = "freebsd")]
    return Arc::new(freebsd::FreeBsdApplier);

    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
    return Arc::new(FallbackApplier);
}

#[cfg(unix)]
pub(crate) fn setsockopt_int(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // the option value is a plain c_int living on this stack frame.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
