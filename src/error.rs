//! Error types for the Netium transport layer

use std::io;

use thiserror::Error;

/// Main error type for the transport layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// A second registration under a name that is already taken
    #[error("{kind} '{name}' is already registered")]
    DuplicateRegistration { kind: &'static str, name: String },

    /// No dialer/listener/authenticator registered under this name
    #[error("{kind} '{name}' is not registered")]
    NotRegistered { kind: &'static str, name: String },

    /// No settings factory known for this name
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// The peer did not present the expected header or key
    #[error("Authentication failed")]
    AuthFailed,

    /// A read or write deadline passed
    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl Error {
    pub fn not_registered(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotRegistered { kind, name: name.into() }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound { kind, name: name.into() }
    }

    pub fn duplicate(kind: &'static str, name: impl Into<String>) -> Self {
        Error::DuplicateRegistration { kind, name: name.into() }
    }

    /// Whether an accept failure needs an operator to fix something
    /// (permissions, descriptor or memory exhaustion) rather than a retry.
    pub fn requires_user_action(&self) -> bool {
        let Error::Io(e) = self else {
            return false;
        };
        if e.kind() == io::ErrorKind::PermissionDenied {
            return true;
        }
        #[cfg(unix)]
        if let Some(code) = e.raw_os_error() {
            return matches!(
                code,
                libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EACCES | libc::EPERM
            );
        }
        false
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::ConnectionClosed => io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
            Error::AuthFailed => io::Error::new(io::ErrorKind::InvalidData, Error::AuthFailed),
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, Error::Timeout),
            Error::Unsupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result type alias for the transport layer
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_action_classification() {
        let denied = Error::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(denied.requires_user_action());

        let reset = Error::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!reset.requires_user_action());

        #[cfg(unix)]
        {
            let emfile = Error::Io(io::Error::from_raw_os_error(libc::EMFILE));
            assert!(emfile.requires_user_action());
        }

        assert!(!Error::ConnectionClosed.requires_user_action());
    }

    #[test]
    fn test_into_io_error() {
        let e: io::Error = Error::ConnectionClosed.into();
        assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);

        let e: io::Error = Error::Timeout.into();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);

        let e: io::Error = Error::AuthFailed.into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);
        let inner = e.get_ref().and_then(|inner| inner.downcast_ref::<Error>());
        assert!(matches!(inner, Some(Error::AuthFailed)));
        assert!(!Error::AuthFailed.requires_user_action());
    }
}
