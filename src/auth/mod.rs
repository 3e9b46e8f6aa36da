//! Packet authenticators
//!
//! An `Authenticator` seals a datagram in place (prepending, transforming,
//! appending) and opens it again, rejecting anything it did not produce.
//! Authenticators compose into an `AuthenticatorChain`, which is itself an
//! `Authenticator`.

mod aead;
mod chain;
mod simple;

pub use aead::{AeadAuthenticator, AeadKind};
pub use chain::{AuthenticatorChain, PacketPipeline};
pub use simple::SimpleAuthenticator;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::header::PacketHeader;
use crate::registry::RegistryBuilder;

/// Packet-oriented seal/open transform
pub trait Authenticator: Send + Sync {
    /// Bytes `seal` adds to a packet
    fn overhead(&self) -> usize;

    fn seal(&self, buf: &mut BytesMut) -> Result<()>;

    /// Verify and strip; `false` means the packet must be dropped
    fn open(&self, buf: &mut BytesMut) -> bool;
}

/// Authenticator that adds nothing and accepts everything
pub struct NoneAuthenticator;

impl Authenticator for NoneAuthenticator {
    fn overhead(&self) -> usize {
        0
    }

    fn seal(&self, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn open(&self, _buf: &mut BytesMut) -> bool {
        true
    }
}

/// Adapts a `PacketHeader` into an authenticator: seal prepends a fresh
/// header, open strips exactly `size()` bytes.
pub struct HeaderAuthenticator {
    header: Box<dyn PacketHeader>,
}

impl HeaderAuthenticator {
    pub fn new(header: Box<dyn PacketHeader>) -> Self {
        Self { header }
    }
}

impl Authenticator for HeaderAuthenticator {
    fn overhead(&self) -> usize {
        self.header.size()
    }

    fn seal(&self, buf: &mut BytesMut) -> Result<()> {
        let size = self.header.size();
        if size == 0 {
            return Ok(());
        }
        let mut out = BytesMut::with_capacity(size + buf.len());
        out.resize(size, 0);
        self.header.write(&mut out[..size]);
        out.put_slice(buf);
        *buf = out;
        Ok(())
    }

    fn open(&self, buf: &mut BytesMut) -> bool {
        let size = self.header.size();
        if buf.len() < size {
            return false;
        }
        let _ = buf.split_to(size);
        true
    }
}

fn none_authenticator(_seed: &str) -> Result<Box<dyn Authenticator>> {
    Ok(Box::new(NoneAuthenticator))
}

fn simple_authenticator(_seed: &str) -> Result<Box<dyn Authenticator>> {
    Ok(Box::new(SimpleAuthenticator))
}

fn aes_128_gcm_authenticator(seed: &str) -> Result<Box<dyn Authenticator>> {
    if seed.is_empty() {
        return Err(Error::Config("aes-128-gcm authenticator requires a key".into()));
    }
    Ok(Box::new(AeadAuthenticator::from_seed(AeadKind::Aes128Gcm, seed)))
}

fn chacha20_poly1305_authenticator(seed: &str) -> Result<Box<dyn Authenticator>> {
    if seed.is_empty() {
        return Err(Error::Config("chacha20-poly1305 authenticator requires a key".into()));
    }
    Ok(Box::new(AeadAuthenticator::from_seed(AeadKind::ChaCha20Poly1305, seed)))
}

/// Register every built-in packet authenticator
pub fn register_builtin(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register_authenticator("none", none_authenticator)?;
    builder.register_authenticator("simple", simple_authenticator)?;
    builder.register_authenticator("aes-128-gcm", aes_128_gcm_authenticator)?;
    builder.register_authenticator("chacha20-poly1305", chacha20_poly1305_authenticator)?;
    Ok(())
}
