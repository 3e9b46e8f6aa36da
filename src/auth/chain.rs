use bytes::BytesMut;

use super::{Authenticator, HeaderAuthenticator};
use crate::error::Result;
use crate::registry::Registry;

/// Ordered composition of authenticators
///
/// Sealing runs back to front so the first authenticator ends up as the
/// outermost layer; opening runs front to back. A packet that fails to open
/// at any stage is cleared.
#[derive(Default)]
pub struct AuthenticatorChain {
    stages: Vec<Box<dyn Authenticator>>,
}

impl AuthenticatorChain {
    pub fn new(stages: Vec<Box<dyn Authenticator>>) -> Self {
        Self { stages }
    }

    pub fn push(&mut self, stage: Box<dyn Authenticator>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Authenticator for AuthenticatorChain {
    fn overhead(&self) -> usize {
        self.stages.iter().map(|s| s.overhead()).sum()
    }

    fn seal(&self, buf: &mut BytesMut) -> Result<()> {
        for stage in self.stages.iter().rev() {
            stage.seal(buf)?;
        }
        Ok(())
    }

    fn open(&self, buf: &mut BytesMut) -> bool {
        for stage in &self.stages {
            if !stage.open(buf) {
                buf.clear();
                return false;
            }
        }
        true
    }
}

/// Builds the datagram pipeline used by packet-based carriers:
/// `[header, authenticator]`, header outermost.
pub struct PacketPipeline;

impl PacketPipeline {
    pub fn build(registry: &Registry, header: &str, security: &str, seed: &str) -> Result<AuthenticatorChain> {
        let mut chain = AuthenticatorChain::default();
        if !header.is_empty() && header != "none" {
            chain.push(Box::new(HeaderAuthenticator::new(registry.create_header(header)?)));
        }
        let security = if security.is_empty() { "none" } else { security };
        chain.push(registry.create_authenticator(security, seed)?);
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AeadAuthenticator, AeadKind, NoneAuthenticator, SimpleAuthenticator};

    fn sample_chain() -> AuthenticatorChain {
        AuthenticatorChain::new(vec![
            Box::new(AeadAuthenticator::from_seed(AeadKind::Aes128Gcm, "k")),
            Box::new(SimpleAuthenticator),
        ])
    }

    #[test]
    fn test_chain_round_trip() {
        let chain = sample_chain();
        for payload in [&b""[..], b"x", b"a longer payload spanning several words"] {
            let mut buf = BytesMut::from(payload);
            chain.seal(&mut buf).unwrap();
            assert_eq!(buf.len(), payload.len() + chain.overhead());
            assert!(chain.open(&mut buf));
            assert_eq!(&buf[..], payload);
        }
    }

    #[test]
    fn test_chain_overhead_is_sum() {
        let chain = sample_chain();
        assert_eq!(chain.overhead(), 28 + 6);

        let mut chain = AuthenticatorChain::default();
        assert_eq!(chain.overhead(), 0);
        chain.push(Box::new(NoneAuthenticator));
        assert_eq!(chain.overhead(), 0);
    }

    #[test]
    fn test_open_order_matters() {
        let mut buf = BytesMut::from(&b"payload"[..]);
        sample_chain().seal(&mut buf).unwrap();

        let reversed = AuthenticatorChain::new(vec![
            Box::new(SimpleAuthenticator),
            Box::new(AeadAuthenticator::from_seed(AeadKind::Aes128Gcm, "k")),
        ]);
        assert!(!reversed.open(&mut buf));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pipeline_from_registry() {
        let registry = Registry::builtin().unwrap();
        let pipeline = PacketPipeline::build(&registry, "wechat-video", "chacha20-poly1305", "seed").unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.overhead(), 13 + 28);

        let mut buf = BytesMut::from(&b"datagram"[..]);
        pipeline.seal(&mut buf).unwrap();
        // Header is the outermost layer
        assert_eq!(buf[0], 0xa1);
        assert!(pipeline.open(&mut buf));
        assert_eq!(&buf[..], b"datagram");
    }

    #[test]
    fn test_pipeline_unknown_names() {
        let registry = Registry::builtin().unwrap();
        assert!(PacketPipeline::build(&registry, "quake", "none", "").is_err());
        assert!(PacketPipeline::build(&registry, "none", "rot13", "").is_err());
    }
}
