//! AEAD packet authenticators (AES-128-GCM, ChaCha20-Poly1305)
//!
//! Sealed layout: `nonce (12) | ciphertext | tag (16)`. The key is derived
//! from the configured seed with SHA-256.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;
use bytes::{BufMut, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::Authenticator;
use crate::error::{Error, Result};

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    Aes128Gcm,
    ChaCha20Poly1305,
}

enum Cipher {
    Aes128Gcm(Box<Aes128Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

pub struct AeadAuthenticator {
    cipher: Cipher,
}

impl AeadAuthenticator {
    pub fn from_seed(kind: AeadKind, seed: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        let cipher = match kind {
            AeadKind::Aes128Gcm => {
                Cipher::Aes128Gcm(Box::new(Aes128Gcm::new(GenericArray::from_slice(&key[..16]))))
            }
            AeadKind::ChaCha20Poly1305 => {
                Cipher::ChaCha20Poly1305(Box::new(ChaCha20Poly1305::new(GenericArray::from_slice(&key))))
            }
        };
        Self { cipher }
    }
}

impl Authenticator for AeadAuthenticator {
    fn overhead(&self) -> usize {
        NONCE_SIZE + TAG_SIZE
    }

    fn seal(&self, buf: &mut BytesMut) -> Result<()> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce_ref = GenericArray::from_slice(&nonce);

        let tag = match &self.cipher {
            Cipher::Aes128Gcm(c) => c.encrypt_in_place_detached(nonce_ref, b"", buf),
            Cipher::ChaCha20Poly1305(c) => c.encrypt_in_place_detached(nonce_ref, b"", buf),
        }
        .map_err(|e| Error::Crypto(format!("packet seal failed: {}", e)))?;

        let mut out = BytesMut::with_capacity(NONCE_SIZE + buf.len() + TAG_SIZE);
        out.put_slice(&nonce);
        out.put_slice(buf);
        out.put_slice(&tag);
        *buf = out;
        Ok(())
    }

    fn open(&self, buf: &mut BytesMut) -> bool {
        if buf.len() < NONCE_SIZE + TAG_SIZE {
            return false;
        }
        let nonce = buf.split_to(NONCE_SIZE);
        let tag = buf.split_off(buf.len() - TAG_SIZE);
        let nonce = GenericArray::from_slice(&nonce);
        let tag = GenericArray::from_slice(&tag);

        let result = match &self.cipher {
            Cipher::Aes128Gcm(c) => c.decrypt_in_place_detached(nonce, b"", buf, tag),
            Cipher::ChaCha20Poly1305(c) => c.decrypt_in_place_detached(nonce, b"", buf, tag),
        };
        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_both_ciphers() {
        for kind in [AeadKind::Aes128Gcm, AeadKind::ChaCha20Poly1305] {
            let auth = AeadAuthenticator::from_seed(kind, "seed");
            let mut buf = BytesMut::from(&b"secret payload"[..]);
            auth.seal(&mut buf).unwrap();
            assert_eq!(buf.len(), 14 + auth.overhead());

            assert!(auth.open(&mut buf), "{:?}", kind);
            assert_eq!(&buf[..], b"secret payload");
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealer = AeadAuthenticator::from_seed(AeadKind::Aes128Gcm, "one");
        let opener = AeadAuthenticator::from_seed(AeadKind::Aes128Gcm, "two");
        let mut buf = BytesMut::from(&b"data"[..]);
        sealer.seal(&mut buf).unwrap();
        assert!(!opener.open(&mut buf));
    }
}
