//! Checksum-and-scramble authenticator
//!
//! Layout after sealing: `fnv1a32(len || payload) (4) | len (2) | payload`,
//! then every byte from offset 4 on is XORed with the byte four positions
//! earlier. Opening undoes the XOR back to front and verifies both fields.

use bytes::{BufMut, BytesMut};

use super::Authenticator;
use crate::error::{Error, Result};

const OVERHEAD: usize = 6;

fn fnv1a32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter().fold(OFFSET_BASIS, |hash, b| (hash ^ u32::from(*b)).wrapping_mul(PRIME))
}

pub struct SimpleAuthenticator;

impl Authenticator for SimpleAuthenticator {
    fn overhead(&self) -> usize {
        OVERHEAD
    }

    fn seal(&self, buf: &mut BytesMut) -> Result<()> {
        let length = u16::try_from(buf.len())
            .map_err(|_| Error::Protocol(format!("payload of {} bytes exceeds the length field", buf.len())))?;
        let mut out = BytesMut::with_capacity(OVERHEAD + buf.len());
        out.put_u32(0);
        out.put_u16(length);
        out.put_slice(buf);

        let hash = fnv1a32(&out[4..]);
        out[..4].copy_from_slice(&hash.to_be_bytes());

        for i in 4..out.len() {
            out[i] ^= out[i - 4];
        }
        *buf = out;
        Ok(())
    }

    fn open(&self, buf: &mut BytesMut) -> bool {
        if buf.len() < OVERHEAD {
            return false;
        }
        for i in (4..buf.len()).rev() {
            buf[i] ^= buf[i - 4];
        }

        let hash = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if fnv1a32(&buf[4..]) != hash {
            return false;
        }
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if length != buf.len() - OVERHEAD {
            return false;
        }
        let _ = buf.split_to(OVERHEAD);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32_reference() {
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
    }

    #[test]
    fn test_seal_open() {
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        SimpleAuthenticator.seal(&mut buf).unwrap();
        assert_eq!(buf.len(), 8 + OVERHEAD);
        assert_ne!(&buf[OVERHEAD..], b"abcdefgh");

        assert!(SimpleAuthenticator.open(&mut buf));
        assert_eq!(&buf[..], b"abcdefgh");
    }

    #[test]
    fn test_oversized_payload_refused() {
        let mut buf = BytesMut::zeroed(u16::MAX as usize + 1);
        let err = SimpleAuthenticator.seal(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(buf.len(), u16::MAX as usize + 1);

        let mut largest = BytesMut::zeroed(u16::MAX as usize);
        SimpleAuthenticator.seal(&mut largest).unwrap();
        assert!(SimpleAuthenticator.open(&mut largest));
        assert_eq!(largest.len(), u16::MAX as usize);
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        SimpleAuthenticator.seal(&mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(!SimpleAuthenticator.open(&mut buf));
    }
}
