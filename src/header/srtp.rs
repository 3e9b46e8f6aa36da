//! SRTP-looking header: fixed marker plus a rolling sequence number

use std::sync::atomic::{AtomicU16, Ordering};

use super::PacketHeader;

const SRTP_MARKER: u16 = 0xB5E8;

pub struct SrtpHeader {
    number: AtomicU16,
}

impl SrtpHeader {
    pub fn new() -> Self {
        Self {
            number: AtomicU16::new(rand::random()),
        }
    }
}

impl Default for SrtpHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHeader for SrtpHeader {
    fn size(&self) -> usize {
        4
    }

    fn write(&self, buf: &mut [u8]) -> usize {
        let number = self.number.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        buf[..2].copy_from_slice(&SRTP_MARKER.to_be_bytes());
        buf[2..4].copy_from_slice(&number.to_be_bytes());
        4
    }
}
