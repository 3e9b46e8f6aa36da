//! WeChat video call looking header

use std::sync::atomic::{AtomicU32, Ordering};

use super::PacketHeader;

const TAIL: [u8; 7] = [0x00, 0x10, 0x11, 0x18, 0x30, 0x22, 0x30];

pub struct WechatVideoHeader {
    sn: AtomicU32,
}

impl WechatVideoHeader {
    pub fn new() -> Self {
        Self {
            sn: AtomicU32::new(u32::from(rand::random::<u16>())),
        }
    }
}

impl Default for WechatVideoHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHeader for WechatVideoHeader {
    fn size(&self) -> usize {
        13
    }

    fn write(&self, buf: &mut [u8]) -> usize {
        let sn = self.sn.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        buf[0] = 0xa1;
        buf[1] = 0x08;
        buf[2..6].copy_from_slice(&sn.to_be_bytes());
        buf[6..13].copy_from_slice(&TAIL);
        13
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let header = WechatVideoHeader::new();
        let mut buf = [0u8; 13];
        header.write(&mut buf);
        assert_eq!(&buf[..2], &[0xa1, 0x08]);
        assert_eq!(&buf[6..], &TAIL);
    }
}
