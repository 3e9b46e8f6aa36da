//! WireGuard transport-data looking header

use super::PacketHeader;

pub struct WireguardHeader;

impl PacketHeader for WireguardHeader {
    fn size(&self) -> usize {
        4
    }

    fn write(&self, buf: &mut [u8]) -> usize {
        buf[..4].copy_from_slice(&[0x04, 0x00, 0x00, 0x00]);
        4
    }
}
