//! uTP (BitTorrent) looking header

use super::PacketHeader;

pub struct UtpHeader {
    header: u8,
    extension: u8,
    connection_id: u16,
}

impl UtpHeader {
    pub fn new() -> Self {
        Self {
            header: 1,
            extension: 0,
            connection_id: rand::random(),
        }
    }
}

impl Default for UtpHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHeader for UtpHeader {
    fn size(&self) -> usize {
        4
    }

    fn write(&self, buf: &mut [u8]) -> usize {
        buf[..2].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[2] = self.header;
        buf[3] = self.extension;
        4
    }
}
