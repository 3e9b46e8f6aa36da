//! DTLS 1.2 application-data record header

use parking_lot::Mutex;

use super::PacketHeader;

const CONTENT_TYPE_APPLICATION_DATA: u8 = 23;
const DTLS_1_2: [u8; 2] = [254, 253];

struct DtlsState {
    sequence: u32,
    length: u16,
}

pub struct DtlsHeader {
    epoch: u16,
    state: Mutex<DtlsState>,
}

impl DtlsHeader {
    pub fn new() -> Self {
        Self {
            epoch: rand::random(),
            state: Mutex::new(DtlsState {
                sequence: 0,
                length: 17,
            }),
        }
    }
}

impl Default for DtlsHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHeader for DtlsHeader {
    fn size(&self) -> usize {
        13
    }

    fn write(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();

        buf[0] = CONTENT_TYPE_APPLICATION_DATA;
        buf[1..3].copy_from_slice(&DTLS_1_2);
        buf[3..5].copy_from_slice(&self.epoch.to_be_bytes());
        // 48-bit sequence number, upper 16 bits stay zero
        buf[5] = 0;
        buf[6] = 0;
        buf[7..11].copy_from_slice(&state.sequence.to_be_bytes());
        buf[11..13].copy_from_slice(&state.length.to_be_bytes());

        state.sequence = state.sequence.wrapping_add(1);
        state.length += 17;
        if state.length > 100 {
            state.length -= 50;
        }
        13
    }
}
