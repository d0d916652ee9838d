//! CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF)
//!
//! The trailer is sent low byte first, so running the CRC over a complete
//! frame including its trailer yields zero.

const POLY: u16 = 0xA001;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_table();

/// Running CRC, fed one byte at a time as bytes arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc16(u16);

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc16 {
    pub const fn new() -> Self {
        Self(0xFFFF)
    }

    #[inline]
    pub fn update(&mut self, byte: u8) {
        let index = ((self.0 ^ u16::from(byte)) & 0xFF) as usize;
        self.0 = (self.0 >> 8) ^ CRC_TABLE[index];
    }

    pub fn update_slice(&mut self, data: &[u8]) {
        for &b in data {
            self.update(b);
        }
    }

    pub fn value(self) -> u16 {
        self.0
    }

    /// True once a whole frame, trailer included, has been fed
    pub fn is_valid_frame(self) -> bool {
        self.0 == 0
    }
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update_slice(data);
    crc.value()
}

/// Append the CRC trailer, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check a complete frame including its trailer
pub fn verify_frame(frame: &[u8]) -> bool {
    frame.len() >= 4 && crc16(frame) == 0
}
