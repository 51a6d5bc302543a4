//! Table-driven CRC-32 engine
//!
//! Standard reflected CRC-32 (polynomial 0xEDB88320, seed 0xFFFFFFFF,
//! complemented output), the same variant zlib computes. Every frame on
//! the wire is validated and signed with it, so both ends must agree
//! bit-for-bit.

const CRC32_POLY: u32 = 0xEDB8_8320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut byt = 0;
    while byt < 256 {
        let mut crc = byt as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[byt] = crc;
        byt += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_table();

/// Incremental CRC-32 state
///
/// Streamed reads fold arbitrarily large flash regions through this
/// without buffering them.
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Start a new computation (seed 0xFFFFFFFF)
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Fold `data` into the running CRC
    pub fn update(&mut self, data: &[u8]) {
        for &byt in data {
            let idx = ((self.state ^ byt as u32) & 0xFF) as usize;
            self.state = (self.state >> 8) ^ CRC32_TABLE[idx];
        }
    }

    /// Finish the computation and return the complemented CRC
    pub fn finalize(self) -> u32 {
        !self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot CRC-32 of a byte slice
pub fn checksum(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(checksum(&[]), 0x0000_0000);
    }

    #[test]
    fn reference_vector() {
        // The standard check value for reflected CRC-32
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut crc = Crc32::new();
        crc.update(&data[..10]);
        crc.update(&data[10..]);
        assert_eq!(crc.finalize(), checksum(data));
    }

    #[test]
    fn single_byte() {
        assert_eq!(checksum(&[0x00]), 0xD202_EF8D);
        assert_eq!(checksum(&[0xFF]), 0xFF00_0000);
    }
}
