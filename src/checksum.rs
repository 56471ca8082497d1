//! BSL link checksum.
//!
//! Reflected CRC-32 (polynomial 0xEDB88320) computed bit by bit, register
//! seeded with 0xFFFFFFFF and complemented on output.

pub const CRC32_POLY: u32 = 0xEDB8_8320;
pub const CRC32_INIT: u32 = 0xFFFF_FFFF;

/// Compute the checksum over `data`
pub fn checksum(data: &[u8]) -> u32 {
    let mut crc = CRC32_INIT;

    for b in data {
        crc ^= *b as u32;

        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC32_POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}
