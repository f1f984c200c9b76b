//! 16-bit checksum engine, CRC16-CCITT with polynomial x^16 + x^12 + x^5 + 1 in the
//! byte-swap/nibble-swizzle formulation. The same accumulator is used for page footers,
//! wear record trailers and validation, whether the bytes come from RAM or are streamed
//! from flash.

/// Seed for every new checksum run.
pub(crate) const CHECKSUM_INIT: u16 = 0xFFFF;

/// Fold `bytes` into a running checksum. Calling this repeatedly over consecutive chunks
/// is equivalent to one call over the concatenation.
pub(crate) fn accumulate(mut crc: u16, bytes: &[u8]) -> u16 {
    for &byte in bytes {
        crc = (crc >> 8) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0x00F0) >> 4;
        crc ^= (crc & 0x000F) << 12;
        crc ^= (crc & 0x00FF) << 5;
    }
    crc
}
