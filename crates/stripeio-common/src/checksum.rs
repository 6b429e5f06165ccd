//! Checksum helpers for stripeio
//!
//! CRC32C is used for shard integrity: each shard carries a cumulative hash
//! folded over every append, so the full-object hash never needs a re-read.

/// Seed for an empty cumulative hash.
///
/// A shard hash that has never been folded holds this value; folding the
/// first append replaces it.
pub const CRC_INITIAL: u32 = u32::MAX;

/// Compute the CRC32C of a buffer
#[inline]
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Fold more data into a cumulative CRC32C
#[inline]
#[must_use]
pub fn crc32c_append(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_known_value() {
        // RFC 3720 test vector: 32 zero bytes
        assert_eq!(crc32c(&[0u8; 32]), 0x8a91_36aa);
    }

    #[test]
    fn test_append_matches_one_shot() {
        let data = b"cumulative shard hash folding";
        let split = data.len() / 2;
        let folded = crc32c_append(crc32c(&data[..split]), &data[split..]);
        assert_eq!(folded, crc32c(data));
    }

    #[test]
    fn test_verify() {
        let data = b"shard bytes";
        let crc = crc32c(data);
        assert!(verify_crc32c(data, crc));
        assert!(!verify_crc32c(b"shard bytez", crc));
    }
}
