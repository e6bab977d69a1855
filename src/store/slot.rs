//! Shard slot hashing
//!
//! Keys are assigned to one of [`SLOT_COUNT`] slots by CRC16 (XMODEM
//! polynomial) of the key bytes, modulo the slot count. When a key contains
//! a hash tag (a non-empty substring delimited by the first `{` and the next
//! `}`), only the tag is hashed, so related keys can be forced onto the same
//! slot. This matches the slot assignment of clustered stores, which is what
//! makes single-slot pipelines routable.

/// Total number of shard slots
pub const SLOT_COUNT: u16 = 16384;

/// Compute the shard slot for a key
pub fn key_slot(key: &str) -> u16 {
    crc16(hash_tag(key.as_bytes())) % SLOT_COUNT
}

/// Extract the hash-tag substring, falling back to the whole key when no
/// non-empty tag is present
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close) = key[open + 1..].iter().position(|&b| b == b'}') {
            // An empty tag "{}" hashes the whole key
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

/// CRC16 with the XMODEM polynomial (0x1021), zero initial value
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_known_slots() {
        // Reference slot assignments from clustered stores
        assert_eq!(key_slot("foo"), 12182);
        assert_eq!(key_slot("bar"), 5061);
    }

    #[test]
    fn test_slot_is_stable() {
        let a = key_slot("mydomain_api_key_abc_1234567890");
        let b = key_slot("mydomain_api_key_abc_1234567890");
        assert_eq!(a, b);
        assert!(a < SLOT_COUNT);
    }

    #[test]
    fn test_hash_tag_colocates_keys() {
        let followers = key_slot("{user1000}.followers");
        let following = key_slot("{user1000}.following");
        assert_eq!(followers, following);
        assert_eq!(followers, key_slot("user1000"));
    }

    #[test]
    fn test_first_tag_wins() {
        assert_eq!(key_slot("{a}{b}"), key_slot("a"));
        assert_eq!(key_slot("x{a}y{b}z"), key_slot("a"));
    }

    #[test]
    fn test_tag_extraction() {
        assert_eq!(hash_tag(b"{user1000}.followers"), b"user1000");
        assert_eq!(hash_tag(b"x{a}y{b}z"), b"a");
        // An empty or unclosed tag falls back to the whole key
        assert_eq!(hash_tag(b"{}different"), b"{}different");
        assert_eq!(hash_tag(b"{unclosed"), b"{unclosed");
        assert_eq!(hash_tag(b"no_tag_at_all"), b"no_tag_at_all");
    }
}
