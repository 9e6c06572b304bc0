use std::{
    sync::OnceLock,
    time::Instant,
};

use sha2::{Digest, Sha256};

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[cfg_attr(feature = "esp32", allow(dead_code))]
pub fn sha256_hex(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

/// Compares a published digest (any case, surrounding whitespace allowed)
/// against a computed lowercase one.
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sha256_hex_matches_reference_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn published_digests_are_normalized() {
        let actual = sha256_hex(b"abc");
        assert!(digest_matches(
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD\n",
            &actual
        ));
        assert!(!digest_matches("ba78", &actual));
    }

    #[test]
    fn monotonic_clock_never_goes_back() {
        let first = monotonic_ms();
        assert!(monotonic_ms() >= first);
    }
}
