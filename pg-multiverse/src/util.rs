//! Small helpers.

use std::hash::Hasher;

use fnv::FnvHasher;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the input.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }

    out
}

/// 32-bit FNV hash of the input.
pub fn fnv32(input: &str) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(input.as_bytes());
    hasher.finish() as u32
}

/// Render a number in base 36, lowercase.
pub fn base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".into();
    }

    let mut out = vec![];
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();

    String::from_utf8(out).unwrap_or_default()
}

/// Cache key for a query: `"query:"` plus a base-36 hash over the
/// statement, parameters, and schema.
pub fn cache_key(sql: &str, params: &[Value], schema: Option<&str>) -> String {
    let params = serde_json::to_string(params).unwrap_or_default();
    let input = format!("{}|{}|{}", sql, params, schema.unwrap_or(""));

    format!("query:{}", base36(fnv32(&input)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        // Well-known digest of the empty string.
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(sha256_hex("a"), sha256_hex("b"));
    }

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }

    #[test]
    fn test_cache_key_stable() {
        let a = cache_key("SELECT 1", &[], Some("users"));
        let b = cache_key("SELECT 1", &[], Some("users"));
        let c = cache_key("SELECT 1", &[], Some("orders"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("query:"));
    }
}
