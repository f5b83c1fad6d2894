//! Stable hashing helpers shared by allocation, flag bucketing and cache keys

use sha2::{Digest, Sha256};

/// Number of allocation buckets used for traffic splits
pub const BUCKETS: u64 = 10_000;

/// Map a sequence of key parts onto `[0, buckets)`.
///
/// Parts are joined with `:` before hashing, so `("exp", "user-1")` and
/// `("exp:user", "1")` collide by construction. Callers pass ids that do
/// not contain the separator.
pub fn stable_bucket(parts: &[&str], buckets: u64) -> u64 {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % buckets.max(1)
}

/// Bucket position as a fraction in `[0, 1)`
pub fn stable_fraction(parts: &[&str]) -> f64 {
    stable_bucket(parts, BUCKETS) as f64 / BUCKETS as f64
}

/// Hex SHA-256 of a text, used as the cache context hash
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_stable() {
        let a = stable_bucket(&["exp-1", "user-42"], BUCKETS);
        let b = stable_bucket(&["exp-1", "user-42"], BUCKETS);
        assert_eq!(a, b);
        assert!(a < BUCKETS);
    }

    #[test]
    fn test_fraction_spreads_keys() {
        let below = (0..2000)
            .filter(|i| stable_fraction(&["flag", &format!("tenant-{}", i)]) < 0.5)
            .count();
        assert!((800..1200).contains(&below), "got {}", below);
    }

    #[test]
    fn test_content_hash_hex() {
        let hash = content_hash("hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash("hello"));
        assert_ne!(hash, content_hash("hello!"));
    }
}
