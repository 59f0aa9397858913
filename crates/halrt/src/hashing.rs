//! Stable FNV-1a hashing for fingerprints and on-disk artifact names.

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Folds a length-prefixed string so that `("ab", "c")` and `("a", "bc")` differ.
pub fn fnv1a_str(hash: u64, value: &str) -> u64 {
    let hash = fnv1a_bytes(hash, &(value.len() as u64).to_le_bytes());
    fnv1a_bytes(hash, value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn length_prefix_separates_concatenations() {
        let left = fnv1a_str(fnv1a_str(fnv1a_init(), "ab"), "c");
        let right = fnv1a_str(fnv1a_str(fnv1a_init(), "a"), "bc");
        assert_ne!(left, right);
    }
}
