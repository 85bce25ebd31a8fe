use xxhash_rust::xxh64::xxh64;

/// Deterministic, seedless, non-cryptographic 64-bit hash.
///
/// Implementations must hash the raw bytes they are given so that a key computed
/// in one process matches the key computed in any other.
pub trait HashProvider: Send + Sync {
    fn hash(&self, data: &[u8]) -> u64;

    fn hash_str(&self, data: &str) -> u64 {
        self.hash(data.as_bytes())
    }
}

/// XXH64 with a zero seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHash64Provider;

impl HashProvider for XxHash64Provider {
    fn hash(&self, data: &[u8]) -> u64 {
        xxh64(data, 0)
    }
}
