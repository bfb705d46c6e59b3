//! Content digests under three independent hash functions.

use blake2::Blake2b512;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// Lowercase hex digests of one payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksums {
    /// SHA-256.
    pub sha256: String,
    /// SHA-512.
    pub sha512: String,
    /// BLAKE2b-512.
    pub blake2b: String,
}

impl Checksums {
    /// Digest `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self {
            sha256: hex::encode(Sha256::digest(data)),
            sha512: hex::encode(Sha512::digest(data)),
            blake2b: hex::encode(Blake2b512::digest(data)),
        }
    }

    /// Names of the digests that differ from `other`, in a fixed order.
    pub fn mismatches(&self, other: &Checksums) -> Vec<&'static str> {
        let mut differing = Vec::new();
        if !self.sha256.eq_ignore_ascii_case(&other.sha256) {
            differing.push("sha256");
        }
        if !self.sha512.eq_ignore_ascii_case(&other.sha512) {
            differing.push("sha512");
        }
        if !self.blake2b.eq_ignore_ascii_case(&other.blake2b) {
            differing.push("blake2b");
        }
        differing
    }

    /// `true` when all three digests agree.
    pub fn matches(&self, other: &Checksums) -> bool {
        self.mismatches(other).is_empty()
    }

    /// First 12 hex chars of the SHA-256, for log lines.
    pub fn short(&self) -> &str {
        self.sha256.get(..12).unwrap_or(&self.sha256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        let sums = Checksums::compute(b"abc");
        assert_eq!(
            sums.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            sums.sha512,
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
        assert_eq!(
            sums.blake2b,
            "ba80a53f981c4d0d6a2797b69f12f6e94c212f14685ac4b74b12bb6fdbffa2d1\
             7d87c5392aab792dc252d5de4533cc9518d38aa8dbf1925ab92386edd4009923"
        );
        assert_eq!(sums.short(), "ba7816bf8f01");
    }

    #[test]
    fn mismatches_name_each_digest() {
        let a = Checksums::compute(b"todo: buy milk");
        let b = Checksums::compute(b"todo: buy oat milk");
        assert!(a.matches(&a.clone()));
        assert_eq!(a.mismatches(&b), vec!["sha256", "sha512", "blake2b"]);

        let mut upper = a.clone();
        upper.sha256 = upper.sha256.to_uppercase();
        assert!(a.matches(&upper));
    }
}
