//! Pluggable proof-of-work hash backend
//!
//! The pool validates proofs against whichever hash the hosted chain uses.
//! The default backend is double-SHA256; chains with a custom algorithm
//! supply their own `PowHash` implementation at wiring time.

use sha2::{Digest, Sha256};

use crate::Hash;

/// A proof-of-work hash over a serialized 80-byte block header.
///
/// The returned digest is interpreted as a little-endian 256-bit integer
/// when compared against targets.
pub trait PowHash: Send + Sync {
    /// Name of the algorithm, reported in job payloads
    fn algorithm(&self) -> &'static str;

    /// Hash a serialized block header
    fn pow_hash(&self, header: &[u8]) -> Hash;
}

/// Double-SHA256, the classic Bitcoin-family header hash
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256d;

impl PowHash for Sha256d {
    fn algorithm(&self) -> &'static str {
        "sha256d"
    }

    fn pow_hash(&self, header: &[u8]) -> Hash {
        let first = Sha256::digest(header);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        out
    }
}

/// Double-SHA256 of arbitrary bytes, used for txids and merkle nodes
pub fn sha256d(data: &[u8]) -> Hash {
    Sha256d.pow_hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256d_known_vector() {
        // sha256d("hello") is a fixed, well-known digest
        let digest = sha256d(b"hello");
        assert_eq!(
            hex::encode(digest),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn test_algorithm_name() {
        assert_eq!(Sha256d.algorithm(), "sha256d");
    }
}
