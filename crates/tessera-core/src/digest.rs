//! Keyed digest used for connection priority.
//!
//! Both ends of a connection compute the same two digests from the
//! same pair of nonces, so the hash only has to agree between peers.
//! BLAKE3 is used everywhere else in Tessera, so it is used here too.

/// Produce a fixed-length (64 char) lowercase hex digest of `input`.
pub fn digest(input: &str) -> String {
    hex::encode(blake3::hash(input.as_bytes()).as_bytes())
}

/// Length in characters of every string returned by [`digest`].
pub const DIGEST_HEX_LEN: usize = 64;

/// Hashing seam for priority decisions.
///
/// Production code uses [`Blake3Digest`]. Tests substitute doubles to
/// force collisions or fixed orderings.
pub trait NonceDigest: Send + Sync {
    fn digest(&self, input: &str) -> String;
}

/// The default [`NonceDigest`], backed by [`digest`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Digest;

impl NonceDigest for Blake3Digest {
    fn digest(&self, input: &str) -> String {
        digest(input)
    }
}
