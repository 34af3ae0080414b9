use rand::{rngs::StdRng, RngCore, SeedableRng};

/// Fills `buf` with cryptographically-strong random bytes, for connection ID
/// generation, PATH_CHALLENGE payloads, and stateless-reset token material.
pub fn fill(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

pub fn bytes(len: usize) -> Vec<u8> {
    let mut v = vec![0u8; len];
    fill(&mut v);
    v
}

/// A seedable RNG for deterministic test fixtures, mirroring the teacher's
/// reproducible LCG but backed by a real PRNG so distributions are sane.
pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
