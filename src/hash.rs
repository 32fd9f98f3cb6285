//! Content identity: SHA-1 over raw bytes, rendered as 40-char lowercase
//! hex (spec §4.1). Index ids use a random 256-bit value instead, so
//! that metadata-identical snapshots produced in the same millisecond
//! don't collide.

/// SHA-1 digest of `data`, as 40-char lowercase hex.
pub fn hex_id(data: &[u8]) -> String {
    let digest = openssl::sha::sha1(data);
    hex::encode(digest)
}

/// SHA-1 digest of `data`, as raw bytes.
pub fn digest(data: &[u8]) -> [u8; 20] {
    openssl::sha::sha1(data)
}

/// A fresh, cryptographically random id for a new index (snapshot): a
/// random 256-bit value, SHA-1-hashed and hex-rendered so it looks like
/// any other content id (spec §3, §4.1, §9 open question 2).
///
/// Primary path: 32 random bytes from the OS CSPRNG (via OpenSSL's
/// `RAND_bytes`, the same source `codec::CryptConfig` uses for GCM
/// IVs), hashed with SHA-1. Fallback (only exercised if OpenSSL's RNG
/// fails to fill the buffer): hash 32 bytes pulled from a
/// non-cryptographic PRNG seeded off the system clock. This fallback is
/// preserved per spec but is explicitly *not* cryptographically
/// meaningful.
pub fn random_index_id() -> String {
    let mut buf = [0u8; 32];
    match openssl::rand::rand_bytes(&mut buf) {
        Ok(()) => hex::encode(openssl::sha::sha1(&buf)),
        Err(_) => {
            let seed = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            let mut state = seed ^ 0x9E3779B97F4A7C15;
            let mut weak_buf = [0u8; 32];
            for chunk in weak_buf.chunks_mut(8) {
                // xorshift64*
                state ^= state >> 12;
                state ^= state << 25;
                state ^= state >> 27;
                let val = state.wrapping_mul(0x2545F4914F6CDD1D);
                let bytes = val.to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
            hex::encode(openssl::sha::sha1(&weak_buf))
        }
    }
}
