/// Seeded 32-bit hash over a byte string. Consumes 4-byte little-endian
/// words, then falls through the remaining tail bytes. Used for cache
/// bucket indexing and shard selection, so it only has to be deterministic
/// and well distributed, not stable across releases.
pub fn hash(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0xc6a4a793;
    const R: u32 = 24;

    let mut h = seed ^ (data.len() as u32).wrapping_mul(M);

    let mut chunks = data.chunks_exact(4);
    for word in chunks.by_ref() {
        let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        h = h.wrapping_add(w);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h = h.wrapping_add((tail[2] as u32) << 16);
    }
    if tail.len() >= 2 {
        h = h.wrapping_add((tail[1] as u32) << 8);
    }
    if !tail.is_empty() {
        h = h.wrapping_add(tail[0] as u32);
        h = h.wrapping_mul(M);
        h ^= h >> R;
    }

    h
}
