//! Content-defined chunking via a rolling polynomial (gear) hash (spec
//! §4.3). A cut is emitted when the rolling fingerprint has a
//! configurable number of trailing zero bits, subject to `MIN ≤
//! chunk_len ≤ MAX`. The table below is the one fixed polynomial this
//! format commits to forever: changing it changes every chunk boundary
//! (and therefore every chunk id) ever produced, so it must never move
//! once published (spec §9 open question 3). It is derived
//! deterministically from a fixed seed rather than hand-listed, but is
//! exactly as frozen as a literal array would be.
//!
//! Grounded on `pbs-datastore/src/chunker.rs`'s `Chunker` struct shape
//! (`new`, `scan`, internal running hash, min/max fields) with the
//! table and boundary test swapped from Buzhash to a 64-bit gear
//! polynomial per spec's explicit "Rabin-polynomial ... trailing zero
//! bits" requirement.

use anyhow::{bail, Error};
use once_cell::sync::Lazy;

/// Fixed gear-hash polynomial table, one 64-bit value per byte value.
/// Built once from a fixed seed via splitmix64; never reseed this, it
/// would change every chunk boundary ever produced.
static GEAR: Lazy<[u64; 256]> = Lazy::new(|| {
    let mut table = [0u64; 256];
    let mut state: u64 = 0x9E3779B97F4A7C15;
    for slot in table.iter_mut() {
        state = state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        *slot = z ^ (z >> 31);
    }
    table
});

/// Minimal CDC chunk size (spec default: 512 KiB).
pub const DEFAULT_MIN: usize = 512 * 1024;
/// Maximal CDC chunk size (spec default: 8 MiB).
pub const DEFAULT_MAX: usize = 8 * 1024 * 1024;

/// Rolling content-defined chunker. Single-threaded per file; different
/// files may be chunked in parallel (spec §4.3).
pub struct Chunker {
    hash: u64,
    chunk_len: usize,
    min: usize,
    max: usize,
    mask: u64,
}

impl Chunker {
    /// `min`/`max` need not be powers of two; the cut-probability mask is
    /// derived from their midpoint so the *average* chunk size lands near
    /// `sqrt(min * max)`, matching the teacher's `avg/4 .. avg*4` spread
    /// when `min`/`max` are chosen that way (e.g. the spec defaults).
    pub fn new(min: usize, max: usize) -> Result<Self, Error> {
        if min == 0 || max <= min {
            bail!("invalid chunker bounds: min={min} max={max}");
        }
        let avg = (min as u64).saturating_mul(max as u64).max(1);
        let mut bits = 0u32;
        let mut probe: u64 = 1;
        while probe.checked_mul(probe).map(|sq| sq < avg).unwrap_or(false) && bits < 63 {
            probe <<= 1;
            bits += 1;
        }
        let mask = if bits == 0 { 0 } else { (1u64 << bits) - 1 };
        Ok(Self {
            hash: 0,
            chunk_len: 0,
            min,
            max,
            mask,
        })
    }

    /// Feed one more byte; returns `true` exactly when this byte ends the
    /// current chunk (either the rolling fingerprint hit its target, or
    /// `max` was reached). Resets internal state when it returns `true`.
    fn push(&mut self, byte: u8) -> bool {
        self.hash = (self.hash << 1).wrapping_add(GEAR[byte as usize]);
        self.chunk_len += 1;

        let cut = self.chunk_len >= self.max
            || (self.chunk_len >= self.min && (self.hash & self.mask) == 0);
        if cut {
            self.hash = 0;
            self.chunk_len = 0;
        }
        cut
    }

    /// Scan `data`, returning the offset of the first chunk boundary
    /// found within it, or `0` if `data` was exhausted with no boundary
    /// (the chunker's internal position carries over to the next call).
    pub fn scan(&mut self, data: &[u8]) -> usize {
        for (pos, &byte) in data.iter().enumerate() {
            if self.push(byte) {
                return pos + 1;
            }
        }
        0
    }
}

/// Split `data` (the full body of a file already known to be `>= min`
/// bytes) into content-defined chunks. Files shorter than `min` bypass
/// the chunker entirely and are handled by the caller as a single whole
/// chunk (spec §4.3).
pub fn chunk_bytes(data: &[u8], min: usize, max: usize) -> Result<Vec<&[u8]>, Error> {
    let mut chunker = Chunker::new(min, max)?;
    let mut chunks = Vec::new();
    let mut start = 0;
    for (pos, &byte) in data.iter().enumerate() {
        if chunker.push(byte) {
            chunks.push(&data[start..pos + 1]);
            start = pos + 1;
        }
    }
    if start < data.len() {
        chunks.push(&data[start..]);
    }
    Ok(chunks)
}
