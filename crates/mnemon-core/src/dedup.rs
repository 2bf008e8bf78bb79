//! Near-duplicate detection via SimHash
//!
//! A 64-bit locality-sensitive hash over memory content. Two texts that differ
//! only in small edits land within a few bits of each other, so duplicate
//! detection is a Hamming-distance comparison instead of a full-text diff.
//!
//! The exact-match fast path uses a plain FNV-1a hash over the normalized
//! content; the SimHash scan only runs when the exact hash misses.

// ============================================================================
// CONSTANTS
// ============================================================================

/// Hamming distance at or below which two simhashes are considered duplicates
pub const DUPLICATE_THRESHOLD: u32 = 3;

/// Minimum token length retained during tokenization
const MIN_TOKEN_LEN: usize = 3;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

// ============================================================================
// HASHING
// ============================================================================

/// FNV-1a 64-bit hash
#[inline]
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Exact content hash: FNV-1a over the whitespace-normalized, lowercased text.
///
/// Returned as 16 lowercase hex chars, same encoding as [`simhash`].
pub fn content_hash(content: &str) -> String {
    let normalized: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{:016x}", fnv1a64(normalized.to_lowercase().as_bytes()))
}

/// Compute the 64-bit SimHash of a text.
///
/// Tokenization: lowercase, strip punctuation, keep tokens longer than two
/// characters. Each token's FNV-1a hash votes on all 64 bit positions; the
/// final hash sets bit `i` iff the signed counter for `i` is positive.
/// An empty token set hashes to zero.
///
/// Output is 16 zero-padded lowercase hex chars.
pub fn simhash(content: &str) -> String {
    let mut counters = [0i32; 64];
    let mut any = false;

    for token in tokenize(content) {
        any = true;
        let hash = fnv1a64(token.as_bytes());
        for (i, counter) in counters.iter_mut().enumerate() {
            if (hash >> i) & 1 == 1 {
                *counter += 1;
            } else {
                *counter -= 1;
            }
        }
    }

    if !any {
        return format!("{:016x}", 0u64);
    }

    let mut hash = 0u64;
    for (i, &counter) in counters.iter().enumerate() {
        if counter > 0 {
            hash |= 1 << i;
        }
    }
    format!("{:016x}", hash)
}

fn tokenize(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN)
        .map(|t| t.to_lowercase())
}

// ============================================================================
// DISTANCE
// ============================================================================

/// Hamming distance between two 16-hex-char simhashes.
///
/// Symmetric, range `[0, 64]`. Unparseable input is treated as maximally
/// distant so malformed rows never register as duplicates.
pub fn hamming_distance(a: &str, b: &str) -> u32 {
    match (u64::from_str_radix(a, 16), u64::from_str_radix(b, 16)) {
        (Ok(x), Ok(y)) => (x ^ y).count_ones(),
        _ => 64,
    }
}

/// Whether two simhashes are near-duplicates under the default threshold
pub fn is_duplicate(a: &str, b: &str) -> bool {
    hamming_distance(a, b) <= DUPLICATE_THRESHOLD
}

// ============================================================================
// TESTS
// ============================================================================
