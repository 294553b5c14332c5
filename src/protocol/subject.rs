//! Subject references and CRC-32C hashing
//!
//! A `Subject` borrows the bytes of a subject, pattern, prefix or sid and
//! caches their 32-bit hash. Equality is always byte-exact; the hash only
//! picks the bucket.
//!
//! Wildcard rules:
//!
//! ```text
//! A.B.C     literal
//! A.*.C     `*` matches exactly one segment
//! A.>       `>` matches one or more trailing segments
//! A*.B      literal (`*` is not its own segment)
//! A.>.B     literal (`>` only counts as the last segment)
//! ```

use std::cell::OnceCell;
use std::fmt;

/// Borrowed subject with a lazily computed hash
#[derive(Clone)]
pub struct Subject<'a> {
    bytes: &'a [u8],
    hash: OnceCell<u32>,
}

impl<'a> Subject<'a> {
    /// Wrap subject bytes, hash computed on first use
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            hash: OnceCell::new(),
        }
    }

    /// Wrap subject bytes with a hash that is already known
    pub fn with_hash(bytes: &'a [u8], hash: u32) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(hash);
        Self { bytes, hash: cell }
    }

    /// The raw bytes
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// CRC-32C of the bytes, computed once
    pub fn hash(&self) -> u32 {
        *self.hash.get_or_init(|| crc32c(self.bytes))
    }

    /// Byte-exact comparison
    pub fn equals(&self, other: &[u8]) -> bool {
        self.bytes == other
    }

    /// First byte, used to index the wildcard first-character table
    pub fn first_byte(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// Leading `len` bytes as a new subject
    pub fn prefix(&self, len: usize) -> Subject<'a> {
        Subject::new(&self.bytes[..len.min(self.bytes.len())])
    }

    /// True if any segment is a wildcard token
    pub fn is_wild(&self) -> bool {
        wildcard_prefix_len(self.bytes).is_some()
    }

    /// Rejects empty subjects, leading or trailing `.`, and empty segments
    pub fn is_valid(&self) -> bool {
        let b = self.bytes;
        if b.is_empty() || b[0] == b'.' || b[b.len() - 1] == b'.' {
            return false;
        }
        !b.windows(2).any(|w| w == b"..")
    }

    /// Length of the literal prefix before the first wildcard token
    pub fn wildcard_prefix_len(&self) -> Option<usize> {
        wildcard_prefix_len(self.bytes)
    }
}

impl PartialEq for Subject<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Subject<'_> {}

impl fmt::Debug for Subject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subject({:?})", String::from_utf8_lossy(self.bytes))
    }
}

impl fmt::Display for Subject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.bytes))
    }
}

/// True if the byte at `i` occupies a whole segment
fn is_own_segment(b: &[u8], i: usize) -> bool {
    (i == 0 || b[i - 1] == b'.') && (i + 1 == b.len() || b[i + 1] == b'.')
}

/// Offset of the first wildcard token, which is also the literal prefix length
///
/// `*` counts anywhere it forms its own segment, `>` only as the final
/// segment.
pub fn wildcard_prefix_len(b: &[u8]) -> Option<usize> {
    let star = b
        .iter()
        .enumerate()
        .find(|&(i, &c)| c == b'*' && is_own_segment(b, i))
        .map(|(i, _)| i);
    if star.is_some() {
        return star;
    }
    match b.last() {
        Some(b'>') if is_own_segment(b, b.len() - 1) => Some(b.len() - 1),
        _ => None,
    }
}

/// Rewrite standalone wildcard segments so a published subject cannot be
/// taken for a pattern: `*` becomes `+`, `>` becomes `<`
pub fn encode_wildcards(subject: &[u8]) -> Vec<u8> {
    let mut out = subject.to_vec();
    for i in 0..subject.len() {
        if is_own_segment(subject, i) {
            match subject[i] {
                b'*' => out[i] = b'+',
                b'>' => out[i] = b'<',
                _ => {}
            }
        }
    }
    out
}

/// Reverse of [`encode_wildcards`]
pub fn decode_wildcards(subject: &[u8]) -> Vec<u8> {
    let mut out = subject.to_vec();
    for i in 0..subject.len() {
        if is_own_segment(subject, i) {
            match subject[i] {
                b'+' => out[i] = b'*',
                b'<' => out[i] = b'>',
                _ => {}
            }
        }
    }
    out
}

const CRC32C_POLY: u32 = 0x82f6_3b78;

const CRC32C_TABLE: [u32; 256] = build_crc32c_table();

const fn build_crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut k = 0;
        while k < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            k += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-32C (Castagnoli) of `data`
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c_seeded(data, 0)
}

/// CRC-32C continuing from `seed`
pub fn crc32c_seeded(data: &[u8], seed: u32) -> u32 {
    let mut crc = !seed;
    for &byte in data {
        crc = CRC32C_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_known_vector() {
        // Standard check value for "123456789"
        assert_eq!(crc32c(b"123456789"), 0xe306_9283);
        assert_eq!(crc32c(b""), 0);
    }

    #[test]
    fn test_hash_cached() {
        let s = Subject::new(b"A.B.C");
        let h = s.hash();
        assert_eq!(h, crc32c(b"A.B.C"));
        assert_eq!(s.hash(), h);

        let forced = Subject::with_hash(b"A.B.C", 7);
        assert_eq!(forced.hash(), 7);
        assert_eq!(forced, s); // equality ignores the hash
    }

    #[test]
    fn test_is_wild() {
        assert!(Subject::new(b"*").is_wild());
        assert!(Subject::new(b">").is_wild());
        assert!(Subject::new(b"A.>").is_wild());
        assert!(Subject::new(b"A.*").is_wild());
        assert!(Subject::new(b"A.*.C").is_wild());
        assert!(Subject::new(b"*.B").is_wild());

        assert!(!Subject::new(b"A.B").is_wild());
        assert!(!Subject::new(b"A*").is_wild());
        assert!(!Subject::new(b"A.B*.C").is_wild());
        assert!(!Subject::new(b"A.>.B").is_wild());
        assert!(!Subject::new(b"").is_wild());
    }

    #[test]
    fn test_wildcard_prefix_len() {
        assert_eq!(wildcard_prefix_len(b"A.*.C"), Some(2));
        assert_eq!(wildcard_prefix_len(b"A.*.D"), Some(2));
        assert_eq!(wildcard_prefix_len(b"A.B.>"), Some(4));
        assert_eq!(wildcard_prefix_len(b">"), Some(0));
        assert_eq!(wildcard_prefix_len(b"*.B.>"), Some(0));
        assert_eq!(wildcard_prefix_len(b"A.B"), None);
    }

    #[test]
    fn test_is_valid() {
        assert!(Subject::new(b"A.B.C").is_valid());
        assert!(Subject::new(b"A").is_valid());
        assert!(!Subject::new(b"").is_valid());
        assert!(!Subject::new(b".A").is_valid());
        assert!(!Subject::new(b"A.").is_valid());
        assert!(!Subject::new(b"A..B").is_valid());
    }

    #[test]
    fn test_encode_decode_wildcards() {
        assert_eq!(encode_wildcards(b"A.*.>"), b"A.+.<".to_vec());
        assert_eq!(encode_wildcards(b"A*.B>"), b"A*.B>".to_vec());
        assert_eq!(decode_wildcards(b"A.+.<"), b"A.*.>".to_vec());
        assert_eq!(decode_wildcards(b"C++.x"), b"C++.x".to_vec());
    }

    #[test]
    fn test_prefix() {
        let s = Subject::new(b"A.B.C");
        assert_eq!(s.prefix(2).as_bytes(), b"A.");
        assert_eq!(s.prefix(99).as_bytes(), b"A.B.C");
        assert!(s.prefix(0).is_empty());
    }
}
