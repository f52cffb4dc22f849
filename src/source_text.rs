use memchr::memchr_iter;

/// Byte offset → 1-based line lookups over one source text.
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = Vec::with_capacity(text.len() / 32 + 1);
        starts.push(0);
        starts.extend(memchr_iter(b'\n', text.as_bytes()).map(|i| i + 1));
        Self { starts }
    }

    pub fn line_of(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }
}

/// Heuristic binary check: NUL in the first 8 KiB.
pub fn looks_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(8192)];
    memchr::memchr(0, head).is_some()
}

/// Whole-word (identifier) counts for a source text. Identifiers follow JS
/// rules closely enough: `[A-Za-z_$][A-Za-z0-9_$]*`.
pub fn identifier_counts(text: &str) -> std::collections::HashMap<&str, usize> {
    let mut counts = std::collections::HashMap::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if is_ident_start(b) {
            let start = i;
            while i < bytes.len() && is_ident_continue(bytes[i]) {
                i += 1;
            }
            *counts.entry(&text[start..i]).or_insert(0) += 1;
        } else if b.is_ascii_digit() {
            // skip numeric literals so `1e3` does not count `e3`
            while i < bytes.len() && is_ident_continue(bytes[i]) {
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    counts
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_of_offsets() {
        let text = "ab\ncd\n\nef";
        let idx = LineIndex::new(text);
        assert_eq!(idx.line_of(0), 1);
        assert_eq!(idx.line_of(2), 1); // the newline itself
        assert_eq!(idx.line_of(3), 2);
        assert_eq!(idx.line_of(6), 3);
        assert_eq!(idx.line_of(7), 4);
    }

    #[test]
    fn identifier_counts_are_whole_word() {
        let counts = identifier_counts("foo foobar $foo foo.bar 1e3");
        assert_eq!(counts.get("foo"), Some(&2));
        assert_eq!(counts.get("foobar"), Some(&1));
        assert_eq!(counts.get("$foo"), Some(&1));
        assert_eq!(counts.get("e3"), None);
    }

    #[test]
    fn nul_byte_means_binary() {
        assert!(looks_binary(b"abc\0def"));
        assert!(!looks_binary(b"plain text"));
    }
}
