//! UTF-8 reassembly
//!
//! Token pieces are raw bytes and a multi-byte character can be split across
//! two or more tokens. [`Utf8Assembler`] holds back a truncated trailing
//! sequence until the bytes that complete it arrive, so callers never see a
//! torn character at a chunk boundary.

/// Number of bytes in the sequence introduced by `lead`, or `None` when
/// `lead` cannot start a sequence.
fn sequence_width(lead: u8) -> Option<usize> {
    if lead & 0x80 == 0x00 {
        Some(1)
    } else if lead & 0xE0 == 0xC0 {
        Some(2)
    } else if lead & 0xF0 == 0xE0 {
        Some(3)
    } else if lead & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Length of the longest prefix of `bytes` that does not end inside a
/// truncated multi-byte sequence.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let mut i = 0;
    while i < bytes.len() {
        let Some(width) = sequence_width(bytes[i]) else {
            // stray continuation or invalid lead byte
            i += 1;
            continue;
        };
        let end = i + width;
        if end > bytes.len() {
            if bytes[i + 1..].iter().all(|&b| is_continuation(b)) {
                return i;
            }
            i += 1;
            continue;
        }
        if bytes[i + 1..end].iter().all(|&b| is_continuation(b)) {
            i = end;
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// Accumulates token bytes and releases them as whole characters.
///
/// Between calls the pending buffer holds at most one truncated trailing
/// sequence. Malformed bytes are released as U+FFFD instead of blocking the
/// stream.
#[derive(Debug, Clone, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every complete character buffered so far.
    ///
    /// Returns `None` when nothing can be released yet.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let cut = complete_prefix_len(&self.pending);
        if cut == 0 {
            return None;
        }

        let tail = self.pending.split_off(cut);
        let ready = std::mem::replace(&mut self.pending, tail);
        let text = match String::from_utf8(ready) {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!("Replacing malformed UTF-8 in token stream");
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        Some(text)
    }

    /// Bytes held back waiting for the rest of their character
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(chunks: &[&[u8]]) -> (Vec<String>, Utf8Assembler) {
        let mut assembler = Utf8Assembler::new();
        let out = chunks
            .iter()
            .filter_map(|chunk| assembler.push(chunk))
            .collect();
        (out, assembler)
    }

    #[test]
    fn test_sequence_width_classes() {
        assert_eq!(sequence_width(b'a'), Some(1));
        assert_eq!(sequence_width(0xC3), Some(2));
        assert_eq!(sequence_width(0xE2), Some(3));
        assert_eq!(sequence_width(0xF0), Some(4));
        assert_eq!(sequence_width(0x80), None);
        assert_eq!(sequence_width(0xFF), None);
    }

    #[test]
    fn test_ascii_passes_straight_through() {
        let (chunks, rest) = reassemble(&[b"He", b"llo"]);
        assert_eq!(chunks, vec!["He", "llo"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_split_four_byte_character() {
        let crab = "🦀".as_bytes();
        let mut assembler = Utf8Assembler::new();

        assert_eq!(assembler.push(&crab[..1]), None);
        assert_eq!(assembler.push(&crab[1..3]), None);
        assert_eq!(assembler.pending(), &crab[..3]);
        assert_eq!(assembler.push(&crab[3..]).as_deref(), Some("🦀"));
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_complete_prefix_is_released_before_truncated_tail() {
        let bytes = "ok é".as_bytes();
        let mut assembler = Utf8Assembler::new();

        let released = assembler.push(&bytes[..bytes.len() - 1]);
        assert_eq!(released.as_deref(), Some("ok "));
        assert_eq!(assembler.pending(), &bytes[bytes.len() - 2..bytes.len() - 1]);

        assert_eq!(assembler.push(&bytes[bytes.len() - 1..]).as_deref(), Some("é"));
    }

    #[test]
    fn test_any_split_reassembles_original_text() {
        let text = "Grüße, 世界! 🦀 naïve café — ∑x²";
        let bytes = text.as_bytes();

        for step in 1..=7 {
            let mut assembler = Utf8Assembler::new();
            let mut out = String::new();
            for chunk in bytes.chunks(step) {
                if let Some(piece) = assembler.push(chunk) {
                    assert!(std::str::from_utf8(piece.as_bytes()).is_ok());
                    out.push_str(&piece);
                }
                assert!(assembler.pending().len() < 4);
            }
            assert!(assembler.is_empty(), "split {step} left bytes behind");
            assert_eq!(out, text, "split {step}");
        }
    }

    #[test]
    fn test_irregular_splits_reassemble_original_text() {
        let text = "αβγ🦀δ";
        let bytes = text.as_bytes();
        let cuts = [1usize, 2, 5, 6, 9, 11];
        let mut chunks = Vec::new();
        let mut start = 0;
        for &cut in &cuts {
            chunks.push(&bytes[start..cut]);
            start = cut;
        }
        chunks.push(&bytes[start..]);

        let (out, rest) = reassemble(&chunks);
        assert!(rest.is_empty());
        assert_eq!(out.concat(), text);
    }

    #[test]
    fn test_malformed_bytes_do_not_stall() {
        let mut assembler = Utf8Assembler::new();
        let out = assembler.push(&[b'a', 0xFF, b'b']);
        assert_eq!(out.as_deref(), Some("a\u{FFFD}b"));

        // lead byte followed by a non-continuation byte
        let out = assembler.push(&[0xE2, b'x']);
        assert_eq!(out.as_deref(), Some("\u{FFFD}x"));
        assert!(assembler.is_empty());
    }
}
