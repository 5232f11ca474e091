//! Incremental UTF-8 decoding for byte streams.

/// Turns arbitrary byte chunks into text without splitting multi-byte characters.
///
/// Bytes of an incomplete trailing sequence are held back until the next chunk.
/// Invalid sequences are replaced lossily.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, returning whatever text is complete so far.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);
        let valid_up_to = utf8_boundary(&bytes);
        if valid_up_to < bytes.len() {
            self.pending = bytes[valid_up_to..].to_vec();
        }
        String::from_utf8_lossy(&bytes[..valid_up_to]).into_owned()
    }

    /// Flush held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        // error_len() == None: the input ends mid-character
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ascii_passes_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"hello"), "hello");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_split_multibyte_character_is_held_back() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Decoder::new();
        // 'é' is two bytes at offsets 1..3; split between them
        assert_eq!(decoder.push(&bytes[..2]), "h");
        assert_eq!(decoder.push(&bytes[2..]), "éllo");
    }

    #[test]
    fn test_incomplete_tail_flushed_lossily() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }
}
