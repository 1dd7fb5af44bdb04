//! Incremental line decoder for agent stdout.
//!
//! Bytes are buffered until a `\n` arrives. A newline byte can never occur
//! inside a multi-byte UTF-8 sequence, so a line is only decoded once all of
//! its bytes are present and characters split across reads stay intact.

/// Splits an unbounded byte stream into complete text lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    finished: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        // `complete` ends with '\n', drop the newline so split yields only lines
        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(decode_line)
            .collect()
    }

    /// End of stream: flush the trailing partial line once, even without a
    /// terminating newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        self.finished = true;
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multibyte_character_split_across_chunks() {
        let text = "héllo 🌍\n".as_bytes();
        // split inside the 4-byte globe emoji
        let split = text.len() - 3;
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(&text[..split]).is_empty());
        let lines = decoder.feed(&text[split..]);
        assert_eq!(lines, vec!["héllo 🌍".to_string()]);
    }

    #[test]
    fn every_split_point_yields_the_same_line() {
        let text = "{\"text\":\"日本語\"}\n".as_bytes();
        for split in 0..=text.len() {
            let mut decoder = LineDecoder::new();
            let mut lines = decoder.feed(&text[..split]);
            lines.extend(decoder.feed(&text[split..]));
            assert_eq!(lines, vec!["{\"text\":\"日本語\"}".to_string()], "split at {split}");
        }
    }

    #[test]
    fn several_lines_in_one_chunk_keep_order() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.feed(b"one\ntwo\r\nthree\npart");
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(decoder.finish().as_deref(), Some("part"));
    }

    #[test]
    fn empty_lines_are_preserved_for_the_caller() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.feed(b"a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn finish_flushes_trailing_partial_line_once() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"{\"type\":\"result\"}").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("{\"type\":\"result\"}"));
        assert_eq!(decoder.finish(), None);
        assert!(decoder.feed(b"late\n").is_empty());
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.feed(b"ok\xff\n");
        assert_eq!(lines, vec!["ok\u{FFFD}"]);
    }
}
