//! Stateful line framing for the pipe layer (spec §4.1).
//!
//! Lines terminate on `LF`, `CR`, or `CRLF`. A `CR` at the very end of a
//! buffer defers the decision until the next buffer arrives, so a straddling
//! `CRLF` is never reported as two lines (spec §8 scenario 4).

/// Decodes a byte stream into complete lines, one buffer at a time.
///
/// The decoder is stateful across calls to [`LineDecoder::feed`] so that
/// multi-byte sequences and straddling line terminators split across reads
/// are handled correctly. It does not do character-set decoding itself
/// beyond UTF-8 (the only encoding the core's own pipes use); the injector
/// control pipe's UTF-16 framing on Windows is handled by transcoding to
/// UTF-8 before reaching this type, since this decoder only reasons about
/// line boundaries in front of the already-decoded byte stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    /// True if the last buffer ended in a bare `CR` whose classification
    /// (lone `CR` vs. the first half of `CRLF`) is still undecided.
    trailing_cr: bool,
}

impl LineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        LineDecoder::default()
    }

    /// Feeds a chunk of bytes, returning the complete lines it produced.
    ///
    /// Bytes that don't yet complete a line are buffered internally and
    /// included in the next call's output once a terminator arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut chunk = chunk;

        if self.trailing_cr {
            self.trailing_cr = false;
            if let Some(&first) = chunk.first() {
                if first == b'\n' {
                    // Completes a CRLF that straddled the buffer boundary:
                    // the line ended at the CR, flush it now.
                    lines.push(self.take_pending_as_line());
                    chunk = &chunk[1..];
                } else {
                    // The previous CR was a lone terminator.
                    lines.push(self.take_pending_as_line());
                }
            } else {
                // Empty chunk: still don't know. Re-arm and wait for more
                // bytes (or EOF, which the caller resolves separately).
                self.trailing_cr = true;
                return lines;
            }
        }

        let mut start = 0;
        let mut i = 0;
        while i < chunk.len() {
            match chunk[i] {
                b'\n' => {
                    self.pending.extend_from_slice(&chunk[start..i]);
                    lines.push(self.take_pending_as_line());
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    self.pending.extend_from_slice(&chunk[start..i]);
                    if chunk.get(i + 1) == Some(&b'\n') {
                        lines.push(self.take_pending_as_line());
                        i += 2;
                    } else if i + 1 == chunk.len() {
                        // CR at the very end: defer to the next feed().
                        self.trailing_cr = true;
                        i += 1;
                    } else {
                        lines.push(self.take_pending_as_line());
                        i += 1;
                    }
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.pending.extend_from_slice(&chunk[start..]);

        lines
    }

    /// Signals end-of-stream: flushes a final unterminated line, if any.
    pub fn finish(mut self) -> Option<String> {
        if self.trailing_cr {
            return Some(self.take_pending_as_line());
        }
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_pending_as_line())
        }
    }

    fn take_pending_as_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straddling_crlf_is_one_line_not_two() {
        let mut d = LineDecoder::new();
        let mut out = Vec::new();
        out.extend(d.feed(b"abc\r"));
        out.extend(d.feed(b"\ndef\r\nghi\r"));
        out.extend(d.feed(b"\n"));
        assert_eq!(out, vec!["abc", "def", "ghi"]);
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn lone_cr_terminates_a_line() {
        let mut d = LineDecoder::new();
        let mut out = Vec::new();
        out.extend(d.feed(b"a\rb\rc"));
        assert_eq!(out, vec!["a", "b"]);
        assert_eq!(d.finish(), Some("c".to_string()));
    }

    #[test]
    fn bare_lf_terminates() {
        let mut d = LineDecoder::new();
        let out = d.feed(b"one\ntwo\n");
        assert_eq!(out, vec!["one", "two"]);
    }

    #[test]
    fn final_unterminated_line_flushed_on_finish() {
        let mut d = LineDecoder::new();
        let out = d.feed(b"partial");
        assert!(out.is_empty());
        assert_eq!(d.finish(), Some("partial".to_string()));
    }

    #[test]
    fn empty_input_produces_nothing() {
        let mut d = LineDecoder::new();
        assert!(d.feed(b"").is_empty());
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn trailing_cr_then_eof_is_its_own_line() {
        let mut d = LineDecoder::new();
        let out = d.feed(b"last\r");
        assert!(out.is_empty());
        assert_eq!(d.finish(), Some("last".to_string()));
    }
}
