//! Incremental decoding and line splitting for redirected output streams.
//!
//! Decoder state persists across reads so multi-byte sequences split across
//! buffer boundaries decode correctly, and a carried CR flag keeps a CRLF
//! pair split across two reads from producing an empty line.

use crate::config::StreamEncoding;

/// How decoded output is delivered to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Deliver each decoded chunk as soon as it arrives.
    Chunks,
    /// Buffer until a complete line (CR, LF, or CRLF) is available.
    Lines,
}

/// Stateful byte-to-text decoder.
#[derive(Debug)]
pub struct StreamDecoder {
    encoding: StreamEncoding,
    /// Undecoded tail of the previous read: up to 3 bytes of an incomplete
    /// UTF-8 sequence, or 1 odd byte plus a pending high surrogate for
    /// UTF-16.
    pending: Vec<u8>,
    pending_surrogate: Option<u16>,
}

impl StreamDecoder {
    pub fn new(encoding: StreamEncoding) -> StreamDecoder {
        StreamDecoder {
            encoding,
            pending: Vec::new(),
            pending_surrogate: None,
        }
    }

    /// Decodes `bytes`, appending complete characters to `out` and carrying
    /// any incomplete trailing sequence into the next call.
    pub fn decode(&mut self, bytes: &[u8], out: &mut String) {
        match self.encoding {
            StreamEncoding::Utf8 => self.decode_utf8(bytes, out),
            StreamEncoding::Utf16Le => self.decode_utf16le(bytes, out),
        }
    }

    /// Flushes any dangling partial sequence as a replacement character.
    pub fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() || self.pending_surrogate.is_some() {
            out.push(char::REPLACEMENT_CHARACTER);
            self.pending.clear();
            self.pending_surrogate = None;
        }
    }

    fn decode_utf8(&mut self, bytes: &[u8], out: &mut String) {
        let combined;
        let mut input = bytes;
        if !self.pending.is_empty() {
            let mut buffer = std::mem::take(&mut self.pending);
            buffer.extend_from_slice(bytes);
            combined = buffer;
            input = &combined;
        }

        let mut rest = input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    return;
                }
                Err(error) => {
                    let valid = error.valid_up_to();
                    // valid prefix is UTF-8 by construction
                    out.push_str(unsafe { std::str::from_utf8_unchecked(&rest[..valid]) });
                    match error.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + bad..];
                        }
                        None => {
                            // incomplete sequence at the end, carry it over
                            self.pending = rest[valid..].to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn decode_utf16le(&mut self, bytes: &[u8], out: &mut String) {
        let mut input = self.pending.clone();
        input.extend_from_slice(bytes);
        self.pending.clear();

        let mut units = Vec::with_capacity(input.len() / 2 + 1);
        if let Some(high) = self.pending_surrogate.take() {
            units.push(high);
        }
        let mut chunks = input.chunks_exact(2);
        for pair in &mut chunks {
            units.push(u16::from_le_bytes([pair[0], pair[1]]));
        }
        self.pending = chunks.remainder().to_vec();

        // hold back a trailing high surrogate until its partner arrives
        if let Some(&last) = units.last() {
            if (0xD800..0xDC00).contains(&last) {
                self.pending_surrogate = Some(last);
                units.pop();
            }
        }

        out.extend(char::decode_utf16(units.into_iter()).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)));
    }
}

/// Buffers decoded text until complete lines are available.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: String,
    previous_is_cr: bool,
}

impl LineSplitter {
    /// Feeds a decoded chunk, invoking `emit` once per complete line found.
    /// A line terminator is CR, LF, or CRLF; a CRLF split across two pushes
    /// yields exactly one line.
    pub fn push<F: FnMut(&str)>(&mut self, chunk: &str, emit: &mut F) {
        let bytes = chunk.as_bytes();
        let mut index = 0;

        // the previous chunk ended in CR; a leading LF completes that pair
        if self.previous_is_cr && bytes.first() == Some(&b'\n') {
            index += 1;
        }
        self.previous_is_cr = false;

        while index < bytes.len() {
            let start = index;
            while index < bytes.len() && bytes[index] != b'\r' && bytes[index] != b'\n' {
                index += 1;
            }

            if index == bytes.len() {
                // no terminator yet, keep waiting for more data
                self.buffer.push_str(&chunk[start..index]);
                return;
            }

            if self.buffer.is_empty() {
                emit(&chunk[start..index]);
            } else {
                self.buffer.push_str(&chunk[start..index]);
                emit(&self.buffer);
                self.buffer.clear();
            }

            if bytes[index] == b'\r' {
                if index + 1 == bytes.len() {
                    self.previous_is_cr = true;
                    return;
                }
                if bytes[index + 1] == b'\n' {
                    index += 1;
                }
            }
            index += 1;
        }
    }

    /// Emits any buffered partial line at end of stream.
    pub fn flush<F: FnMut(&str)>(&mut self, emit: &mut F) {
        if !self.buffer.is_empty() {
            emit(&self.buffer);
            self.buffer.clear();
        }
        self.previous_is_cr = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_lines(chunks: &[&str]) -> Vec<String> {
        let mut splitter = LineSplitter::default();
        let mut lines = Vec::new();
        for chunk in chunks {
            splitter.push(chunk, &mut |line| lines.push(line.to_string()));
        }
        splitter.flush(&mut |line| lines.push(line.to_string()));
        lines
    }

    #[test]
    fn lf_terminated_lines() {
        assert_eq!(collect_lines(&["a\nb\nc\n"]), ["a", "b", "c"]);
    }

    #[test]
    fn crlf_terminated_lines() {
        assert_eq!(collect_lines(&["a\r\nb\r\n"]), ["a", "b"]);
    }

    #[test]
    fn bare_cr_terminates_a_line() {
        assert_eq!(collect_lines(&["a\rb\r"]), ["a", "b"]);
    }

    #[test]
    fn crlf_split_across_reads_yields_one_line() {
        assert_eq!(collect_lines(&["line\r", "\nnext\n"]), ["line", "next"]);
    }

    #[test]
    fn cr_at_end_then_text_starts_new_line() {
        assert_eq!(collect_lines(&["a\r", "b\n"]), ["a", "b"]);
    }

    #[test]
    fn partial_lines_accumulate_across_reads() {
        assert_eq!(collect_lines(&["hel", "lo wo", "rld\n", "tail"]), ["hello world", "tail"]);
    }

    #[test]
    fn interleaved_partials_deliver_each_line_once_in_order() {
        let lines = collect_lines(&["one\r\ntw", "o\r\nthree\r", "\nfour"]);
        assert_eq!(lines, ["one", "two", "three", "four"]);
    }

    #[test]
    fn empty_lines_are_preserved() {
        assert_eq!(collect_lines(&["a\n\nb\n"]), ["a", "", "b"]);
        assert_eq!(collect_lines(&["\r\n"]), [""]);
    }

    #[test]
    fn utf8_sequence_split_across_reads() {
        let mut decoder = StreamDecoder::new(StreamEncoding::Utf8);
        let bytes = "héllo".as_bytes();
        let mut out = String::new();
        decoder.decode(&bytes[..2], &mut out); // cuts the é in half
        decoder.decode(&bytes[2..], &mut out);
        decoder.finish(&mut out);
        assert_eq!(out, "héllo");
    }

    #[test]
    fn utf8_invalid_bytes_become_replacement_chars() {
        let mut decoder = StreamDecoder::new(StreamEncoding::Utf8);
        let mut out = String::new();
        decoder.decode(&[b'a', 0xFF, b'b'], &mut out);
        assert_eq!(out, "a\u{FFFD}b");
    }

    #[test]
    fn utf8_dangling_partial_flushes_as_replacement() {
        let mut decoder = StreamDecoder::new(StreamEncoding::Utf8);
        let mut out = String::new();
        decoder.decode(&[0xC3], &mut out);
        assert_eq!(out, "");
        decoder.finish(&mut out);
        assert_eq!(out, "\u{FFFD}");
    }

    #[test]
    fn utf16le_decodes_with_odd_byte_carry() {
        let mut decoder = StreamDecoder::new(StreamEncoding::Utf16Le);
        let bytes: Vec<u8> = "hi✓".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let mut out = String::new();
        decoder.decode(&bytes[..3], &mut out); // odd split
        decoder.decode(&bytes[3..], &mut out);
        decoder.finish(&mut out);
        assert_eq!(out, "hi✓");
    }

    #[test]
    fn utf16le_surrogate_pair_split_across_reads() {
        let mut decoder = StreamDecoder::new(StreamEncoding::Utf16Le);
        let bytes: Vec<u8> = "𐍈".encode_utf16().flat_map(u16::to_le_bytes).collect();
        assert_eq!(bytes.len(), 4);
        let mut out = String::new();
        decoder.decode(&bytes[..2], &mut out); // high surrogate only
        assert_eq!(out, "");
        decoder.decode(&bytes[2..], &mut out);
        assert_eq!(out, "𐍈");
    }

    #[test]
    fn decoder_and_splitter_compose() {
        let mut decoder = StreamDecoder::new(StreamEncoding::Utf8);
        let mut splitter = LineSplitter::default();
        let mut lines = Vec::new();

        let payload = "première\r\nseconde\r\n".as_bytes();
        // split inside the è and inside the CRLF
        let cuts = [0, 6, 10, payload.len()];
        for window in cuts.windows(2) {
            let mut text = String::new();
            decoder.decode(&payload[window[0]..window[1]], &mut text);
            splitter.push(&text, &mut |line| lines.push(line.to_string()));
        }
        let mut tail = String::new();
        decoder.finish(&mut tail);
        splitter.push(&tail, &mut |line| lines.push(line.to_string()));
        splitter.flush(&mut |line| lines.push(line.to_string()));

        assert_eq!(lines, ["première", "seconde"]);
    }
}
