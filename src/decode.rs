//! Incremental byte-to-text decoding for scanned streams.

use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};

use crate::error::{ExecError, Result};

/// Streaming decoder that keeps incomplete multi-byte sequences between
/// reads, so a character split across two reads is emitted once, whole.
pub struct TextDecoder {
    decoder: Decoder,
}

impl TextDecoder {
    /// Decoder for `encoding`, or UTF-8 when none is configured.
    pub fn new(encoding: Option<&'static Encoding>) -> Self {
        let encoding = encoding.unwrap_or(UTF_8);
        Self {
            decoder: encoding.new_decoder_without_bom_handling(),
        }
    }

    /// Append the text decodable from `bytes` to `out`. Malformed input
    /// becomes U+FFFD.
    pub fn decode(&mut self, bytes: &[u8], out: &mut String) {
        self.decode_inner(bytes, out, false);
    }

    /// Flush whatever is still buffered at end-of-stream.
    pub fn finish(&mut self, out: &mut String) {
        self.decode_inner(&[], out, true);
    }

    fn decode_inner(&mut self, mut src: &[u8], out: &mut String, last: bool) {
        loop {
            let room = self
                .decoder
                .max_utf8_buffer_length(src.len())
                .unwrap_or(src.len() * 3 + 16);
            out.reserve(room);
            let (result, read, _) = self.decoder.decode_to_string(src, out, last);
            src = &src[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => continue,
            }
        }
    }
}

/// Resolve a WHATWG encoding label such as `"utf-8"`, `"cp866"` or
/// `"windows-1251"`.
pub fn encoding_for_label(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| ExecError::Config(format!("unknown encoding label `{label}`")))
}
