//! Byte-to-UTF-8 decoding for non-UTF-8 log files. Supports GBK and UTF-16
//! alongside UTF-8 as configurable source encodings.

use encoding_rs::{Encoding, GBK, UTF_16BE, UTF_16LE, UTF_8};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceEncoding {
    #[default]
    Utf8,
    Gbk,
    Utf16Le,
    Utf16Be,
}

impl SourceEncoding {
    fn codec(self) -> &'static Encoding {
        match self {
            SourceEncoding::Utf8 => UTF_8,
            SourceEncoding::Gbk => GBK,
            SourceEncoding::Utf16Le => UTF_16LE,
            SourceEncoding::Utf16Be => UTF_16BE,
        }
    }

    /// Decodes `raw` to UTF-8, replacing malformed sequences, and reports
    /// whether any replacement occurred.
    pub fn decode(self, raw: &[u8]) -> (String, bool) {
        let (cow, _, had_errors) = self.codec().decode(raw);
        (cow.into_owned(), had_errors)
    }

    /// Number of trailing raw bytes a line terminator occupies in this
    /// encoding, so the splitter strips exactly the terminator's own code
    /// unit rather than assuming a single `0x0A` byte.
    pub fn newline_byte_width(self) -> usize {
        match self {
            SourceEncoding::Utf8 | SourceEncoding::Gbk => 1,
            SourceEncoding::Utf16Le | SourceEncoding::Utf16Be => 2,
        }
    }

    /// Finds the raw-byte index of the last byte of a line terminator in
    /// `buf`, encoding-aware so a terminator is never confused with a
    /// `0x0A` byte that is merely part of a wider code unit.
    ///
    /// UTF-8 and GBK need no special handling here: UTF-8 continuation
    /// bytes are always `0x80..=0xBF` and GBK trail bytes are always
    /// `0x40..=0xFE` excluding `0x7F`, so `0x0A` can never occur as a
    /// non-leading byte of either encoding's multi-byte sequences — a raw
    /// `0x0A` is always a genuine newline. UTF-16 has no such guarantee:
    /// `0x0A` can be either byte of a non-ASCII code unit, so the search
    /// has to match the full two-byte `0x000A` code unit at an aligned
    /// offset instead of scanning individual bytes.
    pub fn find_newline(self, buf: &[u8]) -> Option<usize> {
        match self {
            SourceEncoding::Utf8 | SourceEncoding::Gbk => buf.iter().position(|&b| b == b'\n'),
            SourceEncoding::Utf16Le => (0..buf.len().saturating_sub(1))
                .step_by(2)
                .find(|&i| buf[i] == 0x0A && buf[i + 1] == 0x00)
                .map(|i| i + 1),
            SourceEncoding::Utf16Be => (0..buf.len().saturating_sub(1))
                .step_by(2)
                .find(|&i| buf[i] == 0x00 && buf[i + 1] == 0x0A)
                .map(|i| i + 1),
        }
    }
}
