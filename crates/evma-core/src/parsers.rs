//! Built-in parsers
//!
//! The four byte-level decoders every stream and file read goes through:
//!
//! - [`Available`] - whatever is buffered right now
//! - [`Exact`] - a caller-specified number of bytes
//! - [`All`] - everything until the source closes
//! - [`Line`] - up to (and excluding) a stop byte, `\n` by default
//!
//! Each keeps its resumable state in the parser value. Accumulating parsers
//! only spill buffered bytes into their accumulator when the buffer fills,
//! so short decodes never copy twice.

use crate::buffer::InputBuf;
use crate::parser::{CloseReason, ParseError, ParseResult, ParseStatus, Parser};
use crate::value::Value;

/// Upper bound on the size of any built-in parser's resumable state.
///
/// Checked at compile time so a parser revision cannot silently bloat the
/// per-resource footprint.
pub const STATE_SIZE_MAX: usize = 256;

const _: () = assert!(core::mem::size_of::<Available>() <= STATE_SIZE_MAX);
const _: () = assert!(core::mem::size_of::<Exact>() <= STATE_SIZE_MAX);
const _: () = assert!(core::mem::size_of::<All>() <= STATE_SIZE_MAX);
const _: () = assert!(core::mem::size_of::<Line>() <= STATE_SIZE_MAX);

/// Read whatever data is available.
///
/// Completes as soon as the buffer is non-empty, retiring everything.
pub struct Available;

impl Parser for Available {
    fn process(&mut self, buf: &mut InputBuf) -> ParseResult {
        if buf.is_empty() {
            return Ok(ParseStatus::More);
        }
        let out = buf.data().to_vec();
        buf.clear();
        Ok(ParseStatus::Done(vec![Value::Bytes(out)]))
    }
}

/// Read a specified number of bytes.
pub struct Exact {
    remaining: usize,
    parts: Vec<u8>,
}

impl Exact {
    pub fn new(target: usize) -> Self {
        Exact {
            remaining: target,
            parts: Vec::new(),
        }
    }
}

impl Parser for Exact {
    fn process(&mut self, buf: &mut InputBuf) -> ParseResult {
        let size = buf.len();

        if size >= self.remaining {
            let mut out = core::mem::take(&mut self.parts);
            out.extend_from_slice(&buf.data()[..self.remaining]);
            buf.consume(self.remaining);
            self.remaining = 0;
            return Ok(ParseStatus::Done(vec![Value::Bytes(out)]));
        }

        if buf.is_full() {
            // Spill so the next fill gets the whole buffer
            self.parts.extend_from_slice(buf.data());
            self.remaining -= size;
            buf.clear();
        }

        Ok(ParseStatus::More)
    }
}

/// Read all data until the source closes.
pub struct All {
    parts: Vec<u8>,
}

impl All {
    pub fn new() -> Self {
        All { parts: Vec::new() }
    }
}

impl Default for All {
    fn default() -> Self {
        All::new()
    }
}

impl Parser for All {
    fn process(&mut self, buf: &mut InputBuf) -> ParseResult {
        if buf.is_full() {
            self.parts.extend_from_slice(buf.data());
            buf.clear();
        }
        Ok(ParseStatus::More)
    }

    fn finish(&mut self, buf: &mut InputBuf, reason: CloseReason) -> Option<Vec<Value>> {
        if reason != CloseReason::Closed {
            return None;
        }
        let mut out = core::mem::take(&mut self.parts);
        out.extend_from_slice(buf.data());
        buf.clear();
        Some(vec![Value::Bytes(out)])
    }
}

/// Read a line: everything up to a stop byte, which is consumed but not
/// included in the result.
pub struct Line {
    stop: u8,
    /// Bytes of the unconsumed region already scanned without a match
    scanned: usize,
    parts: Vec<u8>,
}

impl Line {
    pub fn new(stop: u8) -> Self {
        Line {
            stop,
            scanned: 0,
            parts: Vec::new(),
        }
    }
}

impl Default for Line {
    fn default() -> Self {
        Line::new(b'\n')
    }
}

impl Parser for Line {
    fn process(&mut self, buf: &mut InputBuf) -> ParseResult {
        let data = buf.data();

        if let Some(i) = data[self.scanned..]
            .iter()
            .position(|&b| b == self.stop)
        {
            let line_len = self.scanned + i;
            let mut out = core::mem::take(&mut self.parts);
            out.extend_from_slice(&data[..line_len]);
            buf.consume(line_len + 1);
            self.scanned = 0;
            return Ok(ParseStatus::Done(vec![Value::Bytes(out)]));
        }

        self.scanned = data.len();
        if buf.is_full() {
            self.parts.extend_from_slice(buf.data());
            buf.clear();
            self.scanned = 0;
        }

        Ok(ParseStatus::More)
    }
}

/// Shared helper: the result values for a decode aborted by `ParseError`.
pub fn abort_values(err: ParseError) -> Vec<Value> {
    Value::err_pair(err.message())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done_bytes(r: ParseResult) -> Vec<u8> {
        match r {
            Ok(ParseStatus::Done(vals)) => match &vals[0] {
                Value::Bytes(b) => b.clone(),
                other => panic!("expected bytes, got {:?}", other),
            },
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_available() {
        let mut buf = InputBuf::new();
        let mut p = Available;

        assert!(matches!(p.process(&mut buf), Ok(ParseStatus::More)));

        buf.fill_from(b"data");
        assert_eq!(done_bytes(p.process(&mut buf)), b"data");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_exact_across_chunks() {
        let mut buf = InputBuf::new();
        let mut p = Exact::new(6);

        buf.fill_from(b"ab");
        assert!(matches!(p.process(&mut buf), Ok(ParseStatus::More)));

        buf.fill_from(b"cdefgh");
        assert_eq!(done_bytes(p.process(&mut buf)), b"abcdef");

        // Unconsumed remainder stays for the next decode
        assert_eq!(buf.data(), b"gh");
    }

    #[test]
    fn test_exact_spills_on_full_buffer() {
        let mut buf = InputBuf::new();
        let target = crate::buffer::INPUTBUF_SIZE + 10;
        let mut p = Exact::new(target);

        let chunk = vec![b'x'; crate::buffer::INPUTBUF_SIZE];
        buf.fill_from(&chunk);
        assert!(matches!(p.process(&mut buf), Ok(ParseStatus::More)));
        assert!(buf.is_empty());

        buf.fill_from(&[b'y'; 10]);
        let out = done_bytes(p.process(&mut buf));
        assert_eq!(out.len(), target);
        assert_eq!(out[crate::buffer::INPUTBUF_SIZE], b'y');
    }

    #[test]
    fn test_all_until_close() {
        let mut buf = InputBuf::new();
        let mut p = All::new();

        buf.fill_from(b"part one ");
        assert!(matches!(p.process(&mut buf), Ok(ParseStatus::More)));

        buf.fill_from(b"part two");
        let vals = p.finish(&mut buf, CloseReason::Closed).unwrap();
        assert_eq!(vals[0].as_bytes(), Some(b"part one part two".as_ref()));
    }

    #[test]
    fn test_all_error_yields_nothing() {
        let mut buf = InputBuf::new();
        let mut p = All::new();
        buf.fill_from(b"lost");
        let _ = p.process(&mut buf);
        assert!(p.finish(&mut buf, CloseReason::Error).is_none());
    }

    #[test]
    fn test_line_across_chunks() {
        let mut buf = InputBuf::new();
        let mut p = Line::new(b'\n');

        buf.fill_from(b"ab");
        assert!(matches!(p.process(&mut buf), Ok(ParseStatus::More)));

        buf.fill_from(b"cdef\n");
        assert_eq!(done_bytes(p.process(&mut buf)), b"abcdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_rescan_is_incremental() {
        let mut buf = InputBuf::new();
        let mut p = Line::new(b'\n');

        buf.fill_from(b"no newline yet");
        assert!(matches!(p.process(&mut buf), Ok(ParseStatus::More)));
        assert_eq!(p.scanned, 14);

        buf.fill_from(b" and\nrest");
        assert_eq!(done_bytes(p.process(&mut buf)), b"no newline yet and");
        assert_eq!(buf.data(), b"rest");
    }

    #[test]
    fn test_back_to_back_decodes_leave_no_residue() {
        let mut buf = InputBuf::new();
        buf.fill_from(b"first\nsecond\n");

        let mut p1 = Line::new(b'\n');
        assert_eq!(done_bytes(p1.process(&mut buf)), b"first");

        let mut p2 = Line::new(b'\n');
        assert_eq!(done_bytes(p2.process(&mut buf)), b"second");
        assert!(buf.is_empty());
        assert_eq!(buf.start, 0);
        assert_eq!(buf.end, 0);
    }

    #[test]
    fn test_line_longer_than_buffer() {
        let mut buf = InputBuf::new();
        let mut p = Line::new(b'\n');

        let chunk = vec![b'a'; crate::buffer::INPUTBUF_SIZE];
        buf.fill_from(&chunk);
        assert!(matches!(p.process(&mut buf), Ok(ParseStatus::More)));
        // Spilled: buffer is free again, no overflow, no truncation
        assert!(buf.is_empty());

        buf.fill_from(b"bb\n");
        let out = done_bytes(p.process(&mut buf));
        assert_eq!(out.len(), crate::buffer::INPUTBUF_SIZE + 2);
    }
}
