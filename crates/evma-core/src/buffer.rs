//! Fixed-capacity input buffer
//!
//! One `InputBuf` is reused across an unbounded number of partial reads:
//! the source appends bytes at `end`, a parser retires a consumed prefix by
//! advancing `start`. No per-chunk allocation on the read path.

use core::fmt;

/// Capacity of an input buffer in bytes.
pub const INPUTBUF_SIZE: usize = 4096;

/// Byte buffer with a cursor-delimited valid range.
///
/// Invariant: `0 <= start <= end <= INPUTBUF_SIZE`. When the valid range
/// drains to empty both cursors reset to 0 so the next fill gets the whole
/// buffer contiguously.
///
/// The cursors are public: parsers own the consumption protocol and some
/// (the HTTP parser) compact partial tokens in place below `start`.
pub struct InputBuf {
    /// Offset of the first valid byte
    pub start: usize,

    /// Offset one past the last valid byte
    pub end: usize,

    /// Backing storage
    pub buf: [u8; INPUTBUF_SIZE],
}

impl InputBuf {
    /// Create an empty buffer
    pub fn new() -> Self {
        InputBuf {
            start: 0,
            end: 0,
            buf: [0; INPUTBUF_SIZE],
        }
    }

    /// Number of valid bytes buffered
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True if no valid bytes are buffered
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True if no more bytes can be appended
    #[inline]
    pub fn is_full(&self) -> bool {
        self.end == INPUTBUF_SIZE
    }

    /// The currently valid, not-yet-consumed bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// The writable tail `[end, capacity)` for the next fill
    #[inline]
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..]
    }

    /// Record that `n` bytes were appended at `end`
    #[inline]
    pub fn advance_end(&mut self, n: usize) {
        debug_assert!(self.end + n <= INPUTBUF_SIZE);
        self.end += n;
    }

    /// Retire `n` consumed bytes from the front.
    ///
    /// Resets both cursors to 0 when the buffer drains, maximizing
    /// contiguous free space before the next fill.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Drop all buffered bytes and reset the cursors
    #[inline]
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Append bytes from a slice, returning how many fit
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(INPUTBUF_SIZE - self.end);
        self.buf[self.end..self.end + n].copy_from_slice(&src[..n]);
        self.end += n;
        n
    }
}

impl Default for InputBuf {
    fn default() -> Self {
        InputBuf::new()
    }
}

impl fmt::Debug for InputBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputBuf {{ start: {}, end: {} }}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_consume() {
        let mut b = InputBuf::new();
        assert!(b.is_empty());

        assert_eq!(b.fill_from(b"hello"), 5);
        assert_eq!(b.len(), 5);
        assert_eq!(b.data(), b"hello");

        b.consume(2);
        assert_eq!(b.data(), b"llo");
        assert!(b.start <= b.end && b.end <= INPUTBUF_SIZE);

        // Draining resets both cursors
        b.consume(3);
        assert!(b.is_empty());
        assert_eq!(b.start, 0);
        assert_eq!(b.end, 0);
    }

    #[test]
    fn test_fill_truncates_at_capacity() {
        let mut b = InputBuf::new();
        let big = vec![0x61u8; INPUTBUF_SIZE + 100];
        assert_eq!(b.fill_from(&big), INPUTBUF_SIZE);
        assert!(b.is_full());
        assert_eq!(b.fill_from(b"more"), 0);
    }

    #[test]
    fn test_space_window() {
        let mut b = InputBuf::new();
        b.fill_from(b"abc");
        let free = b.space().len();
        assert_eq!(free, INPUTBUF_SIZE - 3);
        b.space()[0] = b'd';
        b.advance_end(1);
        assert_eq!(b.data(), b"abcd");
    }
}
