//! Framing substrate shared by both dialects.
//!
//! The read buffer keeps three cursors: `cons` marks the last committed
//! frame boundary, `rpos` the current read position and `wpos` the next
//! write position. A parser that runs out of bytes mid-frame calls
//! [`ReadBuffer::discard`] to rewind `rpos` to `cons`, so the next pass
//! retries the same frame once more bytes arrive; a completed frame is
//! sealed with [`ReadBuffer::consume`].

/// Initial buffer quantum; `pull` always exposes at least this much
/// writable tail.
pub const BUFFER_SIZE: usize = 4096;
/// Growth cap in quanta before unread bytes are rotated to the front.
pub const N_BUF: usize = 4;
/// Longest offending-line excerpt used for error context.
pub const MAX_LINE_CONTEXT: usize = 64;

/// Result of a line-oriented read.
pub enum LineRead<'a> {
    /// A full line including its terminating `\n`.
    Complete(&'a [u8]),
    /// No terminator in the buffered bytes yet.
    Partial,
    /// The quota was exhausted before a terminator appeared.
    Overrun,
}

pub struct ReadBuffer {
    buf: Vec<u8>,
    quantum: usize,
    rpos: usize,
    wpos: usize,
    cons: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::with_quantum(BUFFER_SIZE)
    }

    pub fn with_quantum(quantum: usize) -> Self {
        Self {
            buf: vec![0; quantum * N_BUF],
            quantum,
            rpos: 0,
            wpos: 0,
            cons: 0,
        }
    }

    /// Writable tail of at least one quantum. Rotates committed bytes to
    /// the front when that frees enough room, doubles the allocation
    /// otherwise.
    pub fn pull(&mut self) -> &mut [u8] {
        let tail = self.buf.len() - self.wpos;
        if tail < self.quantum {
            if self.cons + tail > self.quantum {
                self.buf.copy_within(self.cons..self.wpos, 0);
                self.wpos -= self.cons;
                self.rpos -= self.cons;
                self.cons = 0;
            } else {
                let doubled = self.buf.len() * 2;
                self.buf.resize(doubled, 0);
            }
        }
        &mut self.buf[self.wpos..]
    }

    /// Commit `n` bytes written into the slice returned by `pull`.
    pub fn push(&mut self, n: usize) {
        debug_assert!(self.wpos + n <= self.buf.len());
        self.wpos += n;
    }

    /// Seal the frame parsed so far.
    pub fn consume(&mut self) {
        self.cons = self.rpos;
    }

    /// Rewind to the last committed frame boundary.
    pub fn discard(&mut self) {
        self.rpos = self.cons;
    }

    pub fn is_eof(&self) -> bool {
        self.rpos == self.wpos
    }

    pub fn available(&self) -> usize {
        self.wpos - self.rpos
    }

    /// Read one byte, if any.
    pub fn get(&mut self) -> Option<u8> {
        if self.is_eof() {
            return None;
        }
        let byte = self.buf[self.rpos];
        self.rpos += 1;
        Some(byte)
    }

    /// Look at the next byte without consuming it.
    pub fn pick(&self) -> Option<u8> {
        if self.is_eof() {
            None
        } else {
            Some(self.buf[self.rpos])
        }
    }

    /// Take exactly `n` bytes, or `None` when fewer are buffered.
    pub fn read_bytes(&mut self, n: usize) -> Option<&[u8]> {
        if self.available() < n {
            return None;
        }
        let start = self.rpos;
        self.rpos += n;
        Some(&self.buf[start..start + n])
    }

    /// Read up to and including the next `\n`, bounded by `quota`.
    pub fn read_line(&mut self, quota: usize) -> LineRead<'_> {
        let scan = quota.min(self.available());
        for i in 0..scan {
            if self.buf[self.rpos + i] == b'\n' {
                let start = self.rpos;
                self.rpos += i + 1;
                return LineRead::Complete(&self.buf[start..start + i + 1]);
            }
        }
        if scan == quota {
            LineRead::Overrun
        } else {
            LineRead::Partial
        }
    }

    /// Reconstruct the offending line for error reporting: from the last
    /// `\n` before `rpos` (bounded by `cons`) to the next terminator or
    /// `MAX_LINE_CONTEXT` bytes. Returns the rendered message and the
    /// caret position of `rpos` inside it.
    pub fn error_context(&self, error_message: &str) -> (String, usize) {
        let mut start = self.rpos.min(self.wpos);
        while start > self.cons && self.buf[start - 1] != b'\n' {
            start -= 1;
        }
        let mut stop = self.rpos;
        while stop < self.wpos
            && self.buf[stop] != b'\r'
            && self.buf[stop] != b'\n'
            && stop - start < MAX_LINE_CONTEXT
        {
            stop += 1;
        }
        let mut excerpt = String::new();
        for &byte in &self.buf[start..stop] {
            match byte {
                b'\r' => excerpt.push_str("\\r"),
                b'\n' => excerpt.push_str("\\n"),
                other => excerpt.push(other as char),
            }
        }
        let prefix = format!("{error_message} - ");
        let pos = prefix.len() + (self.rpos - start);
        (format!("{prefix}{excerpt}"), pos)
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buf: &mut ReadBuffer, bytes: &[u8]) {
        let tail = buf.pull();
        tail[..bytes.len()].copy_from_slice(bytes);
        buf.push(bytes.len());
    }

    #[test]
    fn discard_rewinds_to_committed_boundary() {
        let mut buf = ReadBuffer::new();
        feed(&mut buf, b"abc");
        assert_eq!(buf.get(), Some(b'a'));
        assert_eq!(buf.get(), Some(b'b'));
        buf.discard();
        assert_eq!(buf.get(), Some(b'a'));
        buf.consume();
        buf.discard();
        assert_eq!(buf.get(), Some(b'b'));
    }

    #[test]
    fn read_line_variants() {
        let mut buf = ReadBuffer::new();
        feed(&mut buf, b"one\ntwo");
        match buf.read_line(64) {
            LineRead::Complete(line) => assert_eq!(line, b"one\n"),
            _ => panic!("expected a complete line"),
        }
        assert!(matches!(buf.read_line(64), LineRead::Partial));
        assert!(matches!(buf.read_line(2), LineRead::Overrun));
        feed(&mut buf, b"!\n");
        match buf.read_line(64) {
            LineRead::Complete(line) => assert_eq!(line, b"two!\n"),
            _ => panic!("expected a complete line"),
        }
    }

    #[test]
    fn pull_rotates_consumed_prefix() {
        let mut buf = ReadBuffer::with_quantum(16);
        // Fill most of the buffer and commit everything read.
        let chunk = vec![b'x'; 16 * N_BUF - 8];
        feed(&mut buf, &chunk);
        while buf.get().is_some() {}
        buf.consume();
        // Tail is below one quantum: pull must make room without
        // unbounded growth.
        let len_before = 16 * N_BUF;
        assert_eq!(buf.buf.len(), len_before);
        let tail = buf.pull();
        assert!(tail.len() >= BUFFER_SIZE.min(len_before));
    }

    #[test]
    fn pull_grows_while_frame_uncommitted() {
        let mut buf = ReadBuffer::with_quantum(16);
        let chunk = vec![b'y'; 16 * N_BUF - 4];
        feed(&mut buf, &chunk);
        // Nothing consumed: rotating cannot help, the buffer doubles.
        let before = buf.buf.len();
        buf.pull();
        assert!(buf.buf.len() > before);
        assert_eq!(buf.available(), chunk.len());
    }

    #[test]
    fn error_context_escapes_and_points() {
        let mut buf = ReadBuffer::new();
        feed(&mut buf, b"ok\n:12x4\r\n");
        // Simulate a parser that read past "ok\n:12".
        for _ in 0..6 {
            buf.get();
        }
        let (message, pos) = buf.error_context("bad digit");
        assert_eq!(message, "bad digit - :12x4");
        // Caret lands on the 'x'.
        assert_eq!(&message[pos..pos + 1], "x");
    }
}
