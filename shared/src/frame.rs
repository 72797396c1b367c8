//! Splitting the inbound byte stream into frames and records

/// Where the reader is in a session's inbound stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// The next record is the login record
    AwaitingLogin,
    /// Records are newline delimited
    Framing,
    /// The next record is exactly this many raw bytes
    RawBlock(usize),
}

/// Accumulates received bytes and pops complete length-prefixed frames
#[derive(Debug, Default, Clone)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Removes and returns the next frame body once it has fully arrived
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() - 2 < len {
            return None;
        }
        let body = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Some(body)
    }
}

/// Cursor over the records of one decoded frame
#[derive(Debug)]
pub struct Records<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Records<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn has_more(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Next newline-terminated record, without its newline
    pub fn next_line(&mut self) -> Option<&'a [u8]> {
        if !self.has_more() {
            return None;
        }
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                self.pos += idx + 1;
                Some(&rest[..idx])
            }
            None => {
                self.pos = self.data.len();
                Some(rest)
            }
        }
    }

    /// Next `len` bytes verbatim. With `strip_newline`, one trailing newline
    /// inside the block is dropped.
    pub fn next_raw(&mut self, len: usize, strip_newline: bool) -> Option<&'a [u8]> {
        if !self.has_more() {
            return None;
        }
        let end = (self.pos + len).min(self.data.len());
        let mut record = &self.data[self.pos..end];
        self.pos = end;
        if strip_newline {
            if let Some((&b'\n', head)) = record.split_last() {
                record = head;
            }
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_waits_for_full_body() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&[0, 4, b'a', b'b']);
        assert!(buffer.next_frame().is_none());
        buffer.push(&[b'c', b'd', 0]);
        assert_eq!(buffer.next_frame(), Some(b"abcd".to_vec()));
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&[0, 1, b'x', 0, 2, b'y', b'z']);
        assert_eq!(buffer.next_frame(), Some(b"x".to_vec()));
        assert_eq!(buffer.next_frame(), Some(b"yz".to_vec()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_lines() {
        let mut records = Records::new(b"one\ntwo\nthree");
        assert_eq!(records.next_line(), Some(&b"one"[..]));
        assert_eq!(records.next_line(), Some(&b"two"[..]));
        assert_eq!(records.next_line(), Some(&b"three"[..]));
        assert_eq!(records.next_line(), None);
    }

    #[test]
    fn test_raw_block_keeps_embedded_newline() {
        let mut records = Records::new(b"ab\ncd\nnext\n");
        assert_eq!(records.next_raw(6, true), Some(&b"ab\ncd"[..]));
        assert_eq!(records.next_line(), Some(&b"next"[..]));
    }

    #[test]
    fn test_raw_block_without_strip() {
        let mut records = Records::new(b"ab\n");
        assert_eq!(records.next_raw(3, false), Some(&b"ab\n"[..]));
        assert!(!records.has_more());
    }
}
