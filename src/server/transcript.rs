//! Bounded buffer of a session's recent terminal output.

use std::collections::VecDeque;

/// Default capacity: enough for a few screens of agent output.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Keeps the last `capacity` bytes a session wrote to its terminal.
#[derive(Debug)]
pub struct Transcript {
    capacity: usize,
    bytes: VecDeque<u8>,
}

impl Transcript {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
        }
    }

    /// Append output, evicting the oldest bytes past capacity.
    pub fn append(&mut self, data: &[u8]) {
        if data.len() >= self.capacity {
            self.bytes.clear();
            self.bytes
                .extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(data);
    }

    /// The last `n` lines, lossily decoded.
    ///
    /// A trailing partial line counts as a line.
    #[must_use]
    pub fn tail_lines(&self, n: usize) -> String {
        if n == 0 {
            return String::new();
        }
        let (front, back) = self.bytes.as_slices();
        let mut all = Vec::with_capacity(self.bytes.len());
        all.extend_from_slice(front);
        all.extend_from_slice(back);

        // Ignore one trailing newline so "a\nb\n" has two lines, not three
        let body = all.strip_suffix(b"\n").unwrap_or(&all);
        let start = body
            .iter()
            .enumerate()
            .rev()
            .filter(|&(_, &b)| b == b'\n')
            .nth(n - 1)
            .map_or(0, |(i, _)| i + 1);

        String::from_utf8_lossy(&all[start..]).into_owned()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_keeps_newest_bytes() {
        let mut t = Transcript::new(10);
        t.append(b"hello");
        t.append(b"world");
        t.append(b"!");
        assert_eq!(t.tail_lines(1), "elloworld!");
    }

    #[test]
    fn test_oversized_append() {
        let mut t = Transcript::new(4);
        t.append(b"ab");
        t.append(b"0123456789");
        assert_eq!(t.tail_lines(5), "6789");
    }

    #[test]
    fn test_tail_lines() {
        let mut t = Transcript::default();
        t.append(b"one\r\ntwo\r\nthree\r\n");
        assert_eq!(t.tail_lines(2), "two\r\nthree\r\n");
        assert_eq!(t.tail_lines(10), "one\r\ntwo\r\nthree\r\n");
        assert_eq!(t.tail_lines(0), "");

        t.append(b"four (typing");
        assert_eq!(t.tail_lines(2), "three\r\nfour (typing");
    }

    #[test]
    fn test_lossy_decoding() {
        let mut t = Transcript::default();
        t.append(&[b'o', b'k', 0xff, b'\n']);
        assert_eq!(t.tail_lines(1), "ok\u{fffd}\n");
    }
}
