//! Newline index with LF/CRLF-robust line/byte mapping.
//!
//! - Single pass over bytes to record '\n' positions.
//! - 1-based external line numbers (friendly for UX).
//! - O(1) line→byte start/end via the index.
//! - End byte excludes trailing '\r' for CRLF lines.
//!
//! An empty buffer has 0 lines; a non-empty buffer without '\n' has 1 line.
//! For ranges, end is exclusive (Rust slicing convention).

use std::cmp;

use memchr::memchr_iter;

#[derive(Debug, Clone)]
pub struct NewlineIndex {
    /// Total length of the buffer in bytes.
    len: usize,

    /// Positions of '\n' characters in the buffer.
    nl_positions: Vec<usize>,
}

impl NewlineIndex {
    /// Build an index recording positions of '\n'.
    #[must_use]
    pub fn build(bytes: &[u8]) -> Self {
        // Heuristic: 1 NL per 48 bytes
        let mut nl_positions = Vec::with_capacity(bytes.len() / 48);
        nl_positions.extend(memchr_iter(b'\n', bytes));

        Self {
            nl_positions,
            len: bytes.len(),
        }
    }

    /// Total number of logical lines.
    /// Empty => 0. Non-empty => (# of '\n') + 1.
    #[must_use]
    pub fn line_count(&self) -> usize {
        if self.len == 0 {
            0
        } else {
            self.nl_positions.len() + 1
        }
    }

    #[must_use]
    pub fn start_byte_of_line(&self, line1: usize) -> Option<usize> {
        let total = self.line_count();
        if line1 == 0 || line1 > total {
            return None;
        }

        // The first line always starts at byte 0
        if line1 == 1 {
            return Some(0);
        }

        // For other lines, start is just after the previous '\n'
        self.nl_positions.get(line1 - 2).map(|&prev_nl| prev_nl + 1)
    }

    /// End byte (exclusive) of a 1-based line.
    /// For CRLF, excludes trailing '\r' before '\n'.
    #[must_use]
    pub fn end_byte_of_line(&self, line1: usize, bytes: &[u8]) -> Option<usize> {
        debug_assert_eq!(
            bytes.len(),
            self.len,
            "bytes length must match indexed buffer length"
        );

        let total = self.line_count();
        if line1 == 0 || line1 > total {
            return None;
        }

        if line1 <= self.nl_positions.len() {
            let nl = self.nl_positions[line1 - 1];

            // For CRLF, exclude trailing '\r' before '\n'
            if nl > 0 && bytes.get(nl - 1) == Some(&b'\r') {
                return Some(nl - 1);
            }

            return Some(nl);
        }

        // Last line without trailing '\n' ends at EOF.
        Some(self.len)
    }

    /// Byte range (start..end) for a 1-based inclusive line span.
    #[must_use]
    pub fn byte_range_for_lines(
        &self,
        start_line1: usize,
        end_line1: usize,
        bytes: &[u8],
    ) -> Option<(usize, usize)> {
        debug_assert_eq!(
            bytes.len(),
            self.len,
            "bytes length must match indexed buffer length"
        );

        if start_line1 == 0 || end_line1 == 0 || start_line1 > end_line1 {
            return None;
        }

        let total = self.line_count();
        if total == 0 {
            return None;
        }

        let s = self.start_byte_of_line(start_line1)?;
        let e = self.end_byte_of_line(cmp::min(end_line1, total), bytes)?;

        if s <= e && e <= self.len {
            Some((s, e))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_count() {
        assert_eq!(NewlineIndex::build(b"").line_count(), 0);
        assert_eq!(NewlineIndex::build(b"one").line_count(), 1);
        assert_eq!(NewlineIndex::build(b"one\ntwo").line_count(), 2);
        assert_eq!(NewlineIndex::build(b"one\ntwo\n").line_count(), 3);
    }

    #[test]
    fn test_byte_ranges_lf() {
        let bytes = b"aa\nbbb\ncc";
        let idx = NewlineIndex::build(bytes);

        assert_eq!(idx.byte_range_for_lines(1, 1, bytes), Some((0, 2)));
        assert_eq!(idx.byte_range_for_lines(2, 2, bytes), Some((3, 6)));
        assert_eq!(idx.byte_range_for_lines(2, 3, bytes), Some((3, 9)));
        assert_eq!(idx.byte_range_for_lines(0, 1, bytes), None);
    }

    #[test]
    fn test_crlf_excluded_from_line_end() {
        let bytes = b"aa\r\nbb";
        let idx = NewlineIndex::build(bytes);

        assert_eq!(idx.end_byte_of_line(1, bytes), Some(2));
        assert_eq!(idx.byte_range_for_lines(2, 2, bytes), Some((4, 6)));
    }
}
