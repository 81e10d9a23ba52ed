//! Byte accumulator shared between command pumps and the supervisor.

use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::output::trim_space;

/// Literal inserted by [`SafeBuffer::since`] in place of bytes that were
/// already covered by an earlier call.
pub const UNCHANGED_MARKER: &[u8] = b"(...)";

/// Append-only byte buffer whose reads are concurrent with writes.
///
/// Pump threads append captured command output while the supervisor takes
/// [`since`](Self::since) views for its periodic liveness reports. Writes
/// are atomic with respect to every accessor.
#[derive(Debug, Default)]
pub struct SafeBuffer {
    inner: Mutex<Vec<u8>>,
}

impl SafeBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` to the buffer.
    pub fn append(&self, data: &[u8]) {
        self.lock().extend_from_slice(data);
    }

    /// Returns the number of bytes accumulated so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns an owned snapshot of the accumulated bytes.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Returns the output accumulated since an earlier call, together with
    /// the offset to resume from (the buffer length at call time).
    ///
    /// The view elides everything before the last newline at or before
    /// `offset - 1`, replacing it with [`UNCHANGED_MARKER`]; when no such
    /// newline exists the whole buffer is returned. The view is trimmed of
    /// leading and trailing whitespace, so a caller that sees exactly the
    /// marker knows nothing of substance arrived since its last look.
    #[must_use]
    pub fn since(&self, offset: usize) -> (Vec<u8>, usize) {
        let data = self.lock();
        let len = data.len();
        let mut view = None;
        if offset >= 1 {
            let mut i = (offset - 1).min(len.saturating_sub(1));
            while i > 1 {
                if data[i] == b'\n' {
                    let mut elided = UNCHANGED_MARKER.to_vec();
                    elided.extend_from_slice(&data[i..]);
                    view = Some(elided);
                    break;
                }
                i -= 1;
            }
        }
        let view = view.unwrap_or_else(|| data.clone());
        (trim_space(&view).to_vec(), len)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A writer panicking mid-append leaves the bytes intact.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for &SafeBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn append_accumulates() {
        let buf = SafeBuffer::new();
        assert!(buf.is_empty());
        buf.append(b"one");
        buf.append(b"two");
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.bytes(), b"onetwo");
    }

    #[test]
    fn since_returns_new_offset_equal_to_len() {
        let buf = SafeBuffer::new();
        buf.append(b"hello\nworld\n");
        let (_, offset) = buf.since(0);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn since_with_zero_offset_copies_everything() {
        let buf = SafeBuffer::new();
        buf.append(b"hello\nworld\n");
        let (view, _) = buf.since(0);
        assert_eq!(view, b"hello\nworld");
    }

    #[test]
    fn since_elides_before_last_newline() {
        let buf = SafeBuffer::new();
        buf.append(b"first line\nsecond");
        let offset = buf.len();
        buf.append(b" grows\nthird");
        let (view, _) = buf.since(offset);
        assert_eq!(view, b"(...)\nsecond grows\nthird");
    }

    #[test]
    fn since_only_whitespace_after_newline_is_the_marker() {
        let buf = SafeBuffer::new();
        buf.append(b"stable output\n");
        let (_, offset) = buf.since(0);
        let (view, _) = buf.since(offset);
        assert_eq!(view, UNCHANGED_MARKER);
    }

    #[test]
    fn since_ignores_newlines_in_the_first_two_bytes() {
        let buf = SafeBuffer::new();
        buf.append(b"a\nbc");
        let (view, _) = buf.since(3);
        assert_eq!(view, b"a\nbc");
    }

    #[test]
    fn concurrent_reads_see_a_prefix() {
        let buf = Arc::new(SafeBuffer::new());
        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for _ in 0..1000 {
                    buf.append(b"ab");
                }
            })
        };
        for _ in 0..100 {
            let snapshot = buf.bytes();
            assert!(snapshot.len() % 2 == 0);
            assert!(snapshot.chunks(2).all(|c| c == b"ab"));
        }
        writer.join().expect("writer thread");
        assert_eq!(buf.len(), 2000);
    }

    #[test]
    fn write_trait_feeds_the_buffer() {
        let buf = SafeBuffer::new();
        let mut sink = &buf;
        sink.write_all(b"copied").expect("write succeeds");
        assert_eq!(buf.bytes(), b"copied");
    }
}
