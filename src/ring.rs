//! Fixed-capacity byte ring buffer shared between a real-time audio callback
//! and an async task.
//!
//! `ByteRing` itself does no locking: callers wrap it in a `parking_lot::Mutex`
//! (short critical sections only — a single copy in or out) and are
//! responsible for the single-writer/single-reader discipline the type
//! assumes. `reset` requires `&mut self`, which in practice means holding the
//! surrounding mutex, so misuse is caught at compile time rather than by
//! convention alone.

use std::collections::VecDeque;

pub struct ByteRing {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Copies as many bytes from `src` as fit; never blocks, never
    /// overwrites unread data. Returns the number of bytes actually written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let free = self.capacity - self.buf.len();
        let n = free.min(src.len());
        self.buf.extend(src[..n].iter().copied());
        n
    }

    /// Copies up to `dst.len()` bytes into `dst`. Returns 0 if empty.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.buf.len());
        for slot in dst.iter_mut().take(n) {
            *slot = self.buf.pop_front().expect("checked len above");
        }
        n
    }

    /// Current occupancy in bytes.
    pub fn available(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clears all buffered content. Caller must hold the surrounding lock
    /// exclusively; a concurrent `reset` racing a `write`/`read` is undefined
    /// by contract (the `&mut self` receiver already forces exclusive access
    /// in practice).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Appends `n` zero bytes, used to pre-fill the AEC reference ring with
    /// silence for the configured reference delay.
    pub fn fill_zeros(&mut self, n: usize) {
        let n = n.min(self.capacity - self.buf.len());
        self.buf.extend(std::iter::repeat(0u8).take(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let mut ring = ByteRing::new(16);
        assert_eq!(ring.write(&[1, 2, 3, 4]), 4);
        assert_eq!(ring.available(), 4);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn write_never_overwrites_partial_on_full() {
        let mut ring = ByteRing::new(4);
        assert_eq!(ring.write(&[1, 2, 3, 4]), 4);
        // Ring is full; further writes are partially (here: fully) rejected,
        // but never overwrite unread bytes.
        assert_eq!(ring.write(&[9, 9]), 0);
        let mut out = [0u8; 4];
        ring.read(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn partial_write_when_nearly_full() {
        let mut ring = ByteRing::new(4);
        assert_eq!(ring.write(&[1, 2]), 2);
        assert_eq!(ring.write(&[3, 4, 5, 6]), 2);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn read_returns_zero_when_empty() {
        let mut ring = ByteRing::new(8);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn reset_clears_content() {
        let mut ring = ByteRing::new(8);
        ring.write(&[1, 2, 3]);
        ring.reset();
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn fill_zeros_seeds_reference_delay() {
        let mut ring = ByteRing::new(320);
        ring.fill_zeros(160);
        assert_eq!(ring.available(), 160);
        let mut out = [0xAAu8; 160];
        ring.read(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn read_never_returns_more_than_requested() {
        let mut ring = ByteRing::new(8);
        ring.write(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut out = [0u8; 3];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(ring.available(), 5);
    }
}
