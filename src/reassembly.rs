//! Reassembly of payloads split over several data units.
//!
//! The first data unit announces the total length. A [`FragmentAccumulator`]
//! checks out a pooled buffer of that size, appends every following unit at
//! the current offset and hands the completed payload over once the last
//! unit arrived. The buffer goes back to the pool when the accumulator is
//! dropped, whether the transfer completed or not.

use crate::error::{Result, S7Error};
use crate::protocol::{BufferPool, PooledBuffer};

/// Collects the fragments of one transfer.
#[derive(Debug)]
pub struct FragmentAccumulator {
    expected: usize,
    buf: PooledBuffer,
}

impl FragmentAccumulator {
    /// Start a transfer of `expected` bytes.
    pub fn start(pool: &BufferPool, expected: usize) -> Self {
        Self {
            expected,
            buf: pool.checkout(expected),
        }
    }

    /// Append the next fragment.
    ///
    /// Fails when the fragment would run past the announced length.
    pub fn push(&mut self, fragment: &[u8]) -> Result<()> {
        let offset = self.buf.len();
        if offset + fragment.len() > self.expected {
            return Err(S7Error::malformed(format!(
                "Fragment of {} bytes at offset {} overflows transfer of {} bytes",
                fragment.len(),
                offset,
                self.expected
            )));
        }
        self.buf.extend_from_slice(fragment);
        Ok(())
    }

    /// Bytes received so far.
    #[inline]
    pub fn received(&self) -> usize {
        self.buf.len()
    }

    /// Announced total length.
    #[inline]
    pub fn expected(&self) -> usize {
        self.expected
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.buf.len() == self.expected
    }

    /// Finish the transfer and run `f` on the complete payload.
    ///
    /// Fails when fewer bytes than announced arrived.
    pub fn finish<T>(self, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        if !self.is_complete() {
            return Err(S7Error::malformed(format!(
                "Transfer ended after {} of {} bytes",
                self.buf.len(),
                self.expected
            )));
        }
        f(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_reassembles_in_order_for_any_fragment_size() {
        let pool = BufferPool::new();
        let data = payload(1000);

        for fragment_size in [1, 7, 64, 333, 999, 1000] {
            let mut acc = FragmentAccumulator::start(&pool, data.len());
            for chunk in data.chunks(fragment_size) {
                acc.push(chunk).unwrap();
            }
            let out = acc.finish(|bytes| Ok(bytes.to_vec())).unwrap();
            assert_eq!(out, data, "fragment size {}", fragment_size);
        }
    }

    #[test]
    fn test_overflow_rejected() {
        let pool = BufferPool::new();
        let mut acc = FragmentAccumulator::start(&pool, 4);
        acc.push(&[1, 2, 3]).unwrap();
        assert!(matches!(
            acc.push(&[4, 5]),
            Err(S7Error::MalformedResponse(_))
        ));
        assert_eq!(acc.received(), 3);
    }

    #[test]
    fn test_short_transfer_rejected() {
        let pool = BufferPool::new();
        let mut acc = FragmentAccumulator::start(&pool, 10);
        acc.push(&[0; 6]).unwrap();
        assert!(!acc.is_complete());
        assert!(matches!(
            acc.finish(|_| Ok(())),
            Err(S7Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_buffer_returns_to_pool_on_every_path() {
        let pool = BufferPool::new();

        let mut done = FragmentAccumulator::start(&pool, 2);
        done.push(&[1, 2]).unwrap();
        done.finish(|_| Ok(())).unwrap();
        assert_eq!(pool.idle(), 1);

        let abandoned = FragmentAccumulator::start(&pool, 8);
        drop(abandoned);
        assert_eq!(pool.idle(), 1);

        let failed = FragmentAccumulator::start(&pool, 8);
        let _ = failed.finish(|_| Ok(()));
        assert_eq!(pool.idle(), 1);
    }
}
