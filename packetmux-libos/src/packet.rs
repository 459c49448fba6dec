use super::allocator::PoolInner;
use color_eyre::eyre::{ensure, Result};
use std::sync::Arc;

/// One packet: an owned buffer plus `start`/`end` offsets delimiting the
/// valid payload region, and a back-reference to the pool the buffer's
/// reservation came from.
///
/// Invariant: `0 <= start <= end <= buffer.len()`. The reservation is
/// returned to the pool exactly once, when the packet is dropped; because a
/// packet is consumed by value on transmit, delivery and free, it can never
/// be both freed and forwarded.
#[derive(Debug)]
pub struct Packet {
    buffer: Option<Box<[u8]>>,
    start: usize,
    end: usize,
    pool: Arc<PoolInner>,
}

impl Packet {
    pub(crate) fn new(buffer: Box<[u8]>, start: usize, end: usize, pool: &Arc<PoolInner>) -> Self {
        debug_assert!(start <= end && end <= buffer.len());
        Packet {
            buffer: Some(buffer),
            start,
            end,
            pool: Arc::clone(pool),
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Payload length, `end - start`.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn buffer_len(&self) -> usize {
        self.buf().len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf()[self.start..self.end]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);
        &mut self.buf_mut()[start..end]
    }

    /// Moves the payload bounds, e.g. to claim encapsulation headroom or trim
    /// a trailer. Rejects any bounds that break the packet invariant.
    pub fn set_bounds(&mut self, start: usize, end: usize) -> Result<()> {
        ensure!(start <= end, "start {} past end {}", start, end);
        ensure!(
            end <= self.buffer_len(),
            "end {} past buffer length {}",
            end,
            self.buffer_len()
        );
        self.start = start;
        self.end = end;
        Ok(())
    }

    pub(crate) fn is_from(&self, pool: &Arc<PoolInner>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    fn buf(&self) -> &[u8] {
        self.buffer.as_ref().expect("buffer taken before drop")
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut().expect("buffer taken before drop")
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        self.payload()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer.len());
        }
    }
}
