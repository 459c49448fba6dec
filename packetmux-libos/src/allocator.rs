use super::packet::Packet;
use std::sync::{Arc, Mutex, PoisonError};

/// Alignment of the payload start offset within a packet buffer.
pub const ALIGN: usize = 16;
/// Fixed headroom reserved below the payload for protocol encapsulation,
/// sized for an 802.1q tag insertion.
pub const ENCAP_HEADROOM: usize = 4;

pub fn align_up(x: usize, align_size: usize) -> usize {
    let divisor = x / align_size;
    if (divisor * align_size) < x {
        return (divisor + 1) * align_size;
    } else {
        assert!(divisor * align_size == x);
        return x;
    }
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    capacity: usize,
    used: Mutex<usize>,
}

impl PoolInner {
    /// Returns a buffer's byte reservation to the pool. Called exactly once
    /// per packet, from `Packet::drop`.
    pub(crate) fn release(&self, bytes: usize) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        *used = used.saturating_sub(bytes);
    }
}

/// Byte-capacity-bounded packet buffer pool. Each VNIC owns one; every packet
/// the VNIC touches is drawn from and returned to it.
#[derive(Debug, Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    pub fn new(capacity: usize) -> PacketPool {
        PacketPool {
            inner: Arc::new(PoolInner {
                capacity,
                used: Mutex::new(0),
            }),
        }
    }

    /// Allocates a packet with room for `payload` bytes. The reservation
    /// covers the payload, the encapsulation headroom, and the alignment
    /// slack needed to round `start` up to an `ALIGN` boundary. Returns
    /// `None` when the pool cannot cover the reservation; the caller must
    /// handle exhaustion explicitly.
    pub fn allocate(&self, payload: usize) -> Option<Packet> {
        let total = payload + ENCAP_HEADROOM + ALIGN - 1;
        {
            let mut used = self
                .inner
                .used
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *used + total > self.inner.capacity {
                tracing::debug!(
                    requested = total,
                    used = *used,
                    capacity = self.inner.capacity,
                    "Pool exhausted"
                );
                return None;
            }
            *used += total;
        }
        let buffer = vec![0u8; total].into_boxed_slice();
        let start = align_up(ENCAP_HEADROOM, ALIGN);
        Some(Packet::new(buffer, start, start + payload, &self.inner))
    }

    /// Returns a packet's buffer to the pool. Consuming the packet by value
    /// makes double-free unrepresentable; dropping the packet is equivalent.
    pub fn free(&self, packet: Packet) {
        debug_assert!(packet.is_from(&self.inner));
        drop(packet);
    }

    pub fn used(&self) -> usize {
        *self
            .inner
            .used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{layer::SubscriberExt, prelude::*};

    #[test]
    fn start_is_aligned_and_len_matches() {
        packetmux_utils::test_init!();
        let pool = PacketPool::new(0x10000);
        for payload in [0usize, 1, 60, 1500] {
            let packet = pool.allocate(payload).unwrap();
            assert_eq!(packet.start() % ALIGN, 0);
            assert!(packet.start() >= ENCAP_HEADROOM);
            assert_eq!(packet.len(), payload);
            assert!(packet.end() <= packet.buffer_len());
        }
    }

    #[test]
    fn pool_sized_for_one_packet_rejects_a_second() {
        packetmux_utils::test_init!();
        let pool = PacketPool::new(1500 + ENCAP_HEADROOM + ALIGN - 1);
        let mut first = pool.allocate(1500).unwrap();
        first.payload_mut()[0..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(pool.allocate(1500).is_none());
        // the failed allocation must not have touched the live packet
        assert_eq!(&first.payload()[0..4], &[0xde, 0xad, 0xbe, 0xef]);
        pool.free(first);
        assert_eq!(pool.used(), 0);
        assert!(pool.allocate(1500).is_some());
    }

    #[test]
    fn random_alloc_free_restores_accounting() {
        packetmux_utils::test_init!();
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let pool = PacketPool::new(0x100000);
        for _ in 0..100 {
            let mut live = Vec::new();
            for _ in 0..rng.gen_range(1..16) {
                if let Some(packet) = pool.allocate(rng.gen_range(0..2048)) {
                    live.push(packet);
                }
            }
            drop(live);
            assert_eq!(pool.used(), 0);
        }
    }

    #[test]
    fn drop_returns_reservation() {
        packetmux_utils::test_init!();
        let pool = PacketPool::new(0x10000);
        let before = pool.available();
        let packet = pool.allocate(256).unwrap();
        assert!(pool.available() < before);
        drop(packet);
        assert_eq!(pool.available(), before);
    }
}
