use super::packet::Packet;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError, TryLockError};

/// Why a push did not take the packet. The rejected packet rides back to the
/// caller, which decides whether to count a drop, release it, or retry later.
#[derive(Debug)]
pub enum PushError {
    /// Ring at capacity. Treat like a hardware drop: count it and release the
    /// packet, never retry unboundedly.
    Full(Packet),
    /// Lock contended (non-blocking variants only).
    WouldBlock(Packet),
}

/// Lock contended on a non-blocking pop.
#[derive(Debug, PartialEq, Eq)]
pub struct WouldBlock;

/// Fixed-capacity ring of packets guarded by a mutex.
///
/// `push`/`pop` wait for the lock and then attempt the ring operation once;
/// `try_push`/`try_pop` return immediately when the lock is contended. The
/// try variants exist so a polling loop never stalls on a lock held by
/// another core.
#[derive(Debug)]
pub struct PacketQueue {
    ring: Mutex<VecDeque<Packet>>,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> PacketQueue {
        PacketQueue {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Waits for the lock; fails without blocking further when the ring is
    /// full.
    pub fn push(&self, packet: Packet) -> Result<(), PushError> {
        let mut ring = self.lock();
        if ring.len() >= self.capacity {
            return Err(PushError::Full(packet));
        }
        ring.push_back(packet);
        Ok(())
    }

    /// Non-blocking push: gives the packet back immediately when the lock is
    /// contended.
    pub fn try_push(&self, packet: Packet) -> Result<(), PushError> {
        let mut ring = match self.ring.try_lock() {
            Ok(ring) => ring,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(PushError::WouldBlock(packet)),
        };
        if ring.len() >= self.capacity {
            return Err(PushError::Full(packet));
        }
        ring.push_back(packet);
        Ok(())
    }

    /// Waits for the lock; `None` means the ring is empty, which is not an
    /// error.
    pub fn pop(&self) -> Option<Packet> {
        self.lock().pop_front()
    }

    /// Non-blocking pop: distinguishes "empty" (`Ok(None)`) from "lock held
    /// elsewhere" (`Err(WouldBlock)`).
    pub fn try_pop(&self) -> Result<Option<Packet>, WouldBlock> {
        match self.ring.try_lock() {
            Ok(mut ring) => Ok(ring.pop_front()),
            Err(TryLockError::Poisoned(p)) => Ok(p.into_inner().pop_front()),
            Err(TryLockError::WouldBlock) => Err(WouldBlock),
        }
    }

    /// Restores a just-popped packet to the front of the ring, e.g. after the
    /// driver refused it. Bypasses the capacity check: the slot was freed by
    /// the pop being undone.
    pub(crate) fn requeue_front(&self, packet: Packet) {
        self.lock().push_front(packet);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether one more push would currently succeed.
    pub fn has_room(&self) -> bool {
        self.lock().len() < self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<VecDeque<Packet>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
