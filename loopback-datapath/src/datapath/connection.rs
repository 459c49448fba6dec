use bytes::Bytes;
use hashbrown::HashSet;
use packetmux_libos::device::NicDevice;
use packetmux_libos::driver::NicDriver;
use packetmux_libos::packet::Packet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

const DEFAULT_WIRE_CAPACITY: usize = 256;

/// The shared in-memory link: a bounded FIFO of frames tagged with the device
/// name they were transmitted on. Transmit and pump sides both hold it
/// through an `Arc`.
#[derive(Debug)]
pub struct LoopbackWire {
    frames: Mutex<VecDeque<(String, Bytes)>>,
    capacity: usize,
}

impl LoopbackWire {
    pub fn new(capacity: usize) -> Arc<LoopbackWire> {
        Arc::new(LoopbackWire {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    fn push(&self, dev: &str, payload: &[u8]) -> bool {
        let mut frames = self.lock();
        if frames.len() >= self.capacity {
            // full link refuses, exactly like a saturated hardware ring
            return false;
        }
        frames.push_back((dev.to_string(), Bytes::copy_from_slice(payload)));
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delivers every queued frame transmitted on `device`'s name into its
    /// ingress demultiplexer; frames for other devices stay on the wire.
    /// Returns the number of frames pumped.
    pub fn pump(&self, device: &NicDevice) -> usize {
        let mut pumped = 0;
        let mut keep = VecDeque::new();
        let mut frames = self.lock();
        while let Some((dev, frame)) = frames.pop_front() {
            if dev == device.name() {
                drop(frames);
                device.receive(&frame);
                pumped += 1;
                frames = self.lock();
            } else {
                keep.push_back((dev, frame));
            }
        }
        frames.extend(keep);
        pumped
    }

    fn lock(&self) -> std::sync::MutexGuard<VecDeque<(String, Bytes)>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Driver half of the loopback link. Each device gets its own
/// `LoopbackDriver`; drivers sharing one [`LoopbackWire`] see each other's
/// traffic.
pub struct LoopbackDriver {
    wire: Arc<LoopbackWire>,
    rejected_vlans: HashSet<u16>,
}

impl LoopbackDriver {
    pub fn new(wire: Arc<LoopbackWire>) -> LoopbackDriver {
        LoopbackDriver {
            wire,
            rejected_vlans: HashSet::default(),
        }
    }

    pub fn with_default_wire() -> LoopbackDriver {
        LoopbackDriver::new(LoopbackWire::new(DEFAULT_WIRE_CAPACITY))
    }

    pub fn wire(&self) -> Arc<LoopbackWire> {
        Arc::clone(&self.wire)
    }

    /// Marks a VLAN id this driver will refuse in `add_vlan_id`, mimicking
    /// hardware without a filter slot for it.
    pub fn reject_vlan(&mut self, vlan_id: u16) {
        self.rejected_vlans.insert(vlan_id);
    }
}

impl NicDriver for LoopbackDriver {
    fn transmit(&mut self, dev: &str, packet: &Packet) -> bool {
        let accepted = self.wire.push(dev, packet.payload());
        if !accepted {
            tracing::debug!(device = dev, "wire full, refusing");
        }
        accepted
    }

    fn add_vlan_id(&mut self, dev: &str, vlan_id: u16) -> bool {
        let accepted = !self.rejected_vlans.contains(&vlan_id);
        tracing::debug!(device = dev, vlan_id, accepted, "vlan filter request");
        accepted
    }

    fn remove_vlan_id(&mut self, dev: &str, vlan_id: u16) {
        tracing::debug!(device = dev, vlan_id, "vlan filter removed");
    }
}
