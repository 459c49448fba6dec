use super::allocator::PacketPool;
use super::driver::{NicDriver, TxOutcome};
use super::packet::Packet;
use super::queue::{PacketQueue, PushError, WouldBlock};
use super::VnicId;
use eui48::MacAddress;
use hashbrown::HashMap;
use packetmux_utils::VnicProfile;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Config key under which a VNIC's IPv4 interface table lives.
pub const CONFIG_IPV4: &str = "net.addr.ipv4";

const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// One assigned IPv4 address's interface record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Interface {
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub is_default: bool,
}

/// Values storable in a VNIC's config/address table. Keys are short ASCII
/// identifiers; the protocol stack collaborator consults these.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Ipv4Interfaces(HashMap<Ipv4Addr, Ipv4Interface>),
    Scalar(u64),
    Text(String),
}

/// Creation-time VNIC attributes, either built directly or loaded from a
/// YAML profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnicAttrs {
    pub mac: MacAddress,
    pub device: String,
    /// Max packets drained from the egress queue per scheduler visit.
    pub budget: usize,
    /// Packet pool capacity in bytes.
    pub pool_size: usize,
    pub rx_bandwidth: u64,
    pub tx_bandwidth: u64,
    pub rx_queue_size: usize,
    pub tx_queue_size: usize,
    pub padding_head: u16,
    pub padding_tail: u16,
}

impl Default for VnicAttrs {
    fn default() -> Self {
        VnicAttrs {
            mac: MacAddress::nil(),
            device: String::new(),
            budget: packetmux_utils::DEFAULT_BUDGET,
            pool_size: packetmux_utils::DEFAULT_POOL_SIZE,
            rx_bandwidth: packetmux_utils::DEFAULT_BANDWIDTH,
            tx_bandwidth: packetmux_utils::DEFAULT_BANDWIDTH,
            rx_queue_size: packetmux_utils::DEFAULT_QUEUE_SIZE,
            tx_queue_size: packetmux_utils::DEFAULT_QUEUE_SIZE,
            padding_head: packetmux_utils::DEFAULT_PADDING,
            padding_tail: packetmux_utils::DEFAULT_PADDING,
        }
    }
}

impl From<VnicProfile> for VnicAttrs {
    fn from(profile: VnicProfile) -> Self {
        VnicAttrs {
            mac: profile.mac,
            device: profile.device,
            budget: profile.budget,
            pool_size: profile.pool_size,
            rx_bandwidth: profile.rx_bandwidth,
            tx_bandwidth: profile.tx_bandwidth,
            rx_queue_size: profile.rx_queue_size,
            tx_queue_size: profile.tx_queue_size,
            padding_head: profile.padding_head,
            padding_tail: profile.padding_tail,
        }
    }
}

/// Field patch applied through [`NicDevice::update_vnic`]; the MAC change is
/// check-then-set atomic against sibling VNICs.
///
/// [`NicDevice::update_vnic`]: crate::device::NicDevice::update_vnic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VnicUpdate {
    pub id: VnicId,
    pub mac: MacAddress,
    pub rx_bandwidth: u64,
    pub tx_bandwidth: u64,
    pub padding_head: u16,
    pub padding_tail: u16,
}

#[derive(Debug, Default)]
struct VnicStats {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_drop_packets: AtomicU64,
    rx_drop_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_drop_packets: AtomicU64,
    tx_drop_bytes: AtomicU64,
}

impl VnicStats {
    fn count_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn count_rx_drop(&self, bytes: usize) {
        self.rx_drop_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_drop_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn count_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn count_tx_drop(&self, bytes: usize) {
        self.tx_drop_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_drop_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a VNIC's cumulative counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VnicStatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_drop_packets: u64,
    pub rx_drop_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_drop_packets: u64,
    pub tx_drop_bytes: u64,
}

/// Guest-visible view of a VNIC's identity and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnicInfo {
    pub id: VnicId,
    pub mac: MacAddress,
    pub device: String,
    pub budget: usize,
    pub vlan_proto: u16,
    pub vlan_tci: u16,
    pub rx_bandwidth: u64,
    pub tx_bandwidth: u64,
    pub padding_head: u16,
    pub padding_tail: u16,
    pub pool_used: usize,
    pub pool_total: usize,
}

/// One tenant's virtual NIC: a private packet pool, an ingress and an egress
/// queue, cumulative counters and a config/address table. Owned exclusively
/// by its parent device once attached; detaching hands it back by value.
pub struct Vnic {
    id: VnicId,
    mac: MacAddress,
    device: String,
    budget: usize,
    vlan_proto: u16,
    vlan_tci: u16,
    rx_bandwidth: u64,
    tx_bandwidth: u64,
    padding_head: u16,
    padding_tail: u16,
    pool: PacketPool,
    rx_queue: PacketQueue,
    tx_queue: PacketQueue,
    stats: VnicStats,
    config: Mutex<HashMap<String, ConfigValue>>,
}

impl Vnic {
    pub fn new(id: VnicId, attrs: VnicAttrs) -> Vnic {
        Vnic {
            id,
            mac: attrs.mac,
            device: attrs.device,
            budget: attrs.budget,
            vlan_proto: 0,
            vlan_tci: 0,
            rx_bandwidth: attrs.rx_bandwidth,
            tx_bandwidth: attrs.tx_bandwidth,
            padding_head: attrs.padding_head,
            padding_tail: attrs.padding_tail,
            pool: PacketPool::new(attrs.pool_size),
            rx_queue: PacketQueue::new(attrs.rx_queue_size),
            tx_queue: PacketQueue::new(attrs.tx_queue_size),
            stats: VnicStats::default(),
            config: Mutex::new(HashMap::default()),
        }
    }

    pub fn id(&self) -> VnicId {
        self.id
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn vlan_proto(&self) -> u16 {
        self.vlan_proto
    }

    pub fn vlan_tci(&self) -> u16 {
        self.vlan_tci
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn stats(&self) -> VnicStatsSnapshot {
        VnicStatsSnapshot {
            rx_packets: self.stats.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.stats.rx_bytes.load(Ordering::Relaxed),
            rx_drop_packets: self.stats.rx_drop_packets.load(Ordering::Relaxed),
            rx_drop_bytes: self.stats.rx_drop_bytes.load(Ordering::Relaxed),
            tx_packets: self.stats.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.stats.tx_bytes.load(Ordering::Relaxed),
            tx_drop_packets: self.stats.tx_drop_packets.load(Ordering::Relaxed),
            tx_drop_bytes: self.stats.tx_drop_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn info(&self) -> VnicInfo {
        VnicInfo {
            id: self.id,
            mac: self.mac,
            device: self.device.clone(),
            budget: self.budget,
            vlan_proto: self.vlan_proto,
            vlan_tci: self.vlan_tci,
            rx_bandwidth: self.rx_bandwidth,
            tx_bandwidth: self.tx_bandwidth,
            padding_head: self.padding_head,
            padding_tail: self.padding_tail,
            pool_used: self.pool.used(),
            pool_total: self.pool.capacity(),
        }
    }

    pub(crate) fn set_vlan(&mut self, proto: u16, tci: u16) {
        self.vlan_proto = proto;
        self.vlan_tci = tci;
    }

    pub(crate) fn set_mac(&mut self, mac: MacAddress) {
        self.mac = mac;
    }

    pub(crate) fn apply_update(&mut self, update: &VnicUpdate) {
        self.rx_bandwidth = update.rx_bandwidth;
        self.tx_bandwidth = update.tx_bandwidth;
        self.padding_head = update.padding_head;
        self.padding_tail = update.padding_tail;
    }

    // ---- guest-facing packet surface ----

    pub fn alloc(&self, payload: usize) -> Option<Packet> {
        self.pool.allocate(payload)
    }

    pub fn free(&self, packet: Packet) {
        self.pool.free(packet);
    }

    pub fn has_input(&self) -> bool {
        !self.rx_queue.is_empty()
    }

    /// Blocking-mode ingress read; `None` when nothing is queued.
    pub fn input(&self) -> Option<Packet> {
        self.rx_queue.pop()
    }

    /// Non-blocking ingress read.
    pub fn try_input(&self) -> Result<Option<Packet>, WouldBlock> {
        self.rx_queue.try_pop()
    }

    pub fn output_available(&self) -> bool {
        self.tx_queue.has_room()
    }

    pub fn has_output(&self) -> bool {
        !self.tx_queue.is_empty()
    }

    /// Queues a packet for transmit. A full egress ring is handled like a
    /// hardware drop: counted, packet released to the pool, `false` returned.
    pub fn output(&self, packet: Packet) -> bool {
        match self.tx_queue.push(packet) {
            Ok(()) => true,
            Err(PushError::Full(packet)) | Err(PushError::WouldBlock(packet)) => {
                self.stats.count_tx_drop(packet.len());
                tracing::debug!(vnic = self.id, "egress queue full, dropping");
                self.pool.free(packet);
                false
            }
        }
    }

    /// Non-blocking variant of [`output`](Self::output); the packet rides
    /// back to the caller on contention or full, nothing is counted.
    pub fn try_output(&self, packet: Packet) -> Result<(), PushError> {
        self.tx_queue.try_push(packet)
    }

    /// Copies another packet's payload into a fresh allocation from this
    /// VNIC's own pool and queues it for transmit.
    pub fn output_dup(&self, packet: &Packet) -> bool {
        let mut copy = match self.pool.allocate(packet.len()) {
            Some(copy) => copy,
            None => return false,
        };
        copy.payload_mut().copy_from_slice(packet.payload());
        self.output(copy)
    }

    // ---- device-facing surface ----

    /// Delivers a received frame (plus optional auxiliary receive metadata,
    /// appended after the frame) into the ingress queue. Pool exhaustion and
    /// queue-full are counted drops, never escalated to the demultiplexer.
    pub(crate) fn deliver(&self, frame: &[u8], meta: Option<&[u8]>) -> bool {
        let meta_len = meta.map_or(0, |m| m.len());
        let total = frame.len() + meta_len;
        let mut packet = match self.pool.allocate(total) {
            Some(packet) => packet,
            None => {
                self.stats.count_rx_drop(total);
                tracing::debug!(vnic = self.id, "pool exhausted on ingress, dropping");
                return false;
            }
        };
        packet.payload_mut()[..frame.len()].copy_from_slice(frame);
        if let Some(meta) = meta {
            packet.payload_mut()[frame.len()..].copy_from_slice(meta);
        }
        match self.rx_queue.push(packet) {
            Ok(()) => {
                self.stats.count_rx(total);
                true
            }
            Err(PushError::Full(packet)) | Err(PushError::WouldBlock(packet)) => {
                self.stats.count_rx_drop(total);
                tracing::debug!(vnic = self.id, "ingress queue full, dropping");
                self.pool.free(packet);
                false
            }
        }
    }

    /// Drains one packet from the egress queue into the driver. Egress-lock
    /// contention counts as a soft skip so one scheduling pass stays bounded.
    pub(crate) fn drain_one(&self, dev: &str, driver: &mut dyn NicDriver) -> TxOutcome {
        let packet = match self.tx_queue.try_pop() {
            Ok(Some(packet)) => packet,
            Ok(None) => return TxOutcome::QueueEmpty,
            Err(WouldBlock) => return TxOutcome::QueueEmpty,
        };
        if driver.transmit(dev, &packet) {
            self.stats.count_tx(packet.len());
            TxOutcome::Transmitted
        } else {
            self.tx_queue.requeue_front(packet);
            TxOutcome::TransmitFailed
        }
    }

    // ---- config/address table ----

    pub fn config_put(&self, key: &str, value: ConfigValue) {
        self.config_lock().insert(key.to_string(), value);
    }

    pub fn config_get(&self, key: &str) -> Option<ConfigValue> {
        self.config_lock().get(key).cloned()
    }

    pub fn config_contains(&self, key: &str) -> bool {
        self.config_lock().contains_key(key)
    }

    pub fn config_remove(&self, key: &str) -> Option<ConfigValue> {
        self.config_lock().remove(key)
    }

    /// Assigns an IPv4 address with the stock defaults: /24 netmask, `.1`
    /// gateway on the derived subnet, marked as the default route. Fails if
    /// the address is already assigned.
    pub fn ip_add(&self, addr: Ipv4Addr) -> bool {
        let mut config = self.config_lock();
        let interfaces = config
            .entry(CONFIG_IPV4.to_string())
            .or_insert_with(|| ConfigValue::Ipv4Interfaces(HashMap::default()));
        match interfaces {
            ConfigValue::Ipv4Interfaces(map) => {
                if map.contains_key(&addr) {
                    return false;
                }
                let gateway =
                    Ipv4Addr::from((u32::from(addr) & u32::from(DEFAULT_NETMASK)) | 0x1);
                map.insert(
                    addr,
                    Ipv4Interface {
                        netmask: DEFAULT_NETMASK,
                        gateway,
                        is_default: true,
                    },
                );
                true
            }
            _ => false,
        }
    }

    pub fn ip_get(&self, addr: Ipv4Addr) -> Option<Ipv4Interface> {
        match self.config_lock().get(CONFIG_IPV4) {
            Some(ConfigValue::Ipv4Interfaces(map)) => map.get(&addr).copied(),
            _ => None,
        }
    }

    pub fn ip_remove(&self, addr: Ipv4Addr) -> bool {
        match self.config_lock().get_mut(CONFIG_IPV4) {
            Some(ConfigValue::Ipv4Interfaces(map)) => map.remove(&addr).is_some(),
            _ => false,
        }
    }

    fn config_lock(&self) -> std::sync::MutexGuard<HashMap<String, ConfigValue>> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Vnic {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vnic")
            .field("id", &self.id)
            .field("mac", &self.mac)
            .field("device", &self.device)
            .field("budget", &self.budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{layer::SubscriberExt, prelude::*};

    fn test_vnic(id: VnicId) -> Vnic {
        Vnic::new(
            id,
            VnicAttrs {
                mac: MacAddress::parse_str("02:00:00:00:00:01").unwrap(),
                device: "eth0".to_string(),
                pool_size: 0x10000,
                rx_queue_size: 4,
                tx_queue_size: 4,
                ..Default::default()
            },
        )
    }

    #[test]
    fn output_drop_on_full_ring_counts_and_releases() {
        packetmux_utils::test_init!();
        let vnic = test_vnic(1);
        for _ in 0..4 {
            assert!(vnic.output(vnic.alloc(100).unwrap()));
        }
        let used_when_full = vnic.pool().used();
        assert!(!vnic.output(vnic.alloc(100).unwrap()));
        let stats = vnic.stats();
        assert_eq!(stats.tx_drop_packets, 1);
        assert_eq!(stats.tx_drop_bytes, 100);
        // the rejected packet's reservation came back
        assert_eq!(vnic.pool().used(), used_when_full);
    }

    #[test]
    fn deliver_appends_receive_metadata() {
        packetmux_utils::test_init!();
        let vnic = test_vnic(1);
        assert!(vnic.deliver(&[1, 2, 3], Some(&[9, 9])));
        let packet = vnic.input().unwrap();
        assert_eq!(packet.payload(), &[1, 2, 3, 9, 9]);
        let stats = vnic.stats();
        assert_eq!(stats.rx_packets, 1);
        assert_eq!(stats.rx_bytes, 5);
    }

    #[test]
    fn deliver_drop_on_full_ingress() {
        packetmux_utils::test_init!();
        let vnic = test_vnic(1);
        for _ in 0..4 {
            assert!(vnic.deliver(&[0u8; 60], None));
        }
        assert!(!vnic.deliver(&[0u8; 60], None));
        assert_eq!(vnic.stats().rx_drop_packets, 1);
        assert_eq!(vnic.stats().rx_packets, 4);
    }

    #[test]
    fn output_dup_is_an_independent_copy() {
        packetmux_utils::test_init!();
        let vnic = test_vnic(1);
        let other = test_vnic(2);
        let mut original = other.alloc(4).unwrap();
        original.payload_mut().copy_from_slice(&[1, 2, 3, 4]);

        assert!(vnic.output_dup(&original));
        // mutating the original afterwards must not affect the copy
        original.payload_mut()[0] = 0xff;
        drop(original);

        let copied = vnic.tx_queue.pop().unwrap();
        assert_eq!(copied.payload(), &[1, 2, 3, 4]);
        assert!(copied.is_from(vnic.pool().inner()));
    }

    #[test]
    fn config_and_ip_helpers() {
        packetmux_utils::test_init!();
        let vnic = test_vnic(1);
        vnic.config_put("hostname", ConfigValue::Text("tenant0".to_string()));
        assert!(vnic.config_contains("hostname"));
        assert_eq!(
            vnic.config_remove("hostname"),
            Some(ConfigValue::Text("tenant0".to_string()))
        );
        assert!(vnic.config_get("hostname").is_none());

        let addr = Ipv4Addr::new(10, 0, 5, 42);
        assert!(vnic.ip_add(addr));
        assert!(!vnic.ip_add(addr));
        let iface = vnic.ip_get(addr).unwrap();
        assert_eq!(iface.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(iface.gateway, Ipv4Addr::new(10, 0, 5, 1));
        assert!(iface.is_default);
        assert!(vnic.ip_remove(addr));
        assert!(vnic.ip_get(addr).is_none());
    }
}
