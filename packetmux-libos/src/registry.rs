use super::device::NicDevice;
use color_eyre::eyre::{bail, ensure, Result};
use std::sync::{Mutex, PoisonError};

/// Max top-level (physical) devices in the registry.
pub const MAX_NIC_DEVICE_COUNT: usize = 16;

/// Register rejections hand the device back so the caller keeps ownership.
#[derive(Debug)]
pub enum RegisterError {
    /// A device with that name is already registered.
    AlreadyExists(NicDevice),
    /// All top-level slots occupied.
    Full(NicDevice),
}

/// The registry of physical NIC devices. Each top-level slot may carry a
/// chain of VLAN pseudo-devices, kept inside the parent sorted ascending by
/// VLAN id.
///
/// Same compaction invariant as a device's VNIC table: occupied top-level
/// slots form a prefix.
#[derive(Debug, Default)]
pub struct NicRegistry {
    slots: [Option<NicDevice>; MAX_NIC_DEVICE_COUNT],
}

impl NicRegistry {
    pub fn new() -> NicRegistry {
        NicRegistry::default()
    }

    /// Registers a physical device into the first empty slot. The name must
    /// not collide with any registered device or VLAN pseudo-device.
    pub fn register(&mut self, device: NicDevice) -> Result<(), RegisterError> {
        if self.get(device.name()).is_some() {
            return Err(RegisterError::AlreadyExists(device));
        }
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                tracing::info!(device = %device.name(), mac = %device.mac(), "registered");
                *slot = Some(device);
                Ok(())
            }
            None => Err(RegisterError::Full(device)),
        }
    }

    /// Removes a top-level device (its VLAN chain goes with it) and
    /// left-shift-compacts the remaining slots.
    pub fn unregister(&mut self, name: &str) -> Option<NicDevice> {
        let idx = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().map(NicDevice::name) == Some(name))?;
        let device = self.slots[idx].take();
        for j in idx..MAX_NIC_DEVICE_COUNT - 1 {
            self.slots[j] = self.slots[j + 1].take();
        }
        tracing::info!(device = name, "unregistered");
        device
    }

    /// Looks a device up by name, walking each slot's VLAN chain.
    pub fn get(&self, name: &str) -> Option<&NicDevice> {
        for device in self.devices() {
            if device.name() == name {
                return Some(device);
            }
            if let Some(vlan) = device.vlans.iter().find(|v| v.name() == name) {
                return Some(vlan);
            }
        }
        None
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NicDevice> {
        // two-phase: locate first, then reborrow mutably
        let (slot, in_chain) = self.locate(name)?;
        let device = self.slots[slot].as_mut()?;
        match in_chain {
            Some(chain_idx) => device.vlans.get_mut(chain_idx),
            None => Some(device),
        }
    }

    fn locate(&self, name: &str) -> Option<(usize, Option<usize>)> {
        for (i, slot) in self.slots.iter().enumerate() {
            let device = match slot {
                Some(device) => device,
                None => return None,
            };
            if device.name() == name {
                return Some((i, None));
            }
            if let Some(j) = device.vlans.iter().position(|v| v.name() == name) {
                return Some((i, Some(j)));
            }
        }
        None
    }

    /// Devices in chain order: each physical device followed by its VLAN
    /// pseudo-devices, stopping at the first empty top-level slot.
    pub fn devices(&self) -> impl Iterator<Item = &NicDevice> {
        self.slots
            .iter()
            .map_while(|slot| slot.as_ref())
            .flat_map(|device| std::iter::once(device).chain(device.vlans.iter()))
    }

    /// Number of devices in chain order, VLAN pseudo-devices included.
    pub fn count(&self) -> usize {
        self.devices().count()
    }

    /// Device at position `idx` in chain order.
    pub fn get_by_index(&self, idx: usize) -> Option<&NicDevice> {
        self.devices().nth(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.slots[0].is_none()
    }

    /// Creates a VLAN pseudo-device `parent.vlan_id` on a registered physical
    /// device. The driver may refuse the VLAN id.
    pub fn add_vlan(&mut self, parent: &str, vlan_id: u16) -> Result<()> {
        ensure!(
            (1..=4095).contains(&vlan_id),
            "vlan id {} outside 1..=4095",
            vlan_id
        );
        let name = format!("{}.{}", parent, vlan_id);
        ensure!(self.get(&name).is_none(), "device {} already exists", name);

        let device = match self.get_mut(parent) {
            Some(device) => device,
            None => bail!("no device {}", parent),
        };
        ensure!(!device.is_vlan(), "{} is itself a vlan device", parent);

        let accepted = device
            .driver()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_vlan_id(parent, vlan_id);
        ensure!(accepted, "driver refused vlan {} on {}", vlan_id, parent);

        let vlan = NicDevice::new_vlan(&name, device, vlan_id);
        let pos = device
            .vlans
            .partition_point(|v| v.vlan_tci() < vlan_id);
        device.vlans.insert(pos, vlan);
        tracing::info!(device = %name, vlan_id, "vlan added");
        Ok(())
    }

    /// Removes a VLAN pseudo-device. Refused while any physical device is
    /// registered, so teardown only happens on a quiescent registry; callers
    /// unregister the physical devices first.
    pub fn remove_vlan(&mut self, parent: &mut NicDevice, vlan_id: u16) -> Result<NicDevice> {
        ensure!(
            self.is_empty(),
            "registry not quiescent, unregister devices before removing vlans"
        );
        ensure!(!parent.is_vlan(), "{} is itself a vlan device", parent.name());
        let idx = match parent.vlans.iter().position(|v| v.vlan_tci() == vlan_id) {
            Some(idx) => idx,
            None => bail!("no vlan {} on {}", vlan_id, parent.name()),
        };
        let vlan = parent.vlans.remove(idx);
        parent
            .driver()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_vlan_id(parent.name(), vlan_id);
        tracing::info!(device = %vlan.name(), vlan_id, "vlan removed");
        Ok(vlan)
    }

    /// One scheduler pass over every device in chain order; the per-core
    /// polling loop's entry point. Returns total packets transmitted.
    pub fn flush_all(&self) -> usize {
        self.devices().map(NicDevice::flush).sum()
    }
}

/// Registry wrapped for shared use from multiple cores.
pub type SharedRegistry = std::sync::Arc<Mutex<NicRegistry>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NicDriver;
    use crate::packet::Packet;
    use crate::vnic::{Vnic, VnicAttrs};
    use eui48::MacAddress;
    use std::sync::Arc;
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{layer::SubscriberExt, prelude::*};

    #[derive(Default)]
    struct StubDriver {
        refuse_vlan: Option<u16>,
        removed_vlans: Vec<u16>,
        transmitted: usize,
    }

    impl NicDriver for StubDriver {
        fn transmit(&mut self, _dev: &str, _packet: &Packet) -> bool {
            self.transmitted += 1;
            true
        }

        fn add_vlan_id(&mut self, _dev: &str, vlan_id: u16) -> bool {
            self.refuse_vlan != Some(vlan_id)
        }

        fn remove_vlan_id(&mut self, _dev: &str, vlan_id: u16) {
            self.removed_vlans.push(vlan_id);
        }
    }

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x02, 0, 0, 0, 0, last])
    }

    fn device(name: &str, last: u8) -> (NicDevice, Arc<std::sync::Mutex<StubDriver>>) {
        let driver = Arc::new(std::sync::Mutex::new(StubDriver::default()));
        (NicDevice::new(name, mac(last), driver.clone()), driver)
    }

    #[test]
    fn register_rejects_duplicates_and_overflow() {
        packetmux_utils::test_init!();
        let mut registry = NicRegistry::new();
        registry.register(device("eth0", 1).0).unwrap();
        match registry.register(device("eth0", 2).0) {
            Err(RegisterError::AlreadyExists(dev)) => assert_eq!(dev.name(), "eth0"),
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
        for i in 1..MAX_NIC_DEVICE_COUNT {
            registry
                .register(device(&format!("eth{}", i), i as u8).0)
                .unwrap();
        }
        assert!(matches!(
            registry.register(device("eth99", 0x99).0),
            Err(RegisterError::Full(_))
        ));
    }

    #[test]
    fn unregister_compacts_and_index_order_holds() {
        packetmux_utils::test_init!();
        let mut registry = NicRegistry::new();
        for (i, name) in ["eth0", "eth1", "eth2"].iter().enumerate() {
            registry.register(device(name, i as u8).0).unwrap();
        }
        let removed = registry.unregister("eth1").unwrap();
        assert_eq!(removed.name(), "eth1");
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get_by_index(0).unwrap().name(), "eth0");
        assert_eq!(registry.get_by_index(1).unwrap().name(), "eth2");
        assert!(registry.get_by_index(2).is_none());
        assert!(registry.get("eth1").is_none());
    }

    #[test]
    fn vlan_chain_sorted_and_counted() {
        packetmux_utils::test_init!();
        let mut registry = NicRegistry::new();
        registry.register(device("eth0", 1).0).unwrap();
        registry.register(device("eth1", 2).0).unwrap();
        registry.add_vlan("eth0", 300).unwrap();
        registry.add_vlan("eth0", 100).unwrap();

        // chain order: eth0, its vlans ascending by id, then eth1
        let names: Vec<&str> = registry.devices().map(NicDevice::name).collect();
        assert_eq!(names, vec!["eth0", "eth0.100", "eth0.300", "eth1"]);
        assert_eq!(registry.count(), 4);

        let vlan = registry.get("eth0.100").unwrap();
        assert_eq!(vlan.vlan_tci(), 100);
        assert_eq!(vlan.vlan_proto(), 0x8100);
        assert_eq!(vlan.mac(), registry.get("eth0").unwrap().mac());
    }

    #[test]
    fn add_vlan_validates_id_collision_and_driver_veto() {
        packetmux_utils::test_init!();
        let mut registry = NicRegistry::new();
        let (dev, driver) = device("eth0", 1);
        registry.register(dev).unwrap();

        assert!(registry.add_vlan("eth0", 0).is_err());
        assert!(registry.add_vlan("eth0", 4096).is_err());
        assert!(registry.add_vlan("missing", 5).is_err());

        registry.add_vlan("eth0", 5).unwrap();
        assert!(registry.add_vlan("eth0", 5).is_err());
        // vlans cannot be stacked on vlans
        assert!(registry.add_vlan("eth0.5", 6).is_err());

        driver.lock().unwrap().refuse_vlan = Some(7);
        assert!(registry.add_vlan("eth0", 7).is_err());
        assert!(registry.get("eth0.7").is_none());
    }

    #[test]
    fn remove_vlan_requires_quiescent_registry() {
        packetmux_utils::test_init!();
        let mut registry = NicRegistry::new();
        let (dev, driver) = device("eth0", 1);
        registry.register(dev).unwrap();
        registry.add_vlan("eth0", 42).unwrap();

        let mut dev = registry.unregister("eth0").unwrap();
        registry.register(device("eth1", 2).0).unwrap();
        assert!(registry.remove_vlan(&mut dev, 42).is_err());

        registry.unregister("eth1");
        let vlan = registry.remove_vlan(&mut dev, 42).unwrap();
        assert_eq!(vlan.name(), "eth0.42");
        assert!(dev.vlans.is_empty());
        assert_eq!(driver.lock().unwrap().removed_vlans, vec![42]);
        assert!(registry.remove_vlan(&mut dev, 42).is_err());
    }

    #[test]
    fn flush_all_visits_every_device() {
        packetmux_utils::test_init!();
        let mut registry = NicRegistry::new();
        let (dev, driver) = device("eth0", 1);
        registry.register(dev).unwrap();
        registry.add_vlan("eth0", 10).unwrap();

        let vnic = Vnic::new(
            1,
            VnicAttrs {
                mac: mac(0x10),
                device: "eth0.10".to_string(),
                pool_size: 0x10000,
                ..Default::default()
            },
        );
        let queued = {
            let dev = registry.get_mut("eth0.10").unwrap();
            dev.attach(vnic).unwrap();
            let vnic = dev.vnic_by_id(1).unwrap();
            vnic.output(vnic.alloc(60).unwrap())
        };
        assert!(queued);
        assert_eq!(registry.flush_all(), 1);
        assert_eq!(driver.lock().unwrap().transmitted, 1);
        let vnic = registry.get("eth0.10").unwrap().vnic_by_id(1).unwrap();
        assert_eq!(vnic.vlan_tci(), 10);
        assert_eq!(vnic.stats().tx_packets, 1);
    }
}
