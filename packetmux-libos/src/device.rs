use super::driver::{NicDriver, TxOutcome};
use super::utils::{ether_dst, is_multicast};
use super::vnic::{Vnic, VnicUpdate};
use super::VnicId;
use color_eyre::eyre::{bail, Result};
use eui48::MacAddress;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Max VNICs attachable to one device.
pub const MAX_VNIC_COUNT: usize = 16;

/// What the demultiplexer did with a received frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProcessResult {
    /// A unicast match took the frame; the caller must not forward it again.
    Consumed,
    /// No exclusive owner: unmatched unicast, multicast fan-out (every
    /// recipient copied it), or a frame too short to carry an Ethernet
    /// header. The caller may pass it along.
    Passed,
}

/// Attach rejections hand the VNIC back so the caller keeps ownership.
#[derive(Debug)]
pub enum AttachError {
    /// Another VNIC on this device already answers to that MAC.
    DuplicateMac(Vnic),
    /// All slots occupied.
    Full(Vnic),
}

/// One physical NIC (or VLAN pseudo-device): a name, a MAC, up to
/// [`MAX_VNIC_COUNT`] attached VNICs kept in a compacted slot array, and the
/// rotating egress-scheduler cursor.
///
/// Compaction invariant: occupied slots form a prefix, so every scan stops at
/// the first empty slot.
pub struct NicDevice {
    name: String,
    mac: MacAddress,
    vlan_proto: u16,
    vlan_tci: u16,
    driver: Arc<Mutex<dyn NicDriver>>,
    slots: [Option<Vnic>; MAX_VNIC_COUNT],
    cursor: AtomicUsize,
    /// VLAN pseudo-devices derived from this one, ascending by VLAN id.
    /// Empty on pseudo-devices themselves (one level deep).
    pub(crate) vlans: Vec<NicDevice>,
}

impl NicDevice {
    pub fn new(name: &str, mac: MacAddress, driver: Arc<Mutex<dyn NicDriver>>) -> NicDevice {
        NicDevice {
            name: name.to_string(),
            mac,
            vlan_proto: 0,
            vlan_tci: 0,
            driver,
            slots: std::array::from_fn(|_| None),
            cursor: AtomicUsize::new(0),
            vlans: Vec::new(),
        }
    }

    /// VLAN pseudo-device sharing the parent's MAC and driver handle.
    pub(crate) fn new_vlan(name: &str, parent: &NicDevice, vlan_id: u16) -> NicDevice {
        NicDevice {
            name: name.to_string(),
            mac: parent.mac,
            vlan_proto: super::utils::ETHERTYPE_8021Q,
            vlan_tci: vlan_id,
            driver: Arc::clone(&parent.driver),
            slots: std::array::from_fn(|_| None),
            cursor: AtomicUsize::new(0),
            vlans: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn vlan_proto(&self) -> u16 {
        self.vlan_proto
    }

    pub fn vlan_tci(&self) -> u16 {
        self.vlan_tci
    }

    pub fn is_vlan(&self) -> bool {
        self.vlan_proto != 0
    }

    pub(crate) fn driver(&self) -> &Arc<Mutex<dyn NicDriver>> {
        &self.driver
    }

    // ---- attachment ----

    /// Inserts a VNIC into the first empty slot, stamping the device's VLAN
    /// proto/tci into it. Duplicate-MAC and table-full rejections return the
    /// VNIC to the caller.
    pub fn attach(&mut self, mut vnic: Vnic) -> Result<(), AttachError> {
        if self.vnic_by_mac(vnic.mac()).is_some() {
            return Err(AttachError::DuplicateMac(vnic));
        }
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                vnic.set_vlan(self.vlan_proto, self.vlan_tci);
                tracing::debug!(device = %self.name, vnic = vnic.id(), mac = %vnic.mac(), "attached");
                *slot = Some(vnic);
                Ok(())
            }
            None => Err(AttachError::Full(vnic)),
        }
    }

    /// Removes a VNIC and left-shifts the remaining slots so the occupied
    /// prefix stays contiguous. The VNIC comes back by value with its queues
    /// and pool intact.
    pub fn detach(&mut self, id: VnicId) -> Option<Vnic> {
        let idx = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().map(Vnic::id) == Some(id))?;
        let vnic = self.slots[idx].take();
        for j in idx..MAX_VNIC_COUNT - 1 {
            self.slots[j] = self.slots[j + 1].take();
        }
        let remaining = self.vnic_count();
        let cursor = self.cursor.load(Ordering::Relaxed);
        if remaining == 0 || cursor >= remaining {
            self.cursor.store(0, Ordering::Relaxed);
        }
        tracing::debug!(device = %self.name, vnic = id, "detached");
        vnic
    }

    pub fn vnic_count(&self) -> usize {
        self.vnics().count()
    }

    /// Attached VNICs in slot order; stops at the first empty slot.
    pub fn vnics(&self) -> impl Iterator<Item = &Vnic> {
        self.slots.iter().map_while(|slot| slot.as_ref())
    }

    pub fn vnic_by_id(&self, id: VnicId) -> Option<&Vnic> {
        self.vnics().find(|vnic| vnic.id() == id)
    }

    pub fn vnic_by_mac(&self, mac: MacAddress) -> Option<&Vnic> {
        self.vnics().find(|vnic| vnic.mac() == mac)
    }

    /// Applies an attribute patch. The MAC change is checked against every
    /// sibling before anything is written, so a rejected update leaves the
    /// VNIC untouched.
    pub fn update_vnic(&mut self, update: &VnicUpdate) -> Result<()> {
        let idx = match self
            .slots
            .iter()
            .position(|slot| slot.as_ref().map(Vnic::id) == Some(update.id))
        {
            Some(idx) => idx,
            None => bail!("no vnic {} on device {}", update.id, self.name),
        };
        let mac_taken = self.vnics().any(|v| v.id() != update.id && v.mac() == update.mac);
        if mac_taken {
            bail!(
                "mac {} already in use on device {}",
                update.mac,
                self.name
            );
        }
        if let Some(vnic) = self.slots[idx].as_mut() {
            vnic.set_mac(update.mac);
            vnic.apply_update(update);
        }
        Ok(())
    }

    // ---- ingress demultiplexer ----

    /// Demultiplexes a raw frame by destination MAC. See
    /// [`receive_with_meta`](Self::receive_with_meta).
    pub fn receive(&self, frame: &[u8]) -> ProcessResult {
        self.receive_with_meta(frame, None)
    }

    /// Demultiplexes a frame, appending optional driver-supplied receive
    /// metadata after it in the recipient's buffer. Multicast fans out to
    /// every VNIC (each copies into its own pool) and is never consumed;
    /// unicast goes to the exact MAC match only. A recipient that cannot take
    /// the frame counts its own drop.
    pub fn receive_with_meta(&self, frame: &[u8], meta: Option<&[u8]>) -> ProcessResult {
        let dst = match ether_dst(frame) {
            Some(dst) => dst,
            None => return ProcessResult::Passed,
        };
        if is_multicast(&dst) {
            for vnic in self.vnics() {
                vnic.deliver(frame, meta);
            }
            return ProcessResult::Passed;
        }
        match self.vnic_by_mac(dst) {
            Some(vnic) => {
                vnic.deliver(frame, meta);
                ProcessResult::Consumed
            }
            None => ProcessResult::Passed,
        }
    }

    // ---- egress scheduler ----

    /// One budgeted round-robin pass over the attached VNICs, starting at the
    /// persisted cursor. Each VNIC drains at most its budget; an empty queue
    /// abandons the remaining credit and moves on; a driver refusal restores
    /// the packet, parks the cursor on the failing VNIC and ends the pass.
    /// After a completed pass the cursor advances by one populated slot.
    ///
    /// Returns the number of packets handed to the driver.
    pub fn flush(&self) -> usize {
        let populated = self.vnic_count();
        if populated == 0 {
            return 0;
        }
        let mut driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let start = self.cursor.load(Ordering::Relaxed) % populated;
        let mut sent = 0;
        for offset in 0..populated {
            let i = (start + offset) % populated;
            let vnic = match self.slots[i].as_ref() {
                Some(vnic) => vnic,
                None => break,
            };
            for _ in 0..vnic.budget() {
                match vnic.drain_one(&self.name, &mut *driver) {
                    TxOutcome::Transmitted => sent += 1,
                    TxOutcome::QueueEmpty => break,
                    TxOutcome::TransmitFailed => {
                        self.cursor.store(i, Ordering::Relaxed);
                        tracing::debug!(device = %self.name, vnic = vnic.id(), "link refused, pass ended");
                        return sent;
                    }
                }
            }
        }
        self.cursor.store((start + 1) % populated, Ordering::Relaxed);
        sent
    }
}

impl std::fmt::Debug for NicDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NicDevice")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .field("vlan_tci", &self.vlan_tci)
            .field("vnics", &self.vnic_count())
            .field("vlans", &self.vlans.len())
            .finish()
    }
}
