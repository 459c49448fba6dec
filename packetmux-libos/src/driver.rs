use super::packet::Packet;

/// Outcome of draining one packet from a VNIC's egress queue.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TxOutcome {
    /// Packet handed to the driver; keep consuming this VNIC's budget.
    Transmitted,
    /// Nothing queued: soft skip, move to the next VNIC.
    QueueEmpty,
    /// The link refused the packet: hard stop for this scheduling pass.
    TransmitFailed,
}

/// Capability a physical-NIC driver exposes to the packet layer.
///
/// The receive direction is the inverse hookup: the driver calls
/// [`NicDevice::receive`](crate::device::NicDevice::receive) with each raw
/// frame it pulls off the hardware.
pub trait NicDriver: Send {
    /// Attempt to hand one packet to hardware on device `dev`. Returning
    /// `false` means the link cannot currently accept more; it does not mean
    /// the tenant had nothing to send.
    fn transmit(&mut self, dev: &str, packet: &Packet) -> bool;

    /// Whether the driver accepts filtering for this VLAN id on `dev`.
    fn add_vlan_id(&mut self, _dev: &str, _vlan_id: u16) -> bool {
        true
    }

    /// Tear down driver-side state for a VLAN id on `dev`.
    fn remove_vlan_id(&mut self, _dev: &str, _vlan_id: u16) {}
}
