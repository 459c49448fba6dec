//! packetmux-libos implements the device multiplexing and packet I/O layer
//! for packetmux. This includes:
//!  1. Pool-backed, alignment-aware packet buffers.
//!  2. Bounded per-VNIC ingress/egress queues with blocking and non-blocking
//!     acquisition.
//!  3. The VNIC attachment table, MAC-based ingress demultiplexer and
//!     budgeted round-robin egress scheduler.
//!  4. The device registry with VLAN sub-interfacing, and the driver
//!     capability trait physical-NIC drivers implement.
pub mod allocator;
pub mod device;
pub mod driver;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod utils;
pub mod vnic;

/// Identifier assigned to a VNIC by its creator; unique among live VNICs.
pub type VnicId = u32;

pub use allocator::PacketPool;
pub use device::{AttachError, NicDevice, ProcessResult, MAX_VNIC_COUNT};
pub use driver::{NicDriver, TxOutcome};
pub use packet::Packet;
pub use queue::{PacketQueue, PushError, WouldBlock};
pub use registry::{NicRegistry, RegisterError, SharedRegistry, MAX_NIC_DEVICE_COUNT};
pub use vnic::{
    ConfigValue, Ipv4Interface, Vnic, VnicAttrs, VnicInfo, VnicStatsSnapshot, VnicUpdate,
};
