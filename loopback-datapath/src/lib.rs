//! In-memory implementation of the packetmux driver boundary: transmitted
//! packets land on a shared "wire" and can be pumped back into any device's
//! ingress demultiplexer. Used for tests and single-host deployments.
pub mod datapath;

pub use datapath::connection::{LoopbackDriver, LoopbackWire};
