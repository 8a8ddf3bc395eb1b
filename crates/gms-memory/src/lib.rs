//! In-memory transport and application for the group membership service
//!
//! Nodes attached to one [`MemoryNetwork`] exchange encoded headers over
//! channels within the process. The network can be partitioned, healed
//! and have nodes crash, and it plays the failure detector and partition
//! discovery for the nodes attached to it. Useful for testing and
//! development scenarios.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod application;
mod network;
mod transport;

pub use application::MemoryApplication;
pub use network::MemoryNetwork;
pub use transport::MemoryTransport;

/// Membership service running over the memory network
pub type MemoryGms = proven_gms::Gms<MemoryTransport, MemoryApplication>;
