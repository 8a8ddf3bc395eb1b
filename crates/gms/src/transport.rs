//! Collaborator interfaces
//!
//! Membership sits between two layers it does not own:
//! - a transport below, which moves headers between nodes, answers
//!   discovery and liveness probes and reports suspicion
//! - an application above, which is told about installed views and owns
//!   the digest of its reliable-delivery state

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::address::Address;
use crate::digest::Digest;
use crate::discovery::PingResponse;
use crate::error::GmsResult;
use crate::messages::{GmsHeader, GmsMessage};
use crate::view::{HashDistribution, View, ViewId};

/// Liveness of a node as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Reachable
    Alive,
    /// Unreachable
    Dead,
    /// Shutting down
    Leaving,
}

impl NodeStatus {
    /// Whether the node should be treated as gone
    pub fn is_gone(&self) -> bool {
        !matches!(self, NodeStatus::Alive)
    }
}

/// Events the transport delivers to membership
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A protocol message
    Message(GmsMessage),
    /// The failure detector suspects a member
    Suspect(Address),
    /// A previously suspected member is reachable again
    Unsuspect(Address),
    /// Partition discovery found these coordinators
    Merge(Vec<Address>),
    /// The connection to a member broke
    ConnectionBroken(Address),
    /// Connections to these nodes could not be established
    ConnectionFailure(Vec<Address>),
    /// A failed node is coming back under the same address
    NodeRejoining(Address),
}

/// Transport beneath the membership layer
#[async_trait]
pub trait GmsTransport: Send + Sync + 'static {
    /// Send a header to one node
    async fn send(&self, dest: &Address, header: GmsHeader) -> GmsResult<()>;

    /// Send a header to every listed node
    async fn multicast(&self, dests: &[Address], header: GmsHeader) -> GmsResult<()>;

    /// Ask the network who is out there
    async fn find_initial_members(&self) -> GmsResult<Vec<PingResponse>>;

    /// Probe a node's liveness independently of the failure detector
    async fn node_status(&self, node: &Address) -> NodeStatus;

    /// Tell the transport which members to address
    async fn view_installed(&self, view: &View);

    /// Tell the transport the local node no longer belongs to a view
    async fn disconnected(&self);

    /// Stream of inbound events
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;
}

/// Application above the membership layer
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// A view was installed locally
    async fn on_view_changed(&self, view: View);

    /// Current digest of the reliable-delivery layer
    async fn get_digest(&self) -> GmsResult<Option<Digest>>;

    /// Replace the digest
    async fn set_digest(&self, digest: Digest) -> GmsResult<()>;

    /// Merge watermarks into the digest
    async fn merge_digest(&self, digest: Digest) -> GmsResult<()>;

    /// Recompute key ownership for a new membership.
    ///
    /// Called by the coordinator before it broadcasts a view produced by a
    /// join or a leave. The default has no distribution to offer.
    async fn get_hash_distribution(
        &self,
        _members: &[Address],
        _is_joining: bool,
        _subgroup: &str,
    ) -> GmsResult<Option<HashDistribution>> {
        Ok(None)
    }

    /// Sequencing must restart because a member rejoined
    async fn reset_sequence(&self, _view_id: &ViewId) {}

    /// The local node was excluded from the cluster and reset
    async fn on_excluded(&self, _view: &View) {}
}
