//! Deployment topology rules
//!
//! Some deployments run members in replica pairs on one host. The pairing
//! changes which members leave together, which coordinator changes are
//! accepted without probing, and whether joins wait for state transfer.

use std::fmt::Debug;

use crate::address::Address;
use crate::membership::Membership;

/// Topology-specific membership rules
pub trait TopologyPolicy: Debug + Send + Sync + 'static {
    /// Members removed together when `member` leaves or fails, in removal
    /// order. Always contains `member`.
    fn removal_group(&self, members: &Membership, member: &Address, local: &Address)
    -> Vec<Address>;

    /// Accept a view from a coordinator that conflicts with the current one
    /// without probing the current coordinator
    fn accepts_coordinator(&self, local: &Address, new_coordinator: &Address) -> bool;

    /// Refuse joins while the cluster is in state transfer
    fn gates_joins_on_state_transfer(&self) -> bool;
}

/// Independent members; no pairing
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardTopology;

impl TopologyPolicy for StandardTopology {
    fn removal_group(
        &self,
        _members: &Membership,
        member: &Address,
        _local: &Address,
    ) -> Vec<Address> {
        vec![*member]
    }

    fn accepts_coordinator(&self, _local: &Address, _new_coordinator: &Address) -> bool {
        false
    }

    fn gates_joins_on_state_transfer(&self) -> bool {
        false
    }
}

/// Members sharing a host form a replica pair
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplicaPairTopology;

impl TopologyPolicy for ReplicaPairTopology {
    fn removal_group(&self, members: &Membership, member: &Address, local: &Address) -> Vec<Address> {
        let mut group = vec![*member];
        if !member.same_host(local) {
            group.extend(
                members
                    .iter()
                    .filter(|m| *m != member && m.same_host(member))
                    .copied(),
            );
        }
        // higher port first
        group.sort_by(|a, b| b.port().cmp(&a.port()));
        group
    }

    fn accepts_coordinator(&self, local: &Address, new_coordinator: &Address) -> bool {
        local.same_host(new_coordinator)
    }

    fn gates_joins_on_state_transfer(&self) -> bool {
        true
    }
}
