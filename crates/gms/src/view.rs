//! Views and view identifiers

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::membership::Membership;

/// Identifier of a view: the creating node and a logical id.
///
/// Ordered by id first, so a higher id is newer whoever created it; the
/// creator only breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    creator: Address,
    id: u64,
}

impl ViewId {
    /// Create a view id
    pub fn new(creator: Address, id: u64) -> Self {
        Self { creator, id }
    }

    /// Node that created the view
    pub fn creator(&self) -> &Address {
        &self.creator
    }

    /// Logical id
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Ord for ViewId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.creator.cmp(&other.creator))
    }
}

impl PartialOrd for ViewId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|{}]", self.creator, self.id)
    }
}

/// Opaque key-distribution data computed by the partitioning layer above
/// membership and carried along with the view that introduced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDistribution(pub Bytes);

/// Snapshot of cluster membership.
///
/// Members are sorted by address and the first one is the coordinator.
/// Sub-group tables route members into partitions of the layer above; they
/// are carried, not interpreted. A view produced by a merge lists the views
/// it was built from in `subgroups`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    vid: ViewId,
    members: Membership,
    /// Sub-group name to its members
    pub sequencer_table: BTreeMap<String, Vec<Address>>,
    /// Member to its sub-group name
    pub member_subgroups: BTreeMap<Address, String>,
    /// Incarnation of the coordinator that produced this view
    pub coordinator_incarnation: Option<Uuid>,
    /// Incarnation of every member, where known
    pub incarnations: BTreeMap<Address, Uuid>,
    /// Install even if not newer than the current view
    pub force_install: bool,
    /// Key distribution attached by the coordinator
    pub distribution: Option<HashDistribution>,
    /// Views that were combined into this one by a merge
    pub subgroups: Vec<View>,
}

impl View {
    /// Create a view with no ancillary tables
    pub fn new(vid: ViewId, members: Membership) -> Self {
        Self {
            vid,
            members,
            sequencer_table: BTreeMap::new(),
            member_subgroups: BTreeMap::new(),
            coordinator_incarnation: None,
            incarnations: BTreeMap::new(),
            force_install: false,
            distribution: None,
            subgroups: Vec::new(),
        }
    }

    /// Create a merge view carrying the sub-group views it was built from
    pub fn merged(vid: ViewId, members: Membership, subgroups: Vec<View>) -> Self {
        let mut view = Self::new(vid, members);
        view.subgroups = subgroups;
        view
    }

    /// View identifier
    pub fn vid(&self) -> &ViewId {
        &self.vid
    }

    /// Members, sorted by address
    pub fn members(&self) -> &Membership {
        &self.members
    }

    /// Coordinator, the first member
    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }

    /// Node that created the view
    pub fn creator(&self) -> &Address {
        self.vid.creator()
    }

    /// Whether the address is a member
    pub fn contains(&self, member: &Address) -> bool {
        self.members.contains(member)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view has no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the view was produced by a merge
    pub fn is_merge_view(&self) -> bool {
        !self.subgroups.is_empty()
    }

    /// Known incarnation of a member
    pub fn incarnation_of(&self, member: &Address) -> Option<Uuid> {
        self.incarnations.get(member).copied()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.vid, self.members)?;
        if self.is_merge_view() {
            write!(f, " merged from {} subgroups", self.subgroups.len())?;
        }
        Ok(())
    }
}
