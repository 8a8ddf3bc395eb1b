//! Protocol messages exchanged between membership roles

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::digest::Digest;
use crate::error::{GmsError, GmsResult};
use crate::view::{View, ViewId};

/// Outcome of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinResult {
    /// Admitted; view and digest are attached
    Success,
    /// Refused; the joiner should start its own cluster
    Rejected,
    /// Another membership change is in flight; retry later
    ChangeInProgress,
}

/// Coordinator's answer to a join request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// View that includes the joiner
    pub view: Option<View>,
    /// Digest extended with an entry for the joiner
    pub digest: Option<Digest>,
    /// Result code
    pub result: JoinResult,
}

impl JoinResponse {
    /// Successful join carrying view and digest
    pub fn success(view: View, digest: Digest) -> Self {
        Self {
            view: Some(view),
            digest: Some(digest),
            result: JoinResult::Success,
        }
    }

    /// Refused join
    pub fn rejected() -> Self {
        Self {
            view: None,
            digest: None,
            result: JoinResult::Rejected,
        }
    }

    /// Retry-later answer
    pub fn change_in_progress() -> Self {
        Self {
            view: None,
            digest: None,
            result: JoinResult::ChangeInProgress,
        }
    }
}

/// Correlation id of a merge round: leader address plus start time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeId {
    /// Merge leader
    pub leader: Address,
    /// Milliseconds since the epoch when the round started
    pub timestamp_ms: u64,
}

impl MergeId {
    /// New id for a merge led by `leader`
    pub fn new(leader: Address) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            leader,
            timestamp_ms,
        }
    }
}

impl fmt::Display for MergeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.leader, self.timestamp_ms)
    }
}

/// One coordinator's contribution to a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeData {
    /// Responding coordinator
    pub sender: Address,
    /// Its current view
    pub view: Option<View>,
    /// Its current digest
    pub digest: Option<Digest>,
    /// Set when the coordinator is already merging
    pub rejected: bool,
}

impl MergeData {
    /// Data for an accepted merge request
    pub fn new(sender: Address, view: View, digest: Digest) -> Self {
        Self {
            sender,
            view: Some(view),
            digest: Some(digest),
            rejected: false,
        }
    }

    /// Data refusing the merge
    pub fn rejected(sender: Address) -> Self {
        Self {
            sender,
            view: None,
            digest: None,
            rejected: true,
        }
    }
}

/// Membership protocol header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GmsHeader {
    /// Ask the coordinator for admission
    JoinRequest {
        member: Address,
        subgroup: String,
        incarnation: Uuid,
    },
    /// Admission answer
    JoinResponse(JoinResponse),
    /// Ask the coordinator for removal
    LeaveRequest { member: Address },
    /// Removal acknowledged
    LeaveResponse,
    /// New view to install
    View {
        view: View,
        digest: Option<Digest>,
    },
    /// View received
    ViewAck { view_id: ViewId },
    /// Ask a coordinator for its merge data
    MergeRequest { merge_id: MergeId },
    /// Merge data
    MergeResponse { merge_id: MergeId, data: MergeData },
    /// Consolidated merge result for a sub-group coordinator to install
    InstallMergeView {
        merge_id: MergeId,
        view: View,
        digest: Digest,
    },
    /// Abandon a merge round
    CancelMerge { merge_id: MergeId },
    /// A member refused to install a view from a coordinator it does not
    /// recognize
    ViewRejected { member: Address },
    /// The sender cannot reach the listed nodes
    CanNotConnectTo { nodes: Vec<Address> },
    /// Asked by the coordinator to split off
    LeaveCluster { incarnation: Uuid },
    /// The sender lost its connection to `suspected`
    ConnectionBroken { suspected: Address },
    /// A previously failed node is coming back
    InformNodeRejoining { node: Address },
    /// Reset sequencing for a rejoined node
    ResetOnNodeRejoining { node: Address, view: View },
    /// The sender believes `dead` no longer runs
    InformAboutNodeDeath { dead: Address },
    /// Ask whether the receiver is in state transfer
    IsNodeInStateTransfer,
    /// State-transfer answer
    IsNodeInStateTransferResponse { in_state_transfer: bool },
}

impl GmsHeader {
    /// Short protocol name of the header
    pub fn type_name(&self) -> &'static str {
        match self {
            GmsHeader::JoinRequest { .. } => "JOIN_REQ",
            GmsHeader::JoinResponse(_) => "JOIN_RSP",
            GmsHeader::LeaveRequest { .. } => "LEAVE_REQ",
            GmsHeader::LeaveResponse => "LEAVE_RSP",
            GmsHeader::View { .. } => "VIEW",
            GmsHeader::ViewAck { .. } => "VIEW_ACK",
            GmsHeader::MergeRequest { .. } => "MERGE_REQ",
            GmsHeader::MergeResponse { .. } => "MERGE_RSP",
            GmsHeader::InstallMergeView { .. } => "INSTALL_MERGE_VIEW",
            GmsHeader::CancelMerge { .. } => "CANCEL_MERGE",
            GmsHeader::ViewRejected { .. } => "VIEW_REJECTED",
            GmsHeader::CanNotConnectTo { .. } => "CAN_NOT_CONNECT_TO",
            GmsHeader::LeaveCluster { .. } => "LEAVE_CLUSTER",
            GmsHeader::ConnectionBroken { .. } => "CONNECTION_BROKEN",
            GmsHeader::InformNodeRejoining { .. } => "INFORM_NODE_REJOINING",
            GmsHeader::ResetOnNodeRejoining { .. } => "RESET_ON_NODE_REJOINING",
            GmsHeader::InformAboutNodeDeath { .. } => "INFORM_ABOUT_NODE_DEATH",
            GmsHeader::IsNodeInStateTransfer => "IS_NODE_IN_STATE_TRANSFER",
            GmsHeader::IsNodeInStateTransferResponse { .. } => "IS_NODE_IN_STATE_TRANSFER_RSP",
        }
    }

    /// Encode as CBOR
    pub fn to_bytes(&self) -> GmsResult<Bytes> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| GmsError::Serialization(format!("failed to encode {}: {e}", self.type_name())))?;
        Ok(Bytes::from(buf))
    }

    /// Decode from CBOR
    pub fn from_bytes(bytes: &[u8]) -> GmsResult<Self> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| GmsError::Serialization(format!("failed to decode header: {e}")))
    }
}

impl fmt::Display for GmsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GmsHeader::JoinRequest { member, .. } => write!(f, "JOIN_REQ mbr={member}"),
            GmsHeader::LeaveRequest { member } => write!(f, "LEAVE_REQ mbr={member}"),
            GmsHeader::View { view, .. } => write!(f, "VIEW {view}"),
            GmsHeader::ViewAck { view_id } => write!(f, "VIEW_ACK {view_id}"),
            GmsHeader::MergeRequest { merge_id }
            | GmsHeader::CancelMerge { merge_id }
            | GmsHeader::MergeResponse { merge_id, .. }
            | GmsHeader::InstallMergeView { merge_id, .. } => {
                write!(f, "{} merge_id={merge_id}", self.type_name())
            }
            GmsHeader::ViewRejected { member } => write!(f, "VIEW_REJECTED mbr={member}"),
            GmsHeader::ConnectionBroken { suspected } => {
                write!(f, "CONNECTION_BROKEN suspected={suspected}")
            }
            other => write!(f, "{}", other.type_name()),
        }
    }
}

/// Header together with the address it came from
#[derive(Debug, Clone)]
pub struct GmsMessage {
    /// Sender
    pub src: Address,
    /// Protocol header
    pub header: GmsHeader,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Membership;

    #[test]
    fn test_view_header_survives_cbor() {
        let a = Address::localhost(7800);
        let b = Address::localhost(7801);
        let mut view = View::new(ViewId::new(a, 3), Membership::from_members(vec![a, b]));
        view.member_subgroups.insert(b, "replicas".to_string());
        view.incarnations.insert(a, Uuid::new_v4());

        let mut digest = Digest::new(2);
        digest.add(a, 0, 4);
        digest.add_with_seen(b, 1, 2, 3);

        let header = GmsHeader::View {
            view,
            digest: Some(digest),
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(GmsHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let err = GmsHeader::from_bytes(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, GmsError::Serialization(_)));
    }
}
