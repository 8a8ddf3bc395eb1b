//! Membership roles
//!
//! A node is always in exactly one role:
//! - [`ClientRole`] while joining
//! - [`ParticipantRole`] as an ordinary member
//! - [`CoordinatorRole`] as the first member of the installed view
//!
//! The engine swaps the active role; roles hold only their own state and
//! reach everything else through the engine handle passed to each call.

mod client;
mod coordinator;
mod merge;
mod participant;

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::address::Address;
use crate::digest::Digest;
use crate::gms::Gms;
use crate::messages::{JoinResponse, MergeData, MergeId};
use crate::transport::{Application, GmsTransport};
use crate::view::View;

pub use client::ClientRole;
pub use coordinator::CoordinatorRole;
pub(crate) use merge::consolidate;
pub use participant::ParticipantRole;

/// Which role a node currently plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Joining
    Client,
    /// Ordinary member
    Participant,
    /// First member of the view
    Coordinator,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Client => "client",
            RoleKind::Participant => "participant",
            RoleKind::Coordinator => "coordinator",
        };
        f.write_str(name)
    }
}

/// The active role
pub enum Role {
    /// Joining
    Client(Arc<ClientRole>),
    /// Ordinary member
    Participant(Arc<ParticipantRole>),
    /// First member of the view
    Coordinator(Arc<CoordinatorRole>),
}

impl Role {
    /// Kind of the role
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Client(_) => RoleKind::Client,
            Role::Participant(_) => RoleKind::Participant,
            Role::Coordinator(_) => RoleKind::Coordinator,
        }
    }

    /// Whether the role is on its way out of the cluster
    pub fn is_leaving(&self) -> bool {
        match self {
            Role::Client(c) => c.is_leaving(),
            Role::Participant(p) => p.is_leaving(),
            Role::Coordinator(c) => c.is_leaving(),
        }
    }

    /// Stop background work owned by the role
    pub fn stop(&self) {
        match self {
            Role::Client(c) => c.stop(),
            Role::Participant(_) => {}
            Role::Coordinator(c) => c.stop(),
        }
    }

    pub(crate) async fn leave<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Client(c) => c.leave(),
            Role::Participant(p) => p.leave(gms, member).await,
            Role::Coordinator(c) => c.leave(gms, member).await,
        }
    }

    pub(crate) fn handle_join_response(&self, rsp: JoinResponse) {
        match self {
            Role::Client(c) => c.handle_join_response(rsp),
            other => wrong_role(other, "handle_join_response"),
        }
    }

    pub(crate) fn handle_leave_response(&self) {
        match self {
            Role::Participant(p) => p.handle_leave_response(),
            other => wrong_role(other, "handle_leave_response"),
        }
    }

    pub(crate) async fn handle_view_change<T, A>(
        &self,
        gms: &Gms<T, A>,
        view: View,
        digest: Option<Digest>,
        sender: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Client(_) => debug!(
                "{}: client ignores view {} from {}",
                gms.local_address(),
                view.vid(),
                sender
            ),
            Role::Participant(p) => p.handle_view_change(gms, view, digest, sender).await,
            Role::Coordinator(c) => c.handle_view_change(gms, view, digest, sender).await,
        }
    }

    pub(crate) async fn handle_suspect<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Participant(p) => p.handle_suspect(gms, member).await,
            Role::Coordinator(c) => c.handle_suspect(gms, member).await,
            other => wrong_role(other, "handle_suspect"),
        }
    }

    pub(crate) fn handle_unsuspect(&self, member: &Address) {
        if let Role::Participant(p) = self {
            p.handle_unsuspect(member);
        }
    }

    pub(crate) async fn handle_merge<T, A>(&self, gms: &Gms<T, A>, coordinators: Vec<Address>)
    where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Coordinator(c) => c.merge(gms, coordinators),
            other => wrong_role(other, "merge"),
        }
    }

    pub(crate) async fn handle_merge_request<T, A>(
        &self,
        gms: &Gms<T, A>,
        sender: Address,
        merge_id: MergeId,
    ) where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Coordinator(c) => c.handle_merge_request(gms, sender, merge_id).await,
            other => wrong_role(other, "handle_merge_request"),
        }
    }

    pub(crate) fn handle_merge_response(&self, data: MergeData, merge_id: MergeId) {
        match self {
            Role::Coordinator(c) => c.handle_merge_response(data, merge_id),
            other => wrong_role(other, "handle_merge_response"),
        }
    }

    pub(crate) async fn handle_merge_view<T, A>(
        &self,
        gms: &Gms<T, A>,
        merge_id: MergeId,
        view: View,
        digest: Digest,
    ) where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Coordinator(c) => c.handle_merge_view(gms, merge_id, view, digest).await,
            other => wrong_role(other, "handle_merge_view"),
        }
    }

    pub(crate) fn handle_merge_cancelled(&self, merge_id: MergeId) {
        match self {
            Role::Coordinator(c) => c.handle_merge_cancelled(merge_id),
            other => wrong_role(other, "handle_merge_cancelled"),
        }
    }

    pub(crate) async fn handle_view_rejected<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Coordinator(c) => c.handle_view_rejected(gms, member).await,
            other => wrong_role(other, "handle_view_rejected"),
        }
    }

    pub(crate) async fn handle_connection_broken<T, A>(
        &self,
        gms: &Gms<T, A>,
        informer: Address,
        suspected: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Coordinator(c) => c.handle_connection_broken(gms, informer, suspected).await,
            other => wrong_role(other, "handle_connection_broken"),
        }
    }

    pub(crate) async fn handle_can_not_connect_to<T, A>(
        &self,
        gms: &Gms<T, A>,
        informer: Address,
        nodes: Vec<Address>,
    ) where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Coordinator(c) => c.handle_can_not_connect_to(gms, informer, nodes).await,
            other => wrong_role(other, "handle_can_not_connect_to"),
        }
    }

    /// The transport reported a broken connection to `suspected`
    pub(crate) async fn handle_connection_broken_event<T, A>(
        &self,
        gms: &Gms<T, A>,
        suspected: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Participant(p) => p.report_connection_broken(gms, suspected).await,
            Role::Coordinator(c) => {
                c.handle_connection_broken(gms, gms.local_address(), suspected)
                    .await
            }
            other => wrong_role(other, "handle_connection_broken_event"),
        }
    }

    /// The transport could not connect to `nodes`
    pub(crate) async fn handle_connection_failure<T, A>(&self, gms: &Gms<T, A>, nodes: Vec<Address>)
    where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Participant(p) => p.handle_connection_failure(gms, nodes).await,
            Role::Coordinator(c) => {
                c.handle_can_not_connect_to(gms, gms.local_address(), nodes)
                    .await
            }
            other => wrong_role(other, "handle_connection_failure"),
        }
    }

    pub(crate) async fn handle_leave_cluster_request<T, A>(&self, gms: &Gms<T, A>, sender: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Participant(p) => p.handle_leave_cluster_request(gms, sender).await,
            other => wrong_role(other, "handle_leave_cluster_request"),
        }
    }

    /// The transport reported that `node` is rejoining
    pub(crate) async fn handle_node_rejoining<T, A>(&self, gms: &Gms<T, A>, node: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Participant(p) => p.handle_node_rejoining(gms, node).await,
            Role::Coordinator(c) => {
                c.handle_inform_node_rejoining(gms, gms.local_address(), node)
                    .await
            }
            other => wrong_role(other, "handle_node_rejoining"),
        }
    }

    pub(crate) async fn handle_inform_node_rejoining<T, A>(
        &self,
        gms: &Gms<T, A>,
        sender: Address,
        node: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Coordinator(c) => c.handle_inform_node_rejoining(gms, sender, node).await,
            other => wrong_role(other, "handle_inform_node_rejoining"),
        }
    }

    pub(crate) async fn handle_inform_about_node_death<T, A>(
        &self,
        gms: &Gms<T, A>,
        sender: Address,
        dead: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        match self {
            Role::Participant(p) => p.handle_inform_about_node_death(gms, sender, dead).await,
            other => wrong_role(other, "handle_inform_about_node_death"),
        }
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Role({})", self.kind())
    }
}

fn wrong_role(role: &Role, method: &str) {
    debug!("{method} is not handled by the {} role", role.kind());
}
