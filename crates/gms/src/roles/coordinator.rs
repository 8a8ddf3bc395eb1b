//! Coordinator role

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::merge::MergeTask;
use crate::address::Address;
use crate::digest::Digest;
use crate::gms::{Gms, JoinDecision};
use crate::messages::{GmsHeader, JoinResponse, MergeData, MergeId};
use crate::promise::Promise;
use crate::transport::{Application, GmsTransport};
use crate::view::View;

/// Role of the first member of the view
pub struct CoordinatorRole {
    leaving: AtomicBool,
    pub(super) merging: AtomicBool,
    pub(super) merge_id: Mutex<Option<MergeId>>,
    pub(super) merge_responses: Promise<MergeData>,
    merge_task: Mutex<Option<CancellationToken>>,
    connection_break: tokio::sync::Mutex<()>,
    view_rejections: Mutex<Vec<Address>>,
    admissions: Mutex<HashMap<Address, (Uuid, JoinResponse)>>,
}

impl CoordinatorRole {
    pub(crate) fn new() -> Self {
        Self {
            leaving: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            merge_id: Mutex::new(None),
            merge_responses: Promise::new(),
            merge_task: Mutex::new(None),
            connection_break: tokio::sync::Mutex::new(()),
            view_rejections: Mutex::new(Vec::new()),
            admissions: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::Acquire)
    }

    /// Whether a merge round is in progress on this node
    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    /// Cancel the merge task, if one runs
    pub(crate) fn stop(&self) {
        if let Some(token) = self.merge_task.lock().take() {
            token.cancel();
        }
    }

    pub(crate) async fn leave<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        if member == gms.local_address() {
            self.leaving.store(true, Ordering::Release);
        }
        self.handle_leave(gms, member, false).await;
    }

    /// Decide on a join request.
    ///
    /// Existing members with the same incarnation get the answer they were
    /// given before while the view is unchanged, or the current view and
    /// digest otherwise. New members get a digest extended by one entry and
    /// the next view computed from the pending membership.
    pub(crate) async fn handle_join<T, A>(
        &self,
        gms: &Gms<T, A>,
        member: Address,
        subgroup: &str,
        incarnation: Uuid,
    ) -> Option<JoinDecision>
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        if member == local {
            warn!("{}: cannot join self", local);
            return Some(JoinDecision::Reply(JoinResponse::rejected()));
        }

        if gms.is_member(&member) {
            debug!("{}: {} is already a member, resending view", local, member);
            return self.existing_member_response(gms, member, incarnation).await;
        }

        let Some(current) = gms.fetch_digest().await else {
            warn!("{}: no digest available, cannot admit {}", local, member);
            return None;
        };
        let mut digest = Digest::new(current.len() + 1);
        digest.add_digest(&current);
        digest.add(member, 0, 0);

        gms.register_member(member, subgroup, incarnation);
        let view = gms.get_next_view(&[member], &[], &[])?;
        info!("{}: admitting {} into view {}", local, member, view.vid());
        Some(JoinDecision::Admitted(JoinResponse::success(view, digest)))
    }

    async fn existing_member_response<T, A>(
        &self,
        gms: &Gms<T, A>,
        member: Address,
        incarnation: Uuid,
    ) -> Option<JoinDecision>
    where
        T: GmsTransport,
        A: Application,
    {
        let current_vid = gms.view_id();
        let cached = self.admissions.lock().get(&member).cloned();
        if let Some((admitted_incarnation, rsp)) = cached {
            let same_view = rsp.view.as_ref().map(|v| *v.vid()) == current_vid;
            if admitted_incarnation == incarnation && same_view {
                return Some(JoinDecision::Reply(rsp));
            }
        }

        let view = gms.view()?;
        let digest = gms.fetch_digest().await?;
        Some(JoinDecision::Reply(JoinResponse::success(view, digest)))
    }

    pub(crate) fn remember_admission(&self, member: Address, incarnation: Uuid, rsp: JoinResponse) {
        self.admissions.lock().insert(member, (incarnation, rsp));
    }

    /// Remove a member and broadcast the resulting view.
    ///
    /// Replica partners are removed along with it when the topology pairs
    /// them. Unknown members are acknowledged without a view change.
    pub(crate) async fn handle_leave<T, A>(&self, gms: &Gms<T, A>, member: Address, suspected: bool)
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        let members = gms.members();
        let group = gms.policy().removal_group(&members, &member, &local);

        let mut departing = Vec::new();
        for node in group {
            if members.contains(&node) {
                departing.push(node);
            } else {
                debug!("{}: {} is not a member", local, node);
                if !suspected && node == member {
                    gms.send(&node, GmsHeader::LeaveResponse).await;
                }
            }
        }
        if departing.is_empty() {
            return;
        }

        let subgroup = gms
            .subgroup_of(&member)
            .unwrap_or_else(|| gms.subgroup().to_string());
        for node in &departing {
            self.admissions.lock().remove(node);
            gms.forget_member(node);
        }

        let remaining: Vec<Address> = members
            .iter()
            .filter(|m| !departing.contains(m))
            .copied()
            .collect();
        let distribution = gms
            .acquire_hash_distribution(&remaining, false, &subgroup)
            .await;

        info!(
            "{}: removing {:?} ({})",
            local,
            departing,
            if suspected { "suspected" } else { "leaving" }
        );
        if suspected {
            gms.cast_view_change(&[], &[], &departing, distribution)
                .await;
        } else {
            gms.cast_view_change(&[], &departing, &[], distribution)
                .await;
            for node in &departing {
                gms.send(node, GmsHeader::LeaveResponse).await;
            }
        }
    }

    pub(crate) async fn handle_suspect<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        if member == gms.local_address() {
            warn!("{}: ignoring suspicion of self", member);
            return;
        }
        self.handle_leave(gms, member, true).await;
    }

    /// Install a view, then act on rejections that arrived while this node
    /// was not yet first in the view
    pub(crate) async fn handle_view_change<T, A>(
        self: &Arc<Self>,
        gms: &Gms<T, A>,
        view: View,
        digest: Option<Digest>,
        sender: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        gms.install_view(view, digest, Some(sender)).await;

        let pending = std::mem::take(&mut *self.view_rejections.lock());
        if pending.is_empty() {
            return;
        }
        let coordinator = self.clone();
        let gms = gms.clone();
        tokio::spawn(async move {
            for member in pending {
                coordinator.handle_view_rejected(&gms, member).await;
            }
        });
    }

    /// A member refused a view from this coordinator.
    ///
    /// It still follows another live coordinator, so it is removed from this
    /// node's cluster; a later merge brings the two together again. A node
    /// that was already removed only learns it is out, nothing changes here.
    pub(crate) async fn handle_view_rejected<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        if gms.coordinator() == Some(local) {
            if !gms.is_member(&member) {
                debug!("{}: {} rejected a view it is no longer part of", local, member);
                return;
            }
            info!("{}: {} rejected our view, removing it", local, member);
            self.handle_leave(gms, member, false).await;
        } else {
            debug!("{}: queueing view rejection from {}", local, member);
            self.view_rejections.lock().push(member);
        }
    }

    /// Resolve a broken connection between `informer` and `suspected`.
    ///
    /// A dead suspect is evicted. When both are alive the junior of the two
    /// is asked to leave and removed, so only one side of a flapping link
    /// survives in this cluster.
    pub(crate) async fn handle_connection_broken<T, A>(
        &self,
        gms: &Gms<T, A>,
        informer: Address,
        suspected: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        let _guard = self.connection_break.lock().await;
        let local = gms.local_address();
        if !gms.is_member(&suspected) {
            return;
        }

        if gms.verify_suspect(&suspected, false).await {
            info!("{}: {} confirmed dead after report by {}", local, suspected, informer);
            self.handle_suspect(gms, suspected).await;
            return;
        }

        let senior = gms.members().determine_seniority(&informer, &suspected);
        let junior = if senior == informer { suspected } else { informer };
        if junior == local {
            warn!(
                "{}: connection to {} broken but this node is junior",
                local, senior
            );
            return;
        }
        self.ask_to_leave_cluster(gms, junior).await;
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
        for node in nodes {
            self.handle_connection_broken(gms, informer, node).await;
        }
    }

    async fn ask_to_leave_cluster<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        match gms.incarnation_of(&member) {
            Some(incarnation) => {
                info!("{}: asking {} to leave the cluster", local, member);
                gms.send(&member, GmsHeader::LeaveCluster { incarnation })
                    .await;
            }
            None => warn!("{}: no incarnation known for {}", local, member),
        }
        self.handle_leave(gms, member, true).await;
    }

    /// Broadcast a sequencing reset for a member that came back
    pub(crate) async fn handle_inform_node_rejoining<T, A>(
        &self,
        gms: &Gms<T, A>,
        sender: Address,
        node: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        if !gms.is_member(&node) {
            return;
        }
        let Some(view) = gms.get_next_view(&[], &[], &[]) else {
            return;
        };
        info!(
            "{}: {} reports {} rejoining, resetting to {}",
            gms.local_address(),
            sender,
            node,
            view.vid()
        );
        let members = gms.members().members().to_vec();
        gms.multicast(&members, GmsHeader::ResetOnNodeRejoining { node, view })
            .await;
    }

    /// Start a merge if this node leads the given coordinators
    pub(crate) fn merge<T, A>(self: &Arc<Self>, gms: &Gms<T, A>, coordinators: Vec<Address>)
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        if self.is_merging() {
            debug!("{}: already merging", local);
            return;
        }

        let mut coordinators = coordinators;
        coordinators.sort();
        coordinators.dedup();
        if coordinators.len() <= 1 {
            return;
        }
        if coordinators[0] != local {
            debug!("{}: {} leads the merge", local, coordinators[0]);
            return;
        }

        if self.merging.swap(true, Ordering::AcqRel) {
            debug!("{}: already merging", local);
            return;
        }
        let merge_id = MergeId::new(local);
        *self.merge_id.lock() = Some(merge_id);
        self.merge_responses.reset(coordinators.len());

        let token = CancellationToken::new();
        if let Some(previous) = self.merge_task.lock().replace(token.clone()) {
            previous.cancel();
        }

        info!("{}: leading merge {} of {:?}", local, merge_id, coordinators);
        let task = MergeTask::new(gms.clone(), self.clone(), coordinators, merge_id, token);
        tokio::spawn(task.run());
    }

    /// Hand over this coordinator's view and digest to a merge leader
    pub(crate) async fn handle_merge_request<T, A>(
        self: &Arc<Self>,
        gms: &Gms<T, A>,
        sender: Address,
        merge_id: MergeId,
    ) where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        if self.merging.swap(true, Ordering::AcqRel) {
            warn!(
                "{}: rejecting merge {} from {}: already merging",
                local, merge_id, sender
            );
            gms.send(
                &sender,
                GmsHeader::MergeResponse {
                    merge_id,
                    data: MergeData::rejected(local),
                },
            )
            .await;
            return;
        }
        *self.merge_id.lock() = Some(merge_id);

        let data = match self.local_merge_data(gms).await {
            Some(data) => data,
            None => {
                warn!("{}: no view or digest to offer merge {}", local, merge_id);
                self.reset_merge();
                MergeData::rejected(local)
            }
        };
        gms.send(&sender, GmsHeader::MergeResponse { merge_id, data })
            .await;

        self.arm_merge_watchdog(gms, merge_id);
    }

    pub(super) async fn local_merge_data<T, A>(&self, gms: &Gms<T, A>) -> Option<MergeData>
    where
        T: GmsTransport,
        A: Application,
    {
        let view = gms.view()?;
        let digest = gms.fetch_digest().await?;
        Some(MergeData::new(gms.local_address(), view, digest))
    }

    pub(crate) fn handle_merge_response(&self, data: MergeData, merge_id: MergeId) {
        if *self.merge_id.lock() != Some(merge_id) {
            debug!("ignoring merge response for {} from {}", merge_id, data.sender);
            return;
        }
        self.merge_responses.set_result_if_absent(data);
    }

    /// Install a merged view in this coordinator's sub-group
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
        if *self.merge_id.lock() != Some(merge_id) {
            debug!(
                "{}: ignoring merged view for unknown merge {}",
                gms.local_address(),
                merge_id
            );
            return;
        }

        let subgroup = gms.members().members().to_vec();
        info!(
            "{}: installing merged view {} in sub-group of {}",
            gms.local_address(),
            view,
            subgroup.len()
        );
        gms.broadcast_view(view, Some(digest), Some(subgroup)).await;
        self.reset_merge();
    }

    pub(crate) fn handle_merge_cancelled(&self, merge_id: MergeId) {
        if *self.merge_id.lock() == Some(merge_id) {
            debug!("merge {} cancelled", merge_id);
            self.reset_merge();
        }
    }

    pub(super) fn reset_merge(&self) {
        *self.merge_id.lock() = None;
        self.merge_responses.reset(1);
        self.merging.store(false, Ordering::Release);
    }

    /// Clear a merge this node joined if the leader never finishes it
    fn arm_merge_watchdog<T, A>(self: &Arc<Self>, gms: &Gms<T, A>, merge_id: MergeId)
    where
        T: GmsTransport,
        A: Application,
    {
        let coordinator = self.clone();
        let deadline = gms.config().merge_timeout * 2;
        let local = gms.local_address();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if *coordinator.merge_id.lock() == Some(merge_id) {
                warn!("{}: merge {} never completed, resetting", local, merge_id);
                coordinator.reset_merge();
            }
        });
    }
}
