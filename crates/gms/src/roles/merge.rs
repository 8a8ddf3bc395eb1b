//! Merging partitioned sub-clusters
//!
//! The coordinator with the lowest address among those that see each other
//! again leads the merge: it collects every sub-coordinator's view and
//! digest, reduces them into one view and digest, and hands the result back
//! to each sub-coordinator, which installs it in its own sub-group.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::CoordinatorRole;
use crate::address::Address;
use crate::digest::Digest;
use crate::gms::Gms;
use crate::membership::Membership;
use crate::messages::{GmsHeader, MergeData, MergeId};
use crate::transport::{Application, GmsTransport};
use crate::view::{View, ViewId};

/// One merge round driven by its leader
pub(super) struct MergeTask<T, A>
where
    T: GmsTransport,
    A: Application,
{
    gms: Gms<T, A>,
    coordinator: Arc<CoordinatorRole>,
    coordinators: Vec<Address>,
    merge_id: MergeId,
    token: CancellationToken,
}

impl<T, A> MergeTask<T, A>
where
    T: GmsTransport,
    A: Application,
{
    pub(super) fn new(
        gms: Gms<T, A>,
        coordinator: Arc<CoordinatorRole>,
        coordinators: Vec<Address>,
        merge_id: MergeId,
        token: CancellationToken,
    ) -> Self {
        Self {
            gms,
            coordinator,
            coordinators,
            merge_id,
            token,
        }
    }

    pub(super) async fn run(self) {
        let local = self.gms.local_address();

        let result = tokio::select! {
            _ = self.token.cancelled() => {
                debug!("{}: merge {} cancelled locally", local, self.merge_id);
                None
            }
            result = self.collect() => result,
        };

        match result {
            Some((participants, view, digest)) => self.install(participants, view, digest).await,
            None => self.cancel().await,
        }

        if *self.coordinator.merge_id.lock() == Some(self.merge_id) {
            self.coordinator.reset_merge();
        }
    }

    fn others(&self) -> Vec<Address> {
        let local = self.gms.local_address();
        self.coordinators
            .iter()
            .filter(|c| **c != local)
            .copied()
            .collect()
    }

    /// Gather merge data and reduce it, `None` when there is nothing to merge
    async fn collect(&self) -> Option<(Vec<Address>, View, Digest)> {
        let local = self.gms.local_address();

        let Some(own) = self.coordinator.local_merge_data(&self.gms).await else {
            warn!("{}: no view or digest of our own to merge", local);
            return None;
        };
        self.coordinator.merge_responses.set_result_if_absent(own);

        let others = self.others();
        self.gms
            .multicast(
                &others,
                GmsHeader::MergeRequest {
                    merge_id: self.merge_id,
                },
            )
            .await;

        let timeout = self.gms.config().merge_timeout;
        if !self.coordinator.merge_responses.wait_all(timeout).await {
            let responded: Vec<Address> = self
                .coordinator
                .merge_responses
                .results()
                .iter()
                .map(|d| d.sender)
                .collect();
            warn!(
                "{}: merge {} timed out, responses from {:?} only",
                local, self.merge_id, responded
            );
        }

        let accepted: Vec<MergeData> = self
            .coordinator
            .merge_responses
            .results()
            .into_iter()
            .filter(|d| !d.rejected && d.view.is_some() && d.digest.is_some())
            .collect();
        if accepted.len() <= 1 {
            info!(
                "{}: merge {} has {} participants, nothing to merge",
                local,
                self.merge_id,
                accepted.len()
            );
            return None;
        }

        let participants = accepted.iter().map(|d| d.sender).collect();
        let (view, digest) = consolidate(&accepted)?;
        Some((participants, view, digest))
    }

    async fn install(&self, participants: Vec<Address>, view: View, digest: Digest) {
        let local = self.gms.local_address();
        info!(
            "{}: merge {} produced view {} from {} sub-clusters",
            local,
            self.merge_id,
            view,
            participants.len()
        );

        for coordinator in participants.iter().filter(|c| **c != local) {
            self.gms
                .send(
                    coordinator,
                    GmsHeader::InstallMergeView {
                        merge_id: self.merge_id,
                        view: view.clone(),
                        digest: digest.clone(),
                    },
                )
                .await;
        }

        if participants.contains(&local) {
            self.coordinator
                .handle_merge_view(&self.gms, self.merge_id, view, digest)
                .await;
        }
    }

    async fn cancel(&self) {
        let others = self.others();
        self.gms
            .multicast(
                &others,
                GmsHeader::CancelMerge {
                    merge_id: self.merge_id,
                },
            )
            .await;
    }
}

/// Reduce the views and digests of several sub-clusters into one.
///
/// The merged membership is the sorted union of all members, so its
/// coordinator is the lowest address. The view id is one past the highest
/// sub-cluster view id. Digests are merged entry by entry, keeping the
/// highest sequence numbers seen for each sender. Returns `None` when no
/// response carries a view.
pub(crate) fn consolidate(responses: &[MergeData]) -> Option<(View, Digest)> {
    let mut members = Membership::new();
    let mut max_id = 0;
    let mut subgroups = Vec::new();
    let mut digests = Vec::new();

    for data in responses {
        let (Some(view), Some(digest)) = (&data.view, &data.digest) else {
            continue;
        };
        members.add_all(view.members().iter().copied());
        max_id = max_id.max(view.vid().id());

        let mut subgroup = view.clone();
        subgroup.subgroups.clear();
        subgroup.distribution = None;
        subgroups.push(subgroup);
        digests.push(digest);
    }

    members.sort();
    let coordinator = *members.first()?;

    let mut merged = View::merged(
        ViewId::new(coordinator, max_id + 1),
        members.clone(),
        Vec::new(),
    );
    for view in &subgroups {
        for (name, group) in &view.sequencer_table {
            let entry = merged.sequencer_table.entry(name.clone()).or_default();
            for member in group {
                if members.contains(member) && !entry.contains(member) {
                    entry.push(*member);
                }
            }
        }
        for (member, name) in &view.member_subgroups {
            if members.contains(member) {
                merged.member_subgroups.insert(*member, name.clone());
            }
        }
        for (member, incarnation) in &view.incarnations {
            if members.contains(member) {
                merged.incarnations.insert(*member, *incarnation);
            }
        }
    }
    merged.coordinator_incarnation = merged.incarnations.get(&coordinator).copied();
    merged.subgroups = subgroups;

    let mut digest = Digest::new(members.len());
    for d in digests {
        digest.merge(d);
    }

    Some((merged, digest))
}
