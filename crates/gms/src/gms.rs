//! Group membership engine
//!
//! [`Gms`] is the per-node driver. It owns the active role, the installed
//! view and the logical clock, dispatches transport events to the role and
//! offers the roles the blocking primitives they build on: view broadcast
//! with acknowledgement, digest fetch and liveness verification.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::config::GmsConfig;
use crate::digest::Digest;
use crate::discovery::PingResponse;
use crate::error::{GmsError, GmsResult};
use crate::membership::Membership;
use crate::messages::{GmsHeader, GmsMessage, JoinResponse};
use crate::policy::TopologyPolicy;
use crate::promise::Promise;
use crate::roles::{ClientRole, CoordinatorRole, ParticipantRole, Role, RoleKind};
use crate::transport::{Application, GmsTransport, TransportEvent};
use crate::view::{HashDistribution, View, ViewId};

/// Result of offering a view to [`Gms::install_view`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallOutcome {
    /// Installed and announced
    Installed,
    /// Same members from the same creator; only the id moved forward
    Unchanged,
    /// Not newer than the current view
    Stale,
    /// The local node is not a member
    NotIncluded,
    /// A live coordinator other than the sender holds authority
    Rejected,
}

/// Membership state guarded by one lock
#[derive(Debug, Default)]
pub(crate) struct MembershipState {
    pub(crate) view_id: Option<ViewId>,
    pub(crate) view: Option<View>,
    pub(crate) members: Membership,
    /// Members once pending joins and leaves complete
    pub(crate) tmp_members: Membership,
    pub(crate) joining: Vec<Address>,
    pub(crate) leaving: Vec<Address>,
    pub(crate) ltime: u64,
    pub(crate) prev_members: VecDeque<Address>,
    pub(crate) sequencer_table: BTreeMap<String, Vec<Address>>,
    pub(crate) member_subgroups: BTreeMap<Address, String>,
    pub(crate) incarnations: BTreeMap<Address, Uuid>,
}

impl MembershipState {
    fn add_to_subgroup(&mut self, member: Address, subgroup: &str) {
        let members = self.sequencer_table.entry(subgroup.to_string()).or_default();
        if !members.contains(&member) {
            members.push(member);
        }
        self.member_subgroups.insert(member, subgroup.to_string());
    }

    fn remove_from_subgroup(&mut self, member: &Address) {
        if let Some(subgroup) = self.member_subgroups.remove(member) {
            if let Some(members) = self.sequencer_table.get_mut(&subgroup) {
                members.retain(|m| m != member);
                if members.is_empty() {
                    self.sequencer_table.remove(&subgroup);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct ChangeGuard {
    join_in_progress: bool,
    leave_in_progress: bool,
}

#[derive(Debug, Default)]
struct StateTransferMark {
    since: Option<Instant>,
}

struct GmsInner<T, A> {
    local: Address,
    incarnation: Uuid,
    subgroup: String,
    config: GmsConfig,
    transport: Arc<T>,
    application: Arc<A>,
    policy: Arc<dyn TopologyPolicy>,
    state: RwLock<MembershipState>,
    install_lock: tokio::sync::Mutex<()>,
    digest_lock: tokio::sync::Mutex<()>,
    role: ArcSwap<Role>,
    change_guard: Mutex<ChangeGuard>,
    view_acks: DashMap<ViewId, Arc<Promise<Address>>>,
    state_transfer: Mutex<StateTransferMark>,
    state_transfer_query: Mutex<Option<Arc<Promise<bool>>>>,
    operational: AtomicBool,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Group membership service for one node
pub struct Gms<T, A>
where
    T: GmsTransport,
    A: Application,
{
    inner: Arc<GmsInner<T, A>>,
}

impl<T, A> Clone for Gms<T, A>
where
    T: GmsTransport,
    A: Application,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, A> Gms<T, A>
where
    T: GmsTransport,
    A: Application,
{
    pub(crate) fn new(
        local: Address,
        subgroup: String,
        config: GmsConfig,
        transport: Arc<T>,
        application: Arc<A>,
        policy: Arc<dyn TopologyPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(GmsInner {
                local,
                incarnation: Uuid::new_v4(),
                subgroup,
                config,
                transport,
                application,
                policy,
                state: RwLock::new(MembershipState::default()),
                install_lock: tokio::sync::Mutex::new(()),
                digest_lock: tokio::sync::Mutex::new(()),
                role: ArcSwap::from_pointee(Role::Client(Arc::new(ClientRole::new()))),
                change_guard: Mutex::new(ChangeGuard::default()),
                view_acks: DashMap::new(),
                state_transfer: Mutex::new(StateTransferMark::default()),
                state_transfer_query: Mutex::new(None),
                operational: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start dispatching transport events. Idempotent.
    pub fn start(&self) -> GmsResult<()> {
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            return Ok(());
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(GmsError::Configuration(
                "membership service was shut down".to_string(),
            ));
        }

        let mut incoming = self.inner.transport.incoming();
        let token = self.inner.shutdown.clone();
        let gms = self.clone();
        *dispatcher = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("{}: dispatcher stopping", gms.local_address());
                        break;
                    }
                    event = incoming.next() => match event {
                        Some(event) => gms.dispatch(event).await,
                        None => {
                            debug!("{}: transport event stream closed", gms.local_address());
                            break;
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    /// Join the cluster.
    ///
    /// Returns once a view containing this node is installed, either by
    /// joining an existing coordinator or by bootstrapping a singleton.
    pub async fn connect(&self) -> GmsResult<()> {
        if self.is_operational() {
            return Err(GmsError::AlreadyConnected);
        }
        self.start()?;

        let client = match &*self.role() {
            Role::Client(client) if client.is_leaving() => self.become_client(),
            Role::Client(client) => client.clone(),
            _ => return Err(GmsError::AlreadyConnected),
        };

        info!("{}: connecting (incarnation {})", self.inner.local, self.inner.incarnation);
        client.join(self).await?;
        info!(
            "{}: connected as {} in view {}",
            self.inner.local,
            self.role_kind(),
            self.view_id().map(|v| v.to_string()).unwrap_or_default()
        );
        Ok(())
    }

    /// Leave the cluster and reset to the client role.
    ///
    /// The leave is acknowledged within bounded waits; local state is reset
    /// whatever the outcome.
    pub async fn disconnect(&self) -> GmsResult<()> {
        if let Role::Client(client) = &*self.role() {
            client.leave();
            return Err(GmsError::NotConnected);
        }

        info!("{}: disconnecting", self.inner.local);
        self.role().leave(self, self.inner.local).await;
        self.reset_state();
        self.inner.transport.disconnected().await;
        info!("{}: disconnected", self.inner.local);
        Ok(())
    }

    /// Stop the dispatcher and any background role tasks
    pub async fn shutdown(&self) {
        self.role().stop();
        self.inner.shutdown.cancel();
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("{}: dispatcher ended abnormally: {}", self.inner.local, e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Local address
    pub fn local_address(&self) -> Address {
        self.inner.local
    }

    /// Incarnation id of this process
    pub fn incarnation(&self) -> Uuid {
        self.inner.incarnation
    }

    /// Sub-group this node belongs to
    pub fn subgroup(&self) -> &str {
        &self.inner.subgroup
    }

    /// Configuration
    pub fn config(&self) -> &GmsConfig {
        &self.inner.config
    }

    /// Installed view
    pub fn view(&self) -> Option<View> {
        self.inner.state.read().view.clone()
    }

    /// Installed view id
    pub fn view_id(&self) -> Option<ViewId> {
        self.inner.state.read().view_id
    }

    /// Installed members
    pub fn members(&self) -> Membership {
        self.inner.state.read().members.clone()
    }

    /// Whether the address is an installed member
    pub fn is_member(&self, member: &Address) -> bool {
        self.inner.state.read().members.contains(member)
    }

    /// Coordinator of the installed view: its lowest address
    pub fn coordinator(&self) -> Option<Address> {
        self.determine_coordinator()
    }

    /// Whether this node is coordinator
    pub fn is_coordinator(&self) -> bool {
        self.role_kind() == RoleKind::Coordinator
    }

    /// Current role
    pub fn role_kind(&self) -> RoleKind {
        self.inner.role.load().kind()
    }

    /// Whether the node holds an installed view
    pub fn is_operational(&self) -> bool {
        self.inner.operational.load(Ordering::Acquire)
    }

    /// Answer to a discovery request from another node
    pub fn ping_response(&self) -> PingResponse {
        match self.determine_coordinator() {
            Some(coord) if self.is_operational() => PingResponse::joined(self.inner.local, coord),
            _ => PingResponse::joining(self.inner.local),
        }
    }

    pub(crate) fn role(&self) -> Arc<Role> {
        self.inner.role.load_full()
    }

    pub(crate) fn policy(&self) -> &dyn TopologyPolicy {
        self.inner.policy.as_ref()
    }

    /// First member of the sorted installed membership, or `None` when empty
    pub(crate) fn determine_coordinator(&self) -> Option<Address> {
        self.inner.state.read().members.first().copied()
    }

    pub(crate) fn incarnation_of(&self, member: &Address) -> Option<Uuid> {
        self.inner.state.read().incarnations.get(member).copied()
    }

    pub(crate) fn subgroup_of(&self, member: &Address) -> Option<String> {
        self.inner.state.read().member_subgroups.get(member).cloned()
    }

    // ---------------------------------------------------------------------
    // Role switching
    // ---------------------------------------------------------------------

    pub(crate) fn become_client(&self) -> Arc<ClientRole> {
        let client = Arc::new(ClientRole::new());
        self.switch_role(Role::Client(client.clone()));
        client
    }

    pub(crate) fn become_participant(&self) -> Arc<ParticipantRole> {
        if let Role::Participant(p) = &*self.role() {
            return p.clone();
        }
        let participant = Arc::new(ParticipantRole::new());
        self.switch_role(Role::Participant(participant.clone()));
        participant
    }

    pub(crate) fn become_coordinator(&self) -> Arc<CoordinatorRole> {
        if let Role::Coordinator(c) = &*self.role() {
            return c.clone();
        }
        let coordinator = Arc::new(CoordinatorRole::new());
        self.switch_role(Role::Coordinator(coordinator.clone()));
        coordinator
    }

    fn switch_role(&self, role: Role) {
        let new_kind = role.kind();
        let old = self.inner.role.swap(Arc::new(role));
        old.stop();
        if old.kind() != new_kind {
            info!("{}: {} -> {}", self.inner.local, old.kind(), new_kind);
        }
    }

    // ---------------------------------------------------------------------
    // Messaging
    // ---------------------------------------------------------------------

    pub(crate) async fn send(&self, dest: &Address, header: GmsHeader) {
        let type_name = header.type_name();
        if let Err(e) = self.inner.transport.send(dest, header).await {
            error!("{}: failed to send {} to {}: {}", self.inner.local, type_name, dest, e);
        }
    }

    pub(crate) async fn multicast(&self, dests: &[Address], header: GmsHeader) {
        if dests.is_empty() {
            return;
        }
        let type_name = header.type_name();
        if let Err(e) = self.inner.transport.multicast(dests, header).await {
            error!(
                "{}: failed to multicast {} to {} members: {}",
                self.inner.local,
                type_name,
                dests.len(),
                e
            );
        }
    }

    /// Discovery responses from other started nodes; empty on failure
    pub(crate) async fn find_initial_members(&self) -> Vec<PingResponse> {
        let local = self.inner.local;
        let timeout = self.inner.config.discovery_timeout;
        match within("discovery", timeout, self.inner.transport.find_initial_members()).await {
            Ok(responses) => responses
                .into_iter()
                .filter(|r| r.is_started && r.own_address != local)
                .collect(),
            Err(e) => {
                warn!("{}: discovery failed: {}", local, e);
                Vec::new()
            }
        }
    }

    /// Whether `suspect` is really gone according to the transport's probe.
    ///
    /// With `match_incarnation`, a node whose incarnation changed during the
    /// probe is not reported dead: the old instance was already replaced.
    pub(crate) async fn verify_suspect(&self, suspect: &Address, match_incarnation: bool) -> bool {
        let before = self.incarnation_of(suspect);
        let status = self.inner.transport.node_status(suspect).await;
        debug!("{}: {} probed as {:?}", self.inner.local, suspect, status);
        if !status.is_gone() {
            return false;
        }
        if match_incarnation {
            return before == self.incarnation_of(suspect);
        }
        true
    }

    // ---------------------------------------------------------------------
    // Digest
    // ---------------------------------------------------------------------

    /// Ask the application for its digest, `None` on timeout or failure
    pub(crate) async fn fetch_digest(&self) -> Option<Digest> {
        let _guard = self.inner.digest_lock.lock().await;
        let timeout = self.inner.config.digest_timeout;
        match within("digest fetch", timeout, self.inner.application.get_digest()).await {
            Ok(digest) => digest,
            Err(e) if e.is_transient() => {
                warn!("{}: {}", self.inner.local, e);
                None
            }
            Err(e) => {
                error!("{}: failed to fetch digest: {}", self.inner.local, e);
                None
            }
        }
    }

    pub(crate) async fn set_digest(&self, digest: Digest) {
        if let Err(e) = self.inner.application.set_digest(digest).await {
            error!("{}: failed to set digest: {}", self.inner.local, e);
        }
    }

    pub(crate) async fn merge_digest(&self, digest: Digest) {
        if let Err(e) = self.inner.application.merge_digest(digest).await {
            error!("{}: failed to merge digest: {}", self.inner.local, e);
        }
    }

    /// Key distribution for a new membership, `None` after bounded retries
    pub(crate) async fn acquire_hash_distribution(
        &self,
        members: &[Address],
        is_joining: bool,
        subgroup: &str,
    ) -> Option<HashDistribution> {
        let config = &self.inner.config;
        for attempt in 1..=config.hash_distribution_attempts {
            let request = self
                .inner
                .application
                .get_hash_distribution(members, is_joining, subgroup);
            match within("hash distribution", config.hash_distribution_timeout, request).await {
                Ok(distribution) => return distribution,
                Err(e) => warn!(
                    "{}: hash distribution attempt {} failed: {}",
                    self.inner.local, attempt, e
                ),
            }
        }
        warn!("{}: proceeding without hash distribution", self.inner.local);
        None
    }

    // ---------------------------------------------------------------------
    // Member bookkeeping
    // ---------------------------------------------------------------------

    /// Record a member's sub-group and incarnation ahead of its view
    pub(crate) fn register_member(&self, member: Address, subgroup: &str, incarnation: Uuid) {
        let mut state = self.inner.state.write();
        state.add_to_subgroup(member, subgroup);
        state.incarnations.insert(member, incarnation);
    }

    /// Drop a member from the sub-group tables ahead of its removal
    pub(crate) fn forget_member(&self, member: &Address) {
        self.inner.state.write().remove_from_subgroup(member);
    }

    // ---------------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------------

    /// Compute the next view from the pending membership.
    ///
    /// Bumps the logical clock and records the change as pending so that
    /// overlapping decisions build on each other. The membership is sorted,
    /// so the lowest address coordinates the next view. Returns `None`
    /// before the first view is installed.
    pub(crate) fn get_next_view(
        &self,
        new_members: &[Address],
        old_members: &[Address],
        suspected: &[Address],
    ) -> Option<View> {
        let mut state = self.inner.state.write();
        let current = state.view_id?;

        let vid = current.id().max(state.ltime) + 1;
        state.ltime = vid;

        let mut members = state.tmp_members.clone();
        members.remove_all(suspected);
        members.remove_all(old_members);
        members.add_all(new_members.iter().copied());
        members.sort();
        state.tmp_members.set(&members);

        for member in new_members {
            if !state.joining.contains(member) {
                state.joining.push(*member);
            }
        }
        for member in old_members.iter().chain(suspected) {
            if !state.leaving.contains(member) {
                state.leaving.push(*member);
            }
        }

        let mut view = View::new(ViewId::new(self.inner.local, vid), members);
        view.sequencer_table = state.sequencer_table.clone();
        view.member_subgroups = state.member_subgroups.clone();
        view.incarnations = state
            .incarnations
            .iter()
            .filter(|(m, _)| view.contains(m))
            .map(|(m, id)| (*m, *id))
            .collect();
        view.coordinator_incarnation = match view.coordinator() {
            Some(coord) if *coord == self.inner.local => Some(self.inner.incarnation),
            Some(coord) => view.incarnations.get(coord).copied(),
            None => None,
        };
        Some(view)
    }

    /// Compute and broadcast the next view, returning whether every
    /// recipient acknowledged it
    pub(crate) async fn cast_view_change(
        &self,
        new_members: &[Address],
        old_members: &[Address],
        suspected: &[Address],
        distribution: Option<HashDistribution>,
    ) -> bool {
        let Some(mut view) = self.get_next_view(new_members, old_members, suspected) else {
            warn!("{}: no installed view to build on", self.inner.local);
            return false;
        };
        view.distribution = distribution;
        self.broadcast_view(view, None, None).await
    }

    /// Send a view to its recipients and wait for their acknowledgements.
    ///
    /// Recipients default to the view's members. A broadcast that is not
    /// fully acknowledged within the timeout is repeated once.
    pub(crate) async fn broadcast_view(
        &self,
        view: View,
        digest: Option<Digest>,
        dests: Option<Vec<Address>>,
    ) -> bool {
        let local = self.inner.local;
        let dests = dests.unwrap_or_else(|| view.members().members().to_vec());
        let vid = *view.vid();
        let timeout = self.inner.config.view_ack_timeout;

        let promise = Arc::new(Promise::with_expected(dests.len()));
        self.inner.view_acks.insert(vid, promise.clone());

        info!("{}: broadcasting view {} to {} members", local, view, dests.len());
        let header = GmsHeader::View { view, digest };

        let mut acknowledged = false;
        for attempt in 1..=2 {
            self.multicast(&dests, header.clone()).await;
            if promise.wait_all(timeout).await {
                acknowledged = true;
                break;
            }
            let acked = promise.results();
            let missing: Vec<&Address> = dests.iter().filter(|d| !acked.contains(d)).collect();
            warn!(
                "{}: view {} attempt {} missing acknowledgements from {:?}",
                local, vid, attempt, missing
            );
        }

        self.inner.view_acks.remove(&vid);
        acknowledged
    }

    /// Accept a new view. Every role installs views through here.
    pub(crate) async fn install_view(
        &self,
        view: View,
        digest: Option<Digest>,
        sender: Option<Address>,
    ) -> InstallOutcome {
        let _install = self.inner.install_lock.lock().await;
        let local = self.inner.local;

        if let Some(digest) = digest {
            self.merge_digest(digest).await;
        }

        let (current_vid, current_coord, former_member) = {
            let state = self.inner.state.read();
            (
                state.view_id,
                state.members.first().copied(),
                state.prev_members.contains(&local),
            )
        };

        if let Some(current) = current_vid {
            if *view.vid() <= current && !view.force_install {
                debug!(
                    "{}: discarding view {} (current is {})",
                    local,
                    view.vid(),
                    current
                );
                if let Some(sender) = sender {
                    let foreign = sender != local
                        && Some(sender) != current_coord
                        && view.coordinator() == Some(&sender);
                    if foreign {
                        debug!(
                            "{}: telling {} its view {} is stale here",
                            local,
                            sender,
                            view.vid()
                        );
                        self.send(&sender, GmsHeader::ViewRejected { member: local })
                            .await;
                    }
                }
                return InstallOutcome::Stale;
            }
        }

        if !view.contains(&local) {
            warn!("{}: view {} does not include this node", local, view);
            if !former_member || self.role().is_leaving() {
                return InstallOutcome::NotIncluded;
            }
            if let Some(sender) = sender.filter(|s| *s != local) {
                self.send(&sender, GmsHeader::ViewRejected { member: local })
                    .await;
            }
            if self.inner.config.leave_on_exclusion {
                warn!("{}: excluded from the cluster, resetting", local);
                self.reset_state();
                self.inner.transport.disconnected().await;
                self.inner.application.on_excluded(&view).await;
            }
            return InstallOutcome::NotIncluded;
        }

        if current_vid.is_some() && !view.force_install {
            if let (Some(current_coord), Some(new_coord)) = (current_coord, view.coordinator().copied())
            {
                let broadcaster = sender.unwrap_or(*view.creator());
                if current_coord != new_coord
                    && new_coord != local
                    && broadcaster != current_coord
                    && !self.inner.policy.accepts_coordinator(&local, &new_coord)
                    && !self.verify_suspect(&current_coord, true).await
                {
                    warn!(
                        "{}: rejecting view {} from {}: coordinator {} is still alive",
                        local,
                        view.vid(),
                        broadcaster,
                        current_coord
                    );
                    self.send(&broadcaster, GmsHeader::ViewRejected { member: local })
                        .await;
                    return InstallOutcome::Rejected;
                }
            }
        }

        let unchanged = {
            let mut state = self.inner.state.write();
            state.ltime = state.ltime.max(view.vid().id());

            let same_creator = state
                .view
                .as_ref()
                .is_some_and(|v| v.creator() == view.creator());
            if same_creator && state.members == *view.members() {
                state.view_id = Some(*view.vid());
                state.view = Some(view.clone());
                state.joining.retain(|m| !view.contains(m));
                state.leaving.retain(|m| view.contains(m));
                true
            } else {
                self.apply_view(&mut state, &view);
                false
            }
        };

        if unchanged {
            debug!("{}: view {} only advanced the id", local, view.vid());
            return InstallOutcome::Unchanged;
        }

        match (self.role_kind(), view.coordinator() == Some(&local)) {
            (RoleKind::Coordinator, true) | (RoleKind::Participant, false) => {}
            (_, true) => {
                self.become_coordinator();
            }
            (_, false) => {
                self.become_participant();
            }
        }
        self.inner.operational.store(true, Ordering::Release);
        self.mark_state_transfer_in_process();

        info!("{}: installed view {}", local, view);
        self.inner.transport.view_installed(&view).await;
        self.inner.application.on_view_changed(view).await;
        InstallOutcome::Installed
    }

    fn apply_view(&self, state: &mut MembershipState, view: &View) {
        state.view_id = Some(*view.vid());
        state.sequencer_table = view.sequencer_table.clone();
        state.member_subgroups = view.member_subgroups.clone();

        state.incarnations.retain(|m, _| view.contains(m));
        for (member, incarnation) in &view.incarnations {
            state.incarnations.insert(*member, *incarnation);
        }

        state.members.set(view.members());
        state.joining.retain(|m| !view.contains(m));
        state.leaving.retain(|m| view.contains(m));

        let mut pending = view.members().clone();
        pending.add_all(state.joining.iter().copied());
        pending.remove_all(&state.leaving);
        pending.sort();
        state.tmp_members = pending;

        for member in view.members().iter() {
            if !state.prev_members.contains(member) {
                state.prev_members.push_back(*member);
            }
        }
        while state.prev_members.len() > self.inner.config.num_prev_members {
            state.prev_members.pop_front();
        }

        state.view = Some(view.clone());
    }

    /// Bootstrap a cluster with this node as its only member
    pub(crate) async fn become_singleton(&self) {
        let local = self.inner.local;
        let mut digest = Digest::new(1);
        digest.add(local, 0, 0);

        let mut view = View::new(ViewId::new(local, 0), Membership::from_members([local]));
        view.coordinator_incarnation = Some(self.inner.incarnation);
        view.incarnations.insert(local, self.inner.incarnation);
        view.sequencer_table
            .insert(self.inner.subgroup.clone(), vec![local]);
        view.member_subgroups.insert(local, self.inner.subgroup.clone());

        info!("{}: starting singleton cluster", local);
        self.set_digest(digest).await;
        self.install_view(view, None, Some(local)).await;
    }

    /// Drop all membership state and return to the client role
    pub(crate) fn reset_state(&self) {
        self.become_client();
        {
            let mut state = self.inner.state.write();
            let ltime = state.ltime;
            let prev_members = std::mem::take(&mut state.prev_members);
            *state = MembershipState {
                ltime,
                prev_members,
                ..MembershipState::default()
            };
        }
        self.inner.view_acks.clear();
        self.inner.operational.store(false, Ordering::Release);
    }

    // ---------------------------------------------------------------------
    // State transfer
    // ---------------------------------------------------------------------

    /// Mark this node as receiving state from the cluster
    pub fn mark_state_transfer_in_process(&self) {
        self.inner.state_transfer.lock().since = Some(Instant::now());
    }

    /// The application finished receiving state
    pub fn mark_state_transfer_completed(&self) {
        self.inner.state_transfer.lock().since = None;
    }

    /// Whether this node is receiving state, ignoring stale marks
    pub fn is_in_state_transfer(&self) -> bool {
        let mut mark = self.inner.state_transfer.lock();
        match mark.since {
            Some(since) if since.elapsed() < self.inner.config.state_transfer_expiry => true,
            Some(_) => {
                mark.since = None;
                false
            }
            None => false,
        }
    }

    /// Whether this node or any other member is receiving state
    pub async fn is_cluster_in_state_transfer(&self) -> bool {
        if self.is_in_state_transfer() {
            return true;
        }

        let local = self.inner.local;
        let others: Vec<Address> = self
            .members()
            .into_iter()
            .filter(|m| *m != local)
            .collect();
        if others.is_empty() {
            return false;
        }

        let promise = Arc::new(Promise::with_expected(others.len()));
        *self.inner.state_transfer_query.lock() = Some(promise.clone());
        self.multicast(&others, GmsHeader::IsNodeInStateTransfer).await;
        promise
            .wait_all(self.inner.config.state_transfer_query_timeout)
            .await;
        *self.inner.state_transfer_query.lock() = None;

        promise.results().into_iter().any(|in_transfer| in_transfer)
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    async fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(msg) => self.handle_message(msg).await,
            TransportEvent::Suspect(member) => {
                let gms = self.clone();
                tokio::spawn(async move { gms.role().handle_suspect(&gms, member).await });
            }
            TransportEvent::Unsuspect(member) => self.role().handle_unsuspect(&member),
            TransportEvent::Merge(coordinators) => {
                self.role().handle_merge(self, coordinators).await;
            }
            TransportEvent::ConnectionBroken(suspected) => {
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.role()
                        .handle_connection_broken_event(&gms, suspected)
                        .await
                });
            }
            TransportEvent::ConnectionFailure(nodes) => {
                let gms = self.clone();
                tokio::spawn(async move { gms.role().handle_connection_failure(&gms, nodes).await });
            }
            TransportEvent::NodeRejoining(node) => {
                let gms = self.clone();
                tokio::spawn(async move { gms.role().handle_node_rejoining(&gms, node).await });
            }
        }
    }

    async fn handle_message(&self, msg: GmsMessage) {
        let GmsMessage { src, header } = msg;
        debug!("{}: received {} from {}", self.inner.local, header, src);

        match header {
            GmsHeader::JoinRequest {
                member,
                subgroup,
                incarnation,
            } => {
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.handle_join_request(src, member, subgroup, incarnation)
                        .await
                });
            }
            GmsHeader::JoinResponse(rsp) => self.role().handle_join_response(rsp),
            GmsHeader::LeaveRequest { member } => {
                let gms = self.clone();
                tokio::spawn(async move { gms.handle_leave_request(member).await });
            }
            GmsHeader::LeaveResponse => self.role().handle_leave_response(),
            GmsHeader::View { view, digest } => {
                self.send(&src, GmsHeader::ViewAck { view_id: *view.vid() })
                    .await;
                self.role()
                    .handle_view_change(self, view, digest, src)
                    .await;
            }
            GmsHeader::ViewAck { view_id } => self.handle_view_ack(src, view_id),
            GmsHeader::MergeRequest { merge_id } => {
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.role()
                        .handle_merge_request(&gms, src, merge_id)
                        .await
                });
            }
            GmsHeader::MergeResponse { merge_id, data } => {
                self.role().handle_merge_response(data, merge_id)
            }
            GmsHeader::InstallMergeView {
                merge_id,
                view,
                digest,
            } => {
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.role()
                        .handle_merge_view(&gms, merge_id, view, digest)
                        .await
                });
            }
            GmsHeader::CancelMerge { merge_id } => self.role().handle_merge_cancelled(merge_id),
            GmsHeader::ViewRejected { member } => {
                let gms = self.clone();
                tokio::spawn(async move { gms.role().handle_view_rejected(&gms, member).await });
            }
            GmsHeader::CanNotConnectTo { nodes } => {
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.role()
                        .handle_can_not_connect_to(&gms, src, nodes)
                        .await
                });
            }
            GmsHeader::LeaveCluster { incarnation } => {
                if incarnation != self.inner.incarnation {
                    debug!(
                        "{}: ignoring leave-cluster request for incarnation {}",
                        self.inner.local, incarnation
                    );
                    return;
                }
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.role()
                        .handle_leave_cluster_request(&gms, src)
                        .await
                });
            }
            GmsHeader::ConnectionBroken { suspected } => {
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.role()
                        .handle_connection_broken(&gms, src, suspected)
                        .await
                });
            }
            GmsHeader::InformNodeRejoining { node } => {
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.role()
                        .handle_inform_node_rejoining(&gms, src, node)
                        .await
                });
            }
            GmsHeader::ResetOnNodeRejoining { node, view } => {
                self.handle_reset_on_node_rejoining(src, node, view).await
            }
            GmsHeader::InformAboutNodeDeath { dead } => {
                let gms = self.clone();
                tokio::spawn(async move {
                    gms.role()
                        .handle_inform_about_node_death(&gms, src, dead)
                        .await
                });
            }
            GmsHeader::IsNodeInStateTransfer => {
                let in_state_transfer = self.is_in_state_transfer();
                self.send(
                    &src,
                    GmsHeader::IsNodeInStateTransferResponse { in_state_transfer },
                )
                .await;
            }
            GmsHeader::IsNodeInStateTransferResponse { in_state_transfer } => {
                let query = self.inner.state_transfer_query.lock().clone();
                if let Some(promise) = query {
                    promise.set_result(in_state_transfer);
                }
            }
        }
    }

    fn handle_view_ack(&self, src: Address, view_id: ViewId) {
        match self.inner.view_acks.get(&view_id) {
            Some(promise) => {
                promise.set_result_if_absent(src);
            }
            None => debug!(
                "{}: late acknowledgement of view {} from {}",
                self.inner.local, view_id, src
            ),
        }
    }

    /// Admit a joiner, serialized against other joins and leaves
    async fn handle_join_request(
        &self,
        src: Address,
        member: Address,
        subgroup: String,
        incarnation: Uuid,
    ) {
        let role = self.role();
        let Role::Coordinator(coordinator) = &*role else {
            debug!(
                "{}: not coordinator, ignoring join request from {}",
                self.inner.local, member
            );
            return;
        };

        let busy = {
            let mut guard = self.inner.change_guard.lock();
            let busy = guard.join_in_progress || guard.leave_in_progress;
            if !busy {
                guard.join_in_progress = true;
            }
            busy
        };
        if busy {
            debug!(
                "{}: membership change in progress, deferring {}",
                self.inner.local, member
            );
            self.send(&src, GmsHeader::JoinResponse(JoinResponse::change_in_progress()))
                .await;
            return;
        }

        self.process_join(coordinator, src, member, &subgroup, incarnation)
            .await;

        self.inner.change_guard.lock().join_in_progress = false;
    }

    async fn process_join(
        &self,
        coordinator: &Arc<CoordinatorRole>,
        src: Address,
        member: Address,
        subgroup: &str,
        incarnation: Uuid,
    ) {
        if self.inner.policy.gates_joins_on_state_transfer()
            && self.is_cluster_in_state_transfer().await
        {
            info!(
                "{}: cluster in state transfer, deferring {}",
                self.inner.local, member
            );
            self.send(&src, GmsHeader::JoinResponse(JoinResponse::change_in_progress()))
                .await;
            return;
        }

        if self.is_member(&member) {
            if let Some(known) = self.incarnation_of(&member) {
                if known != incarnation {
                    warn!(
                        "{}: {} rejoined with incarnation {} (was {}), evicting the old one",
                        self.inner.local, member, incarnation, known
                    );
                    self.send(&src, GmsHeader::JoinResponse(JoinResponse::change_in_progress()))
                        .await;
                    coordinator.handle_suspect(self, member).await;
                    return;
                }
            }
        }

        match coordinator.handle_join(self, member, subgroup, incarnation).await {
            None => {
                self.send(&src, GmsHeader::JoinResponse(JoinResponse::change_in_progress()))
                    .await;
            }
            Some(JoinDecision::Reply(rsp)) => {
                self.send(&src, GmsHeader::JoinResponse(rsp)).await;
            }
            Some(JoinDecision::Admitted(mut rsp)) => {
                let Some(view) = rsp.view.as_mut() else {
                    return;
                };
                view.distribution = self
                    .acquire_hash_distribution(view.members().members(), true, subgroup)
                    .await;
                let view = view.clone();

                coordinator.remember_admission(member, incarnation, rsp.clone());
                self.send(&src, GmsHeader::JoinResponse(rsp)).await;
                self.broadcast_view(view, None, None).await;
            }
        }
    }

    /// Remove a leaving member, serialized against joins
    async fn handle_leave_request(&self, member: Address) {
        let role = self.role();
        let Role::Coordinator(coordinator) = &*role else {
            debug!(
                "{}: not coordinator, ignoring leave request from {}",
                self.inner.local, member
            );
            return;
        };

        self.inner.change_guard.lock().leave_in_progress = true;
        coordinator.handle_leave(self, member, false).await;
        self.inner.change_guard.lock().leave_in_progress = false;
    }

    async fn handle_reset_on_node_rejoining(&self, src: Address, node: Address, view: View) {
        let adopted = {
            let mut state = self.inner.state.write();
            match state.view_id {
                Some(current) if *view.vid() > current => {
                    state.view_id = Some(*view.vid());
                    state.ltime = state.ltime.max(view.vid().id());
                    true
                }
                _ => false,
            }
        };

        if adopted {
            info!(
                "{}: {} rejoined, sequencing reset to {} by {}",
                self.inner.local,
                node,
                view.vid(),
                src
            );
            self.inner.application.reset_sequence(view.vid()).await;
        }
    }
}

/// Await a collaborator call for at most `timeout`
pub(crate) async fn within<F, R>(
    operation: &'static str,
    timeout: Duration,
    request: F,
) -> GmsResult<R>
where
    F: Future<Output = GmsResult<R>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(GmsError::Timeout { operation, timeout }),
    }
}

/// What the coordinator decided about a join request
pub(crate) enum JoinDecision {
    /// Answer without a membership change
    Reply(JoinResponse),
    /// The member was admitted; the view must be broadcast
    Admitted(JoinResponse),
}

#[cfg(test)]
mod tests;
