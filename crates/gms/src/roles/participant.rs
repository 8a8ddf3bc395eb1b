//! Ordinary member role

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::digest::Digest;
use crate::gms::Gms;
use crate::messages::GmsHeader;
use crate::promise::Promise;
use crate::transport::{Application, GmsTransport};
use crate::view::View;

/// Role of a member that is not the coordinator
pub struct ParticipantRole {
    suspected: Mutex<Vec<Address>>,
    leave_promise: Promise<()>,
    leaving: AtomicBool,
    verifying_deaths: AtomicBool,
}

impl ParticipantRole {
    pub(crate) fn new() -> Self {
        Self {
            suspected: Mutex::new(Vec::new()),
            leave_promise: Promise::new(),
            leaving: AtomicBool::new(false),
            verifying_deaths: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::Acquire)
    }

    /// Members currently suspected by this node
    pub fn suspected(&self) -> Vec<Address> {
        self.suspected.lock().clone()
    }

    /// Ask the coordinator to remove `member`, then fall back to client.
    ///
    /// Tries up to `leave_attempts` coordinators, skipping those that did
    /// not answer. If this node turns out to be first in line it handles
    /// its own leave as coordinator.
    pub(crate) async fn leave<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        let config = gms.config();
        self.leaving.store(true, Ordering::Release);

        let mut tried: Vec<Address> = Vec::new();
        for attempt in 1..=config.leave_attempts {
            let candidate = gms
                .members()
                .iter()
                .find(|m| !tried.contains(m))
                .copied();
            let Some(coord) = candidate else {
                warn!("{}: no coordinator left to ask for leave", local);
                break;
            };

            if coord == local {
                info!("{}: first in line, handling own leave as coordinator", local);
                let coordinator = gms.become_coordinator();
                coordinator.leave(gms, member).await;
                break;
            }

            self.leave_promise.reset(1);
            gms.send(&coord, GmsHeader::LeaveRequest { member }).await;
            if self
                .leave_promise
                .wait_result(config.leave_timeout)
                .await
                .is_some()
            {
                debug!("{}: leave acknowledged by {}", local, coord);
                break;
            }
            warn!(
                "{}: leave attempt {} not acknowledged by {}",
                local, attempt, coord
            );
            tried.push(coord);
        }

        gms.become_client();
    }

    pub(crate) fn handle_leave_response(&self) {
        self.leave_promise.set_result(());
    }

    /// Suspect a member.
    ///
    /// If removing every suspect makes this node first in line it takes
    /// over as coordinator and evicts them; otherwise it reports the broken
    /// connection to the member that should act.
    pub(crate) async fn handle_suspect<T, A>(&self, gms: &Gms<T, A>, member: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        if member == local {
            warn!("{}: ignoring suspicion of self", local);
            return;
        }

        let members = gms.members();
        if !members.contains(&member) {
            debug!("{}: suspected {} is not a member", local, member);
            return;
        }

        let group = gms.policy().removal_group(&members, &member, &local);
        {
            let mut suspected = self.suspected.lock();
            for m in group {
                if !suspected.contains(&m) {
                    suspected.push(m);
                }
            }
        }
        debug!("{}: suspecting {:?}", local, self.suspected());

        if self.is_leaving() {
            return;
        }

        let next_in_line = {
            let suspected = self.suspected.lock();
            members.iter().find(|m| !suspected.contains(m)).copied()
        };

        match next_in_line {
            Some(next) if next == local => {
                let suspects = std::mem::take(&mut *self.suspected.lock());
                info!(
                    "{}: taking over as coordinator, evicting {:?}",
                    local, suspects
                );
                gms.become_coordinator();
                for suspect in &suspects {
                    gms.forget_member(suspect);
                }
                gms.cast_view_change(&[], &[], &suspects, None).await;
            }
            Some(next) => {
                debug!(
                    "{}: reporting broken connection to {} to {}",
                    local, member, next
                );
                gms.send(&next, GmsHeader::ConnectionBroken { suspected: member })
                    .await;
            }
            None => warn!("{}: every member is suspected", local),
        }
    }

    pub(crate) fn handle_unsuspect(&self, member: &Address) {
        self.suspected.lock().retain(|m| m != member);
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
        self.suspected.lock().clear();
        if self.is_leaving() && !view.contains(&gms.local_address()) {
            debug!(
                "{}: leaving, ignoring view {} that excludes this node",
                gms.local_address(),
                view.vid()
            );
            return;
        }
        gms.install_view(view, digest, Some(sender)).await;
    }

    /// The transport lost its connection to `suspected`
    pub(crate) async fn report_connection_broken<T, A>(&self, gms: &Gms<T, A>, suspected: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        if let Some(coord) = gms.coordinator() {
            gms.send(&coord, GmsHeader::ConnectionBroken { suspected })
                .await;
        }
    }

    /// Connections to `nodes` could not be established
    pub(crate) async fn handle_connection_failure<T, A>(&self, gms: &Gms<T, A>, nodes: Vec<Address>)
    where
        T: GmsTransport,
        A: Application,
    {
        if let Some(coord) = gms.coordinator() {
            gms.send(&coord, GmsHeader::CanNotConnectTo { nodes }).await;
        }
    }

    /// Verify a reported death before suspecting anyone.
    ///
    /// Probes the members ahead of this node in order until one is alive;
    /// the dead ones are suspected unless their incarnation changed while
    /// probing. Only one verification pass runs at a time.
    pub(crate) async fn handle_inform_about_node_death<T, A>(
        &self,
        gms: &Gms<T, A>,
        sender: Address,
        dead: Address,
    ) where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        if self
            .verifying_deaths
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("{}: death verification already running", local);
            return;
        }

        if gms.is_member(&dead) {
            info!("{}: {} reports {} dead, verifying", local, sender, dead);
            let mut confirmed = Vec::new();
            for member in gms.members().iter() {
                if *member == local {
                    break;
                }
                let before = gms.incarnation_of(member);
                if gms.verify_suspect(member, false).await {
                    confirmed.push((*member, before));
                } else {
                    break;
                }
            }

            for (member, before) in confirmed {
                if gms.incarnation_of(&member) == before {
                    self.handle_suspect(gms, member).await;
                }
            }
        }

        self.verifying_deaths.store(false, Ordering::Release);
    }

    /// The coordinator asked this node to split off into its own cluster
    pub(crate) async fn handle_leave_cluster_request<T, A>(&self, gms: &Gms<T, A>, sender: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        if gms.coordinator() != Some(sender) {
            warn!(
                "{}: ignoring leave-cluster request from non-coordinator {}",
                local, sender
            );
            return;
        }

        let others: Vec<Address> = gms.members().into_iter().filter(|m| *m != local).collect();
        info!(
            "{}: asked by {} to leave, forming own cluster without {:?}",
            local, sender, others
        );
        gms.become_coordinator();
        for member in &others {
            gms.forget_member(member);
        }
        gms.cast_view_change(&[], &[], &others, None).await;
    }

    /// Tell the coordinator a member is coming back
    pub(crate) async fn handle_node_rejoining<T, A>(&self, gms: &Gms<T, A>, node: Address)
    where
        T: GmsTransport,
        A: Application,
    {
        if !gms.is_member(&node) {
            return;
        }
        if let Some(coord) = gms.coordinator() {
            gms.send(&coord, GmsHeader::InformNodeRejoining { node })
                .await;
        }
    }
}
