//! Joining role

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::address::Address;
use crate::discovery::{self, PingResponse};
use crate::error::{GmsError, GmsResult};
use crate::gms::{Gms, InstallOutcome};
use crate::messages::{GmsHeader, JoinResponse, JoinResult};
use crate::promise::Promise;
use crate::transport::{Application, GmsTransport};

/// Role of a node that is not yet a member
pub struct ClientRole {
    join_promise: Promise<JoinResponse>,
    leaving: AtomicBool,
}

/// What a join round concluded
enum Round {
    /// A view was installed
    Joined,
    /// Try again, counting the round against `candidate`
    Retry { candidate: Option<Address> },
    /// Try again without counting the round
    Backoff,
    /// Give up on joining and start a singleton cluster
    Singleton,
}

impl ClientRole {
    pub(crate) fn new() -> Self {
        Self {
            join_promise: Promise::new(),
            leaving: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::Acquire)
    }

    /// Stop a join loop in progress
    pub(crate) fn leave(&self) {
        self.leaving.store(true, Ordering::Release);
    }

    pub(crate) fn stop(&self) {
        self.leave();
    }

    pub(crate) fn handle_join_response(&self, rsp: JoinResponse) {
        self.join_promise.set_result(rsp);
    }

    /// Join an existing cluster or bootstrap a new one.
    ///
    /// Rounds that make no progress against the same candidate coordinator
    /// are counted; after `join_retry_count` of them the node starts its own
    /// cluster, or fails with [`GmsError::ClusterUnreachable`] when singleton
    /// bootstrap is disabled.
    pub(crate) async fn join<T, A>(&self, gms: &Gms<T, A>) -> GmsResult<()>
    where
        T: GmsTransport,
        A: Application,
    {
        let config = gms.config().clone();
        let mut attempts = 0u32;
        let mut last_candidate: Option<Address> = None;

        loop {
            if self.is_leaving() {
                return Err(GmsError::JoinCancelled);
            }

            let round = self.join_round(gms).await;
            let candidate = match round {
                Round::Joined => return Ok(()),
                Round::Singleton => {
                    if config.disable_initial_coordinator {
                        tokio::time::sleep(config.join_retry_timeout).await;
                        attempts += 1;
                        if attempts >= config.join_retry_count {
                            return Err(GmsError::ClusterUnreachable { attempts });
                        }
                        continue;
                    }
                    gms.become_singleton().await;
                    return Ok(());
                }
                Round::Backoff => {
                    tokio::time::sleep(config.join_retry_timeout).await;
                    continue;
                }
                Round::Retry { candidate } => candidate,
            };

            if candidate != last_candidate {
                attempts = 0;
                last_candidate = candidate;
            }
            attempts += 1;

            if attempts >= config.join_retry_count {
                if config.disable_initial_coordinator {
                    warn!(
                        "{}: giving up after {} join attempts",
                        gms.local_address(),
                        attempts
                    );
                    return Err(GmsError::ClusterUnreachable { attempts });
                }
                warn!(
                    "{}: no progress after {} join attempts, starting own cluster",
                    gms.local_address(),
                    attempts
                );
                gms.become_singleton().await;
                return Ok(());
            }

            tokio::time::sleep(config.join_retry_timeout).await;
        }
    }

    async fn join_round<T, A>(&self, gms: &Gms<T, A>) -> Round
    where
        T: GmsTransport,
        A: Application,
    {
        let local = gms.local_address();
        let config = gms.config();

        let responses = gms.find_initial_members().await;
        debug!("{}: discovered {} members", local, responses.len());
        if responses.is_empty() {
            info!("{}: no members discovered", local);
            return Round::Singleton;
        }

        let Some(coord) = discovery::determine_coordinator(&responses) else {
            let candidate = discovery::bootstrap_candidate(&local, &responses);
            if candidate == local {
                info!(
                    "{}: no coordinator among {} responders and lowest address, bootstrapping",
                    local,
                    responses.len()
                );
                return Round::Singleton;
            }
            debug!("{}: waiting for {} to bootstrap the cluster", local, candidate);
            return Round::Retry {
                candidate: Some(candidate),
            };
        };

        if coord == local {
            // Others still list a previous incarnation of this node as coordinator
            warn!(
                "{}: elected as coordinator by {} responders, telling them it is gone",
                local,
                responses.len()
            );
            let others = responders_except(&responses, &local);
            gms.multicast(&others, GmsHeader::InformAboutNodeDeath { dead: local })
                .await;
            tokio::time::sleep(config.join_timeout).await;
            return Round::Retry {
                candidate: Some(coord),
            };
        }

        info!("{}: sending join request to {}", local, coord);
        self.join_promise.reset(1);
        gms.send(
            &coord,
            GmsHeader::JoinRequest {
                member: local,
                subgroup: gms.subgroup().to_string(),
                incarnation: gms.incarnation(),
            },
        )
        .await;

        let Some(rsp) = self.join_promise.wait_result(config.join_timeout).await else {
            warn!("{}: no join response from {}", local, coord);
            if gms.verify_suspect(&coord, false).await {
                warn!("{}: {} is unreachable, informing the other members", local, coord);
                let others = responders_except(&responses, &coord);
                gms.multicast(&others, GmsHeader::InformAboutNodeDeath { dead: coord })
                    .await;
            }
            return Round::Retry {
                candidate: Some(coord),
            };
        };

        match rsp.result {
            JoinResult::Rejected => {
                warn!("{}: join rejected by {}", local, coord);
                Round::Singleton
            }
            JoinResult::ChangeInProgress => {
                debug!("{}: {} is busy, backing off", local, coord);
                Round::Backoff
            }
            JoinResult::Success => {
                let (Some(view), Some(mut digest)) = (rsp.view, rsp.digest) else {
                    warn!("{}: join response from {} lacks view or digest", local, coord);
                    return Round::Retry {
                        candidate: Some(coord),
                    };
                };
                if !view.contains(&local) {
                    warn!("{}: join view {} does not include this node", local, view);
                    return Round::Retry {
                        candidate: Some(coord),
                    };
                }

                digest.increment_high_seqno(&coord);
                gms.set_digest(digest).await;

                match gms.install_view(view, None, Some(coord)).await {
                    InstallOutcome::Installed | InstallOutcome::Unchanged => Round::Joined,
                    outcome => {
                        warn!("{}: could not install join view: {:?}", local, outcome);
                        Round::Retry {
                            candidate: Some(coord),
                        }
                    }
                }
            }
        }
    }
}

fn responders_except(responses: &[PingResponse], excluded: &Address) -> Vec<Address> {
    responses
        .iter()
        .map(|r| r.own_address)
        .filter(|a| a != excluded)
        .collect()
}
