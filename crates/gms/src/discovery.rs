//! Discovery responses and coordinator election

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Weight of a vote cast by a responder that already completed its join
const JOINED_VOTE_WEIGHT: u32 = 1000;

/// A node's answer to a discovery request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Responder
    pub own_address: Address,
    /// Who the responder believes the coordinator is
    pub coord_address: Option<Address>,
    /// Whether the responder is a member of an installed view
    pub has_joined: bool,
    /// Whether the responder's membership service is running
    pub is_started: bool,
}

impl PingResponse {
    /// Response from a node that is a member of a view
    pub fn joined(own_address: Address, coord_address: Address) -> Self {
        Self {
            own_address,
            coord_address: Some(coord_address),
            has_joined: true,
            is_started: true,
        }
    }

    /// Response from a started node that has no view yet
    pub fn joining(own_address: Address) -> Self {
        Self {
            own_address,
            coord_address: None,
            has_joined: false,
            is_started: true,
        }
    }
}

/// Elect a coordinator from discovery responses.
///
/// Every response votes for the coordinator it reports. A candidate scores
/// one point per vote, plus [`JOINED_VOTE_WEIGHT`] if at least one of its
/// voters has already joined, so an established coordinator beats one
/// named only by nodes still mid-join. Ties go to the lowest address. The
/// score does not depend on response order, so every node looking at the
/// same responses picks the same coordinator. Returns `None` when no
/// response names a coordinator.
pub fn determine_coordinator(responses: &[PingResponse]) -> Option<Address> {
    let mut votes: BTreeMap<Address, (u32, bool)> = BTreeMap::new();

    for rsp in responses {
        let Some(coord) = rsp.coord_address else {
            continue;
        };
        let entry = votes.entry(coord).or_insert((0, false));
        entry.0 += 1;
        entry.1 |= rsp.has_joined;
    }

    // BTreeMap iterates in address order, so the first maximum is the lowest
    let mut winner: Option<(Address, u32)> = None;
    for (candidate, (count, joined)) in votes {
        let score = if joined { count + JOINED_VOTE_WEIGHT } else { count };
        match winner {
            Some((_, best)) if best >= score => {}
            _ => winner = Some((candidate, score)),
        }
    }
    winner.map(|(addr, _)| addr)
}

/// Node that should bootstrap the cluster when nobody reports a coordinator:
/// the lowest address among the responders and the local node.
pub fn bootstrap_candidate(local: &Address, responses: &[PingResponse]) -> Address {
    responses
        .iter()
        .map(|r| r.own_address)
        .chain(std::iter::once(*local))
        .min()
        .unwrap_or(*local)
}
