//! In-process network connecting memory transports

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use proven_gms::{
    Address, GmsError, GmsHeader, GmsMessage, GmsResult, NodeStatus, PingResponse, TransportEvent,
};
use tracing::{debug, info, warn};

use crate::transport::MemoryTransport;

/// A node attached to the network
struct Endpoint {
    tx: flume::Sender<TransportEvent>,
    ping: Arc<RwLock<PingResponse>>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: DashMap<Address, Endpoint>,
    /// Partition label per node; unlabelled nodes share label 0
    partitions: RwLock<HashMap<Address, u32>>,
}

/// Shared in-process network.
///
/// Each test owns its own network, so clusters in parallel tests never see
/// each other. Headers are encoded and decoded on every hop, as they would
/// be on a wire.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node and return its transport.
    ///
    /// Attaching an address that is already present replaces the old
    /// endpoint; the previous transport stops receiving events.
    pub fn transport(&self, local: Address) -> Arc<MemoryTransport> {
        let (tx, rx) = flume::unbounded();
        let ping = Arc::new(RwLock::new(PingResponse::joining(local)));
        let previous = self.inner.endpoints.insert(
            local,
            Endpoint {
                tx,
                ping: ping.clone(),
            },
        );
        if previous.is_some() {
            info!("Memory node {} reattached", local);
        } else {
            debug!("Memory node {} attached", local);
        }
        Arc::new(MemoryTransport::new(local, self.clone(), rx, ping))
    }

    /// Whether two attached nodes can talk to each other
    pub fn reachable(&self, from: &Address, to: &Address) -> bool {
        if !self.inner.endpoints.contains_key(from) || !self.inner.endpoints.contains_key(to) {
            return false;
        }
        let partitions = self.inner.partitions.read();
        let label = |node: &Address| partitions.get(node).copied().unwrap_or(0);
        label(from) == label(to)
    }

    /// Liveness of `node` as probed from `from`
    pub fn node_status(&self, from: &Address, node: &Address) -> NodeStatus {
        if self.reachable(from, node) {
            NodeStatus::Alive
        } else {
            NodeStatus::Dead
        }
    }

    /// Discovery answers of every node reachable from `from`
    pub fn ping_responses(&self, from: &Address) -> Vec<PingResponse> {
        let nodes: Vec<Address> = self.nodes();
        nodes
            .into_iter()
            .filter(|node| node != from && self.reachable(from, node))
            .filter_map(|node| {
                self.inner
                    .endpoints
                    .get(&node)
                    .map(|endpoint| endpoint.ping.read().clone())
            })
            .collect()
    }

    /// Addresses of all attached nodes, sorted
    pub fn nodes(&self) -> Vec<Address> {
        let mut nodes: Vec<Address> = self.inner.endpoints.iter().map(|e| *e.key()).collect();
        nodes.sort();
        nodes
    }

    /// Carry a header from `src` to `dest`
    pub(crate) fn deliver(&self, src: Address, dest: &Address, header: &GmsHeader) -> GmsResult<()> {
        if !self.reachable(&src, dest) {
            return Err(GmsError::Transport(format!("{dest} unreachable from {src}")));
        }

        let bytes: Bytes = header.to_bytes()?;
        let header = GmsHeader::from_bytes(&bytes)?;
        self.emit(dest, TransportEvent::Message(GmsMessage { src, header }))
    }

    /// Push an event to one node
    pub fn emit(&self, dest: &Address, event: TransportEvent) -> GmsResult<()> {
        let endpoint = self
            .inner
            .endpoints
            .get(dest)
            .ok_or_else(|| GmsError::Transport(format!("no memory node at {dest}")))?;
        endpoint
            .tx
            .send(event)
            .map_err(|_| GmsError::Transport(format!("memory node {dest} closed")))
    }

    /// Split the network.
    ///
    /// Each group can only reach its own members; nodes in no group form
    /// one more partition. Every node is told to suspect the nodes it lost.
    pub fn partition(&self, groups: &[&[Address]]) {
        let before = self.reachability();
        {
            let mut partitions = self.inner.partitions.write();
            partitions.clear();
            for (index, group) in groups.iter().enumerate() {
                for node in group.iter() {
                    partitions.insert(*node, index as u32 + 1);
                }
            }
        }
        info!("Memory network partitioned into {:?}", groups);

        for (from, to) in before {
            if !self.reachable(&from, &to) {
                self.notify(&from, TransportEvent::Suspect(to));
            }
        }
    }

    /// Remove all partitions and tell every node its peers are back
    pub fn heal(&self) {
        self.inner.partitions.write().clear();
        info!("Memory network healed");

        for (from, to) in self.reachability() {
            self.notify(&from, TransportEvent::Unsuspect(to));
        }
    }

    /// Detach a node abruptly and let its peers suspect it
    pub fn crash(&self, node: &Address) {
        let peers: Vec<Address> = self
            .nodes()
            .into_iter()
            .filter(|peer| peer != node && self.reachable(peer, node))
            .collect();
        self.inner.endpoints.remove(node);
        self.inner.partitions.write().remove(node);
        info!("Memory node {} crashed", node);

        for peer in peers {
            self.notify(&peer, TransportEvent::Suspect(*node));
        }
    }

    /// Tell every coordinator about the others it can reach.
    ///
    /// Returns the coordinators that were told, empty if there was nothing
    /// to merge.
    pub fn trigger_merge(&self) -> Vec<Address> {
        let coordinators: Vec<Address> = self
            .nodes()
            .into_iter()
            .filter(|node| {
                self.inner.endpoints.get(node).is_some_and(|endpoint| {
                    let ping = endpoint.ping.read();
                    ping.has_joined && ping.coord_address == Some(*node)
                })
            })
            .collect();

        if coordinators.len() <= 1 {
            debug!("Memory network has {} coordinators, no merge", coordinators.len());
            return Vec::new();
        }

        info!("Memory network announcing merge of {:?}", coordinators);
        for coordinator in &coordinators {
            let visible: Vec<Address> = coordinators
                .iter()
                .filter(|other| self.reachable(coordinator, other))
                .copied()
                .collect();
            self.notify(coordinator, TransportEvent::Merge(visible));
        }
        coordinators
    }

    fn reachability(&self) -> Vec<(Address, Address)> {
        let nodes = self.nodes();
        let mut pairs = Vec::new();
        for from in &nodes {
            for to in &nodes {
                if from != to && self.reachable(from, to) {
                    pairs.push((*from, *to));
                }
            }
        }
        pairs
    }

    fn notify(&self, dest: &Address, event: TransportEvent) {
        if let Err(e) = self.emit(dest, event) {
            warn!("Failed to notify {}: {}", dest, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::localhost(port)
    }

    #[test]
    fn test_partition_and_heal() {
        let network = MemoryNetwork::new();
        let _a = network.transport(addr(7000));
        let _b = network.transport(addr(7001));
        let _c = network.transport(addr(7002));

        assert!(network.reachable(&addr(7000), &addr(7002)));

        network.partition(&[&[addr(7000), addr(7001)]]);
        assert!(network.reachable(&addr(7000), &addr(7001)));
        assert!(!network.reachable(&addr(7000), &addr(7002)));
        assert_eq!(
            network.node_status(&addr(7002), &addr(7000)),
            NodeStatus::Dead
        );

        network.heal();
        assert!(network.reachable(&addr(7000), &addr(7002)));
    }

    #[test]
    fn test_crash_detaches() {
        let network = MemoryNetwork::new();
        let _a = network.transport(addr(7000));
        let _b = network.transport(addr(7001));

        network.crash(&addr(7001));
        assert_eq!(network.nodes(), vec![addr(7000)]);
        assert!(network.ping_responses(&addr(7000)).is_empty());
        assert!(
            network
                .deliver(addr(7000), &addr(7001), &GmsHeader::LeaveResponse)
                .is_err()
        );
    }

    #[test]
    fn test_no_merge_with_single_coordinator() {
        let network = MemoryNetwork::new();
        let _a = network.transport(addr(7000));
        assert!(network.trigger_merge().is_empty());
    }
}
