//! Memory transport for one node

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use proven_gms::{
    Address, GmsHeader, GmsResult, GmsTransport, NodeStatus, PingResponse, TransportEvent, View,
};
use tracing::{debug, warn};

use crate::network::MemoryNetwork;

/// Transport endpoint attached to a [`MemoryNetwork`]
pub struct MemoryTransport {
    local: Address,
    network: MemoryNetwork,
    incoming_rx: Mutex<Option<flume::Receiver<TransportEvent>>>,
    ping: Arc<RwLock<PingResponse>>,
}

impl MemoryTransport {
    pub(crate) fn new(
        local: Address,
        network: MemoryNetwork,
        incoming_rx: flume::Receiver<TransportEvent>,
        ping: Arc<RwLock<PingResponse>>,
    ) -> Self {
        Self {
            local,
            network,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            ping,
        }
    }

    /// Address of this endpoint
    pub fn local_address(&self) -> Address {
        self.local
    }

    /// What this node answers to discovery
    pub fn ping_response(&self) -> PingResponse {
        self.ping.read().clone()
    }
}

#[async_trait]
impl GmsTransport for MemoryTransport {
    async fn send(&self, dest: &Address, header: GmsHeader) -> GmsResult<()> {
        debug!("{}: sending {} to {}", self.local, header, dest);
        self.network.deliver(self.local, dest, &header)
    }

    async fn multicast(&self, dests: &[Address], header: GmsHeader) -> GmsResult<()> {
        for dest in dests {
            if let Err(e) = self.network.deliver(self.local, dest, &header) {
                warn!("{}: dropped {} to {}: {}", self.local, header.type_name(), dest, e);
            }
        }
        Ok(())
    }

    async fn find_initial_members(&self) -> GmsResult<Vec<PingResponse>> {
        Ok(self.network.ping_responses(&self.local))
    }

    async fn node_status(&self, node: &Address) -> NodeStatus {
        self.network.node_status(&self.local, node)
    }

    async fn view_installed(&self, view: &View) {
        let response = match view.coordinator() {
            Some(coordinator) => PingResponse::joined(self.local, *coordinator),
            None => PingResponse::joining(self.local),
        };
        *self.ping.write() = response;
    }

    async fn disconnected(&self) {
        *self.ping.write() = PingResponse::joining(self.local);
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send>> {
        match self.incoming_rx.lock().take() {
            Some(rx) => rx.into_stream().boxed(),
            None => {
                warn!("{}: incoming events already taken", self.local);
                futures::stream::empty().boxed()
            }
        }
    }
}
