//! Application stand-in that keeps a digest and records views

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_gms::{
    Address, Application, Digest, GmsError, GmsResult, HashDistribution, View, ViewId,
};
use tracing::debug;

/// In-memory application above one membership node.
///
/// Keeps the digest aligned with the installed membership: after every view
/// it holds exactly one entry per member, preserving known watermarks.
pub struct MemoryApplication {
    local: Address,
    digest: Mutex<Option<Digest>>,
    views: Mutex<Vec<View>>,
    resets: Mutex<Vec<ViewId>>,
    excluded: AtomicBool,
    distribute: bool,
}

impl MemoryApplication {
    /// Application for the node at `local`
    pub fn new(local: Address) -> Self {
        Self {
            local,
            digest: Mutex::new(None),
            views: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            excluded: AtomicBool::new(false),
            distribute: false,
        }
    }

    /// Attach a key distribution listing the members to every view change
    pub fn with_hash_distribution(mut self) -> Self {
        self.distribute = true;
        self
    }

    /// Every view installed so far, oldest first
    pub fn views(&self) -> Vec<View> {
        self.views.lock().clone()
    }

    /// Most recently installed view
    pub fn last_view(&self) -> Option<View> {
        self.views.lock().last().cloned()
    }

    /// Current digest
    pub fn digest(&self) -> Option<Digest> {
        self.digest.lock().clone()
    }

    /// Record that `sender` has delivered messages up to `high`
    pub fn deliver_up_to(&self, sender: &Address, high: i64) -> bool {
        match self.digest.lock().as_mut() {
            Some(digest) => {
                let low = digest.low_seqno_at(sender).max(0);
                digest.set(sender, low, high, high)
            }
            None => false,
        }
    }

    /// Sequencing resets requested by the coordinator
    pub fn resets(&self) -> Vec<ViewId> {
        self.resets.lock().clone()
    }

    /// Whether this node was excluded from its cluster
    pub fn was_excluded(&self) -> bool {
        self.excluded.load(Ordering::Acquire)
    }
}

fn normalized(digest: Option<&Digest>, view: &View) -> Digest {
    let mut next = Digest::new(view.len());
    for member in view.members().iter() {
        match digest.and_then(|d| d.get(member)) {
            Some(entry) => next.add_with_seen(*member, entry.low, entry.high, entry.high_seen),
            None => next.add(*member, 0, 0),
        };
    }
    next
}

#[async_trait]
impl Application for MemoryApplication {
    async fn on_view_changed(&self, view: View) {
        {
            let mut digest = self.digest.lock();
            let next = normalized(digest.as_ref(), &view);
            *digest = Some(next);
        }
        debug!("{}: application saw view {}", self.local, view);
        self.views.lock().push(view);
    }

    async fn get_digest(&self) -> GmsResult<Option<Digest>> {
        Ok(self.digest.lock().clone())
    }

    async fn set_digest(&self, digest: Digest) -> GmsResult<()> {
        *self.digest.lock() = Some(digest);
        Ok(())
    }

    async fn merge_digest(&self, digest: Digest) -> GmsResult<()> {
        let mut current = self.digest.lock();
        match current.as_mut() {
            Some(existing) => existing.merge(&digest),
            None => *current = Some(digest),
        }
        Ok(())
    }

    async fn get_hash_distribution(
        &self,
        members: &[Address],
        _is_joining: bool,
        subgroup: &str,
    ) -> GmsResult<Option<HashDistribution>> {
        if !self.distribute {
            return Ok(None);
        }
        if members.is_empty() {
            return Err(GmsError::Application(format!(
                "no members to distribute {subgroup} over"
            )));
        }
        let owners: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        let table = format!("{subgroup}:{}", owners.join(","));
        Ok(Some(HashDistribution(Bytes::from(table))))
    }

    async fn reset_sequence(&self, view_id: &ViewId) {
        self.resets.lock().push(*view_id);
    }

    async fn on_excluded(&self, view: &View) {
        debug!("{}: excluded by view {}", self.local, view.vid());
        self.excluded.store(true, Ordering::Release);
    }
}
