//! Message sequence watermarks
//!
//! A digest records, per sender, the lowest retained sequence number, the
//! highest deliverable one and the highest one seen. Reliable delivery above
//! the membership layer owns the actual values; membership only copies,
//! extends and merges digests while views change.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::Address;

/// One sender's watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEntry {
    /// Sender the entry describes
    pub sender: Address,
    /// Oldest retained sequence number
    pub low: i64,
    /// Highest deliverable sequence number
    pub high: i64,
    /// Highest sequence number observed, -1 if none
    pub high_seen: i64,
}

/// Per-sender watermark table with a fixed initial capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    entries: Vec<DigestEntry>,
    capacity: usize,
}

impl Digest {
    /// Create an empty digest able to hold `capacity` senders
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sender with no observed high sequence number.
    ///
    /// Returns false without changing anything when the digest is full or
    /// the sender is already present.
    pub fn add(&mut self, sender: Address, low: i64, high: i64) -> bool {
        self.add_with_seen(sender, low, high, -1)
    }

    /// Add a sender with all three watermarks
    pub fn add_with_seen(&mut self, sender: Address, low: i64, high: i64, high_seen: i64) -> bool {
        if self.is_full() || self.contains(&sender) {
            return false;
        }
        self.entries.push(DigestEntry {
            sender,
            low,
            high,
            high_seen,
        });
        true
    }

    /// Add every entry of another digest, keeping existing ones untouched
    pub fn add_digest(&mut self, other: &Digest) {
        for entry in &other.entries {
            self.add_with_seen(entry.sender, entry.low, entry.high, entry.high_seen);
        }
    }

    /// Merge another digest into this one.
    ///
    /// For senders present in both, the lower `low`, the higher `high` and
    /// the higher `high_seen` win. Unknown senders are appended; when the
    /// digest is full its capacity grows instead of dropping entries.
    pub fn merge(&mut self, other: &Digest) {
        for entry in &other.entries {
            self.merge_entry(entry.sender, entry.low, entry.high, entry.high_seen);
        }
    }

    /// Merge a single sender's watermarks
    pub fn merge_entry(&mut self, sender: Address, low: i64, high: i64, high_seen: i64) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.sender == sender) {
            existing.low = existing.low.min(low);
            existing.high = existing.high.max(high);
            existing.high_seen = existing.high_seen.max(high_seen);
            return;
        }

        if self.is_full() {
            debug!(
                "Digest full at {} entries, growing to admit {}",
                self.capacity, sender
            );
            self.capacity += 1;
        }
        self.add_with_seen(sender, low, high, high_seen);
    }

    /// Increment the high sequence number of a sender, if present
    pub fn increment_high_seqno(&mut self, sender: &Address) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sender == *sender) {
            entry.high += 1;
        }
    }

    /// Overwrite a sender's watermarks, returning whether it was present
    pub fn set(&mut self, sender: &Address, low: i64, high: i64, high_seen: i64) -> bool {
        match self.entries.iter_mut().find(|e| e.sender == *sender) {
            Some(entry) => {
                entry.low = low;
                entry.high = high;
                entry.high_seen = high_seen;
                true
            }
            None => false,
        }
    }

    /// Reset the watermarks at a position to their initial values
    pub fn reset_at(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.low = 0;
            entry.high = 0;
            entry.high_seen = -1;
        }
    }

    /// Entry for a sender
    pub fn get(&self, sender: &Address) -> Option<&DigestEntry> {
        self.entries.iter().find(|e| e.sender == *sender)
    }

    /// High sequence number for a sender, -1 if absent
    pub fn high_seqno_at(&self, sender: &Address) -> i64 {
        self.get(sender).map_or(-1, |e| e.high)
    }

    /// Low sequence number for a sender, -1 if absent
    pub fn low_seqno_at(&self, sender: &Address) -> i64 {
        self.get(sender).map_or(-1, |e| e.low)
    }

    /// Highest seen sequence number for a sender, -1 if absent
    pub fn high_seen_at(&self, sender: &Address) -> i64 {
        self.get(sender).map_or(-1, |e| e.high_seen)
    }

    /// Whether the sender has an entry
    pub fn contains(&self, sender: &Address) -> bool {
        self.entries.iter().any(|e| e.sender == *sender)
    }

    /// Whether both digests describe the same set of senders
    pub fn same_senders(&self, other: &Digest) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|e| other.contains(&e.sender))
    }

    /// Senders in insertion order
    pub fn senders(&self) -> impl Iterator<Item = &Address> {
        self.entries.iter().map(|e| &e.sender)
    }

    /// All entries in insertion order
    pub fn entries(&self) -> &[DigestEntry] {
        &self.entries
    }

    /// Number of senders
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the digest has no senders
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of senders before the digest is full
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: [{} : {}", e.sender, e.low, e.high)?;
            if e.high_seen >= 0 {
                write!(f, " ({})", e.high_seen)?;
            }
            write!(f, "]")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(port: u16) -> Address {
        Address::localhost(port)
    }

    #[test]
    fn test_add_is_noop_when_full_or_duplicate() {
        let mut d = Digest::new(2);
        assert!(d.add(addr(1), 0, 5));
        assert!(!d.add(addr(1), 3, 9));
        assert!(d.add(addr(2), 0, 0));
        assert!(!d.add(addr(3), 0, 0));

        assert_eq!(d.len(), 2);
        assert_eq!(d.high_seqno_at(&addr(1)), 5);
        assert_eq!(d.high_seen_at(&addr(1)), -1);
        assert_eq!(d.high_seqno_at(&addr(3)), -1);
    }

    #[test]
    fn test_merge_takes_min_low_max_high() {
        let mut a = Digest::new(2);
        a.add_with_seen(addr(1), 4, 10, 12);
        a.add(addr(2), 0, 3);

        let mut b = Digest::new(2);
        b.add_with_seen(addr(1), 2, 8, 15);
        b.add(addr(3), 1, 1);

        a.merge(&b);

        let e1 = a.get(&addr(1)).unwrap();
        assert_eq!((e1.low, e1.high, e1.high_seen), (2, 10, 15));
        assert_eq!(a.high_seqno_at(&addr(2)), 3);
        assert_eq!(a.high_seqno_at(&addr(3)), 1);
        // grew past the original capacity instead of dropping addr(3)
        assert_eq!(a.len(), 3);
        assert_eq!(a.capacity(), 3);
    }

    #[test]
    fn test_increment_and_reset() {
        let mut d = Digest::new(1);
        d.add_with_seen(addr(1), 3, 7, 9);
        d.increment_high_seqno(&addr(1));
        assert_eq!(d.high_seqno_at(&addr(1)), 8);

        d.reset_at(0);
        let e = d.get(&addr(1)).unwrap();
        assert_eq!((e.low, e.high, e.high_seen), (0, 0, -1));
    }

    #[test]
    fn test_same_senders_and_display() {
        let mut a = Digest::new(2);
        a.add(addr(1), 0, 1);
        a.add_with_seen(addr(2), 0, 2, 4);

        let mut b = Digest::new(2);
        b.add(addr(2), 9, 9);
        b.add(addr(1), 9, 9);

        assert!(a.same_senders(&b));
        assert_eq!(
            a.to_string(),
            "[127.0.0.1:1: [0 : 1], 127.0.0.1:2: [0 : 2 (4)]]"
        );
    }

    fn digest_strategy() -> impl Strategy<Value = Digest> {
        prop::collection::vec((1u16..6, 0i64..20, 0i64..20, -1i64..20), 0..6).prop_map(
            |entries| {
                let mut d = Digest::new(entries.len());
                for (port, low, high, seen) in entries {
                    d.add_with_seen(addr(port), low, high, seen);
                }
                d
            },
        )
    }

    fn triples(d: &Digest) -> Vec<(Address, i64, i64, i64)> {
        let mut out: Vec<_> = d
            .entries()
            .iter()
            .map(|e| (e.sender, e.low, e.high, e.high_seen))
            .collect();
        out.sort();
        out
    }

    proptest! {
        #[test]
        fn merge_order_does_not_matter(d1 in digest_strategy(), d2 in digest_strategy(), d3 in digest_strategy()) {
            let mut left = Digest::new(0);
            left.merge(&d1);
            left.merge(&d2);
            left.merge(&d3);

            let mut right = Digest::new(0);
            right.merge(&d3);
            right.merge(&d1);
            right.merge(&d2);

            let mut nested = d2.clone();
            nested.merge(&d3);
            let mut grouped = d1.clone();
            grouped.merge(&nested);

            prop_assert_eq!(triples(&left), triples(&right));
            prop_assert_eq!(triples(&left), triples(&grouped));
        }
    }
}
