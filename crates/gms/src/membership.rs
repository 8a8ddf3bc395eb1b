//! Ordered member lists

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Ordered list of member addresses without duplicates.
///
/// Installed memberships are kept sorted by address, so the first entry is
/// the deterministic leader candidate and the coordinator of its view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    members: Vec<Address>,
}

impl Membership {
    /// Create an empty membership
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a membership from a list, dropping duplicates
    pub fn from_members<I: IntoIterator<Item = Address>>(members: I) -> Self {
        let mut membership = Self::new();
        membership.add_all(members);
        membership
    }

    /// Append a member unless already present
    pub fn add(&mut self, member: Address) -> bool {
        if self.members.contains(&member) {
            return false;
        }
        self.members.push(member);
        true
    }

    /// Append every member not already present
    pub fn add_all<I: IntoIterator<Item = Address>>(&mut self, members: I) {
        for member in members {
            self.add(member);
        }
    }

    /// Remove a member, returning whether it was present
    pub fn remove(&mut self, member: &Address) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != member);
        before != self.members.len()
    }

    /// Remove every listed member
    pub fn remove_all<'a, I: IntoIterator<Item = &'a Address>>(&mut self, members: I) {
        for member in members {
            self.remove(member);
        }
    }

    /// Keep only members also present in `other`
    pub fn retain_all(&mut self, other: &Membership) {
        self.members.retain(|m| other.contains(m));
    }

    /// Replace the contents with another membership
    pub fn set(&mut self, other: &Membership) {
        self.members.clone_from(&other.members);
    }

    /// Remove all members
    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Sort by address
    pub fn sort(&mut self) {
        self.members.sort();
    }

    /// Whether the member is present
    pub fn contains(&self, member: &Address) -> bool {
        self.members.contains(member)
    }

    /// Member at the given position
    pub fn element_at(&self, index: usize) -> Option<&Address> {
        self.members.get(index)
    }

    /// Position of a member
    pub fn index_of(&self, member: &Address) -> Option<usize> {
        self.members.iter().position(|m| m == member)
    }

    /// First member, the coordinator of an installed view
    pub fn first(&self) -> Option<&Address> {
        self.members.first()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether there are no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members as a slice
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Iterate over members in order
    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.members.iter()
    }

    /// Pick the senior of two members.
    ///
    /// The member that appears earlier in the list is senior. A member
    /// that is not listed loses to one that is; when neither is listed the
    /// lower address wins.
    pub fn determine_seniority(&self, a: &Address, b: &Address) -> Address {
        match (self.index_of(a), self.index_of(b)) {
            (Some(ia), Some(ib)) => {
                if ia <= ib {
                    *a
                } else {
                    *b
                }
            }
            (Some(_), None) => *a,
            (None, Some(_)) => *b,
            (None, None) => std::cmp::min(*a, *b),
        }
    }
}

impl From<Vec<Address>> for Membership {
    fn from(members: Vec<Address>) -> Self {
        Self::from_members(members)
    }
}

impl IntoIterator for Membership {
    type Item = Address;
    type IntoIter = std::vec::IntoIter<Address>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_iter()
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{member}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::localhost(port)
    }

    #[test]
    fn test_no_duplicates() {
        let mut m = Membership::from_members(vec![addr(1), addr(2), addr(1)]);
        assert_eq!(m.len(), 2);
        assert!(!m.add(addr(2)));
        assert!(m.add(addr(3)));
        assert_eq!(m.members(), &[addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn test_sort_puts_leader_first() {
        let mut m = Membership::from_members(vec![addr(30), addr(10), addr(20)]);
        assert_eq!(m.first(), Some(&addr(30)));
        m.sort();
        assert_eq!(m.first(), Some(&addr(10)));
        assert_eq!(m.element_at(2), Some(&addr(30)));
    }

    #[test]
    fn test_remove_and_retain() {
        let mut m = Membership::from_members(vec![addr(1), addr(2), addr(3), addr(4)]);
        m.remove_all(&[addr(2), addr(9)]);
        assert_eq!(m.members(), &[addr(1), addr(3), addr(4)]);

        m.retain_all(&Membership::from_members(vec![addr(4), addr(1)]));
        assert_eq!(m.members(), &[addr(1), addr(4)]);
    }

    #[test]
    fn test_seniority_follows_join_order() {
        let m = Membership::from_members(vec![addr(50), addr(10), addr(30)]);
        assert_eq!(m.determine_seniority(&addr(10), &addr(50)), addr(50));
        assert_eq!(m.determine_seniority(&addr(30), &addr(99)), addr(30));
        assert_eq!(m.determine_seniority(&addr(98), &addr(97)), addr(97));
    }
}
