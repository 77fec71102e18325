//! # membership
//!
//! why: track which addresses vote and replicate, and size quorums from them
//! relations: owned by node.rs, changed only through committed Configuration entries
//! what: ClusterConfiguration set with quorum helpers

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::Address;

/// The set of member addresses currently voting and replicating
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    members: BTreeSet<Address>,
}

impl ClusterConfiguration {
    pub fn new<I, A>(members: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn members(&self) -> &BTreeSet<Address> {
        &self.members
    }

    pub fn contains(&self, address: &str) -> bool {
        self.members.contains(address)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Every member except `me`
    pub fn peers<'a>(&'a self, me: &'a str) -> impl Iterator<Item = &'a Address> + 'a {
        self.members.iter().filter(move |m| m.as_str() != me)
    }

    /// Smallest number of members forming a strict majority
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Whether the given voters include a strict majority of members.
    /// Addresses outside the configuration are ignored.
    pub fn is_quorum<'a, I>(&self, voters: I) -> bool
    where
        I: IntoIterator<Item = &'a Address>,
    {
        let count = voters
            .into_iter()
            .filter(|v| self.members.contains(*v))
            .collect::<BTreeSet<_>>()
            .len();
        count >= self.quorum_size()
    }
}

impl From<BTreeSet<Address>> for ClusterConfiguration {
    fn from(members: BTreeSet<Address>) -> Self {
        Self { members }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(names: &[&str]) -> Vec<Address> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(ClusterConfiguration::new(["a"]).quorum_size(), 1);
        assert_eq!(ClusterConfiguration::new(["a", "b"]).quorum_size(), 2);
        assert_eq!(ClusterConfiguration::new(["a", "b", "c"]).quorum_size(), 2);
        assert_eq!(ClusterConfiguration::new(["a", "b", "c", "d"]).quorum_size(), 3);
        assert_eq!(ClusterConfiguration::new(["a", "b", "c", "d", "e"]).quorum_size(), 3);
    }

    #[test]
    fn outsiders_do_not_count_toward_quorum() {
        let config = ClusterConfiguration::new(["a", "b", "c"]);
        assert!(!config.is_quorum(&addrs(&["a", "d"])));
        assert!(config.is_quorum(&addrs(&["a", "b", "d"])));
    }

    #[test]
    fn duplicate_voters_count_once() {
        let config = ClusterConfiguration::new(["a", "b", "c"]);
        assert!(!config.is_quorum(&addrs(&["a", "a"])));
    }

    #[test]
    fn peers_exclude_self() {
        let config = ClusterConfiguration::new(["a", "b", "c"]);
        let peers: Vec<_> = config.peers("b").cloned().collect();
        assert_eq!(peers, addrs(&["a", "c"]));
    }
}
