//! Containment Topology
//!
//! Builds the parent/child forest among the outside groups of one
//! routed-network boundary from their subnet prefixes.

use crate::model::{GroupId, OutsideGroup, ScopeSnapshot};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};

/// `outer` is a strict superset of `inner`
pub fn properly_contains(outer: &IpNet, inner: &IpNet) -> bool {
    outer.prefix_len() < inner.prefix_len() && outer.contains(inner)
}

/// Immediate containment edges of one boundary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    parents: BTreeMap<GroupId, BTreeSet<GroupId>>,
    children: BTreeMap<GroupId, BTreeSet<GroupId>>,
}

impl Topology {
    /// Build from a deep snapshot
    pub fn from_snapshot(snapshot: &ScopeSnapshot) -> Self {
        Self::build(&snapshot.groups)
    }

    /// Build from the outside groups of one boundary
    pub fn build(groups: &[OutsideGroup]) -> Self {
        let candidates = candidate_edges(groups);

        let mut topology = Self::default();
        for (parent, children) in &candidates {
            for child in children {
                // An intermediate Z with parent→Z→child makes this edge
                // non-immediate, unless Z shares a containment cycle with
                // either end.
                let shadowed = children.iter().any(|z| {
                    z != child
                        && candidates
                            .get(z)
                            .map(|below| below.contains(child))
                            .unwrap_or(false)
                        && !reaches(&candidates, z, parent)
                        && !reaches(&candidates, child, z)
                });
                if !shadowed {
                    topology.insert(parent.clone(), child.clone());
                }
            }
        }

        tracing::debug!(
            groups = groups.len(),
            edges = topology.edge_count(),
            "built containment topology"
        );
        topology
    }

    fn insert(&mut self, parent: GroupId, child: GroupId) {
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        self.parents.entry(child).or_default().insert(parent);
    }

    /// Immediate parents of a group
    pub fn parents_of<'a>(&'a self, group: &GroupId) -> impl Iterator<Item = &'a GroupId> + 'a {
        self.parents.get(group).into_iter().flatten()
    }

    /// Immediate children of a group
    pub fn children_of<'a>(&'a self, group: &GroupId) -> impl Iterator<Item = &'a GroupId> + 'a {
        self.children.get(group).into_iter().flatten()
    }

    pub fn is_parent(&self, parent: &GroupId, child: &GroupId) -> bool {
        self.parents
            .get(child)
            .map(|p| p.contains(parent))
            .unwrap_or(false)
    }

    pub fn edge_count(&self) -> usize {
        self.parents.values().map(BTreeSet::len).sum()
    }
}

/// Whether `to` is reachable from `from` over candidate edges
fn reaches(edges: &BTreeMap<GroupId, BTreeSet<GroupId>>, from: &GroupId, to: &GroupId) -> bool {
    let mut seen: BTreeSet<&GroupId> = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = edges.get(current) {
            stack.extend(next.iter());
        }
    }
    false
}

/// X → Y whenever some subnet of X strictly contains some subnet of Y
fn candidate_edges(groups: &[OutsideGroup]) -> BTreeMap<GroupId, BTreeSet<GroupId>> {
    let mut edges: BTreeMap<GroupId, BTreeSet<GroupId>> = BTreeMap::new();
    for outer in groups {
        for inner in groups {
            if outer.id == inner.id {
                continue;
            }
            let contains = outer.subnets.iter().any(|o| {
                inner
                    .subnets
                    .iter()
                    .any(|i| properly_contains(&o.trunc(), &i.trunc()))
            });
            if contains {
                edges
                    .entry(outer.id.clone())
                    .or_default()
                    .insert(inner.id.clone());
            }
        }
    }
    edges
}
