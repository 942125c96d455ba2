//! Relation Resolver
//!
//! Computes the inherited relations every outside group should hold,
//! together with the set of parents that justify each one.
//!
//! Propagation is one hop: a parent donates only the relations it holds
//! directly, never the ones it received by inheritance itself.

use crate::model::{GroupId, OutsideGroup, RelationKey, ScopeSnapshot};
use crate::policy::PolicyMap;
use crate::topology::Topology;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Ancestors contributing one inherited relation
pub type ContributorSet = BTreeSet<GroupId>;

/// Desired inherited relations per group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredRelations {
    groups: BTreeMap<GroupId, BTreeMap<RelationKey, ContributorSet>>,
}

impl DesiredRelations {
    fn add(&mut self, group: &GroupId, relation: &RelationKey, contributor: &GroupId) {
        self.groups
            .entry(group.clone())
            .or_default()
            .entry(relation.clone())
            .or_default()
            .insert(contributor.clone());
    }

    /// Desired relations of one group
    pub fn for_group(&self, group: &GroupId) -> Option<&BTreeMap<RelationKey, ContributorSet>> {
        self.groups.get(group)
    }

    /// Desired contributors for one relation on one group
    pub fn contributors(&self, group: &GroupId, relation: &RelationKey) -> Option<&ContributorSet> {
        self.groups.get(group).and_then(|r| r.get(relation))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupId, &BTreeMap<RelationKey, ContributorSet>)> {
        self.groups.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of (group, relation) pairs
    pub fn relation_count(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }
}

/// Resolve the desired inherited relations of one boundary
pub fn resolve(snapshot: &ScopeSnapshot, topology: &Topology, policies: &PolicyMap) -> DesiredRelations {
    let index: HashMap<&GroupId, &OutsideGroup> =
        snapshot.groups.iter().map(|g| (&g.id, g)).collect();

    let mut desired = DesiredRelations::default();
    for group in &snapshot.groups {
        if !policies.get(&group.id).enabled {
            continue;
        }
        for parent_id in topology.parents_of(&group.id) {
            if !policies.get(parent_id).allowed {
                continue;
            }
            let Some(parent) = index.get(parent_id) else {
                continue;
            };
            for relation in parent.directly_held() {
                desired.add(&group.id, relation, parent_id);
            }
        }
    }

    tracing::debug!(
        scope = %snapshot.scope,
        relations = desired.relation_count(),
        "resolved inherited relations"
    );
    desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProvenanceTag, ScopeId};
    use crate::policy::InheritancePolicy;

    fn id(name: &str) -> GroupId {
        GroupId::outside("t1", "out1", name)
    }

    fn group(name: &str, subnet: &str) -> OutsideGroup {
        OutsideGroup::new(id(name)).with_subnet(subnet.parse().unwrap())
    }

    fn snapshot(groups: Vec<OutsideGroup>) -> ScopeSnapshot {
        let mut snap = ScopeSnapshot::empty(ScopeId::new("t1", "out1"));
        snap.groups = groups;
        snap
    }

    fn policies(entries: &[(&str, bool, bool)]) -> PolicyMap {
        entries
            .iter()
            .map(|(name, allowed, enabled)| (id(name), InheritancePolicy::new(*allowed, *enabled)))
            .collect()
    }

    fn run(snap: &ScopeSnapshot, map: &PolicyMap) -> DesiredRelations {
        resolve(snap, &Topology::from_snapshot(snap), map)
    }

    fn parent_child() -> ScopeSnapshot {
        snapshot(vec![
            group("parent", "5.1.1.1/8").with_relation(RelationKey::provides("mycontract")),
            group("child", "5.2.1.1/16"),
        ])
    }

    #[test]
    fn test_policy_gating_matrix() {
        let snap = parent_child();
        let contract = RelationKey::provides("mycontract");
        let cases = [
            (true, true, true),
            (true, false, false),
            (false, true, false),
            (false, false, false),
        ];
        for (enabled, allowed, inherited) in cases {
            let map = policies(&[("child", false, enabled), ("parent", allowed, false)]);
            let desired = run(&snap, &map);
            assert_eq!(
                desired.contributors(&id("child"), &contract).is_some(),
                inherited,
                "enabled={} allowed={}",
                enabled,
                allowed
            );
        }
    }

    #[test]
    fn test_all_relation_kinds_propagate() {
        let snap = snapshot(vec![
            group("parent", "10.0.0.0/8")
                .with_relation(RelationKey::provides("web"))
                .with_relation(RelationKey::consumes("db"))
                .with_relation(RelationKey::consumes_interface("shared")),
            group("child", "10.1.0.0/16"),
        ]);
        let map = policies(&[("parent", true, false), ("child", false, true)]);
        let desired = run(&snap, &map);
        let relations = desired.for_group(&id("child")).unwrap();
        assert_eq!(relations.len(), 3);
        assert!(relations.contains_key(&RelationKey::consumes_interface("shared")));
    }

    #[test]
    fn test_multi_parent_contributors() {
        let contract = RelationKey::provides("mycontract");
        let snap = snapshot(vec![
            group("p1", "10.0.0.0/8").with_relation(contract.clone()),
            group("p2", "10.0.0.0/8").with_relation(contract.clone()),
            group("child", "10.1.0.0/16"),
        ]);
        let map = policies(&[("p1", true, false), ("p2", true, false), ("child", false, true)]);
        let desired = run(&snap, &map);
        let contributors = desired.contributors(&id("child"), &contract).unwrap();
        assert_eq!(contributors, &BTreeSet::from([id("p1"), id("p2")]));
    }

    #[test]
    fn test_inherited_relations_not_redonated() {
        let contract = RelationKey::provides("mycontract");
        let snap = snapshot(vec![
            group("top", "10.0.0.0/8").with_relation(contract.clone()),
            group("mid", "10.0.0.0/12")
                .with_relation(contract.clone())
                .with_tag(ProvenanceTag::new(contract.clone(), BTreeSet::from([id("top")]))),
            group("leaf", "10.1.0.0/16"),
        ]);
        let map = policies(&[("top", true, false), ("mid", true, true), ("leaf", false, true)]);
        let desired = run(&snap, &map);

        assert!(desired.contributors(&id("mid"), &contract).is_some());
        assert!(desired.for_group(&id("leaf")).is_none());
    }

    #[test]
    fn test_mid_group_receives_and_donates_direct() {
        let snap = snapshot(vec![
            group("top", "10.0.0.0/8").with_relation(RelationKey::provides("from-top")),
            group("mid", "10.0.0.0/12").with_relation(RelationKey::provides("from-mid")),
            group("leaf", "10.1.0.0/16"),
        ]);
        let map = policies(&[("top", true, false), ("mid", true, true), ("leaf", false, true)]);
        let desired = run(&snap, &map);

        let mid = desired.for_group(&id("mid")).unwrap();
        assert!(mid.contains_key(&RelationKey::provides("from-top")));
        let leaf = desired.for_group(&id("leaf")).unwrap();
        assert!(leaf.contains_key(&RelationKey::provides("from-mid")));
        assert!(!leaf.contains_key(&RelationKey::provides("from-top")));
    }

    #[test]
    fn test_child_of_containment_cycle_inherits_from_both() {
        let snap = snapshot(vec![
            group("a", "10.0.0.0/8")
                .with_subnet("20.1.0.0/16".parse().unwrap())
                .with_relation(RelationKey::provides("from-a")),
            group("b", "20.0.0.0/8")
                .with_subnet("10.1.0.0/16".parse().unwrap())
                .with_relation(RelationKey::provides("from-b")),
            group("c", "10.1.1.0/24"),
        ]);
        let map = policies(&[("a", true, false), ("b", true, false), ("c", false, true)]);
        let desired = run(&snap, &map);

        let c = desired.for_group(&id("c")).unwrap();
        assert!(c.contains_key(&RelationKey::provides("from-a")));
        assert!(c.contains_key(&RelationKey::provides("from-b")));
    }

    #[test]
    fn test_child_without_subnet_inherits_nothing() {
        let snap = snapshot(vec![
            group("parent", "5.1.1.1/8").with_relation(RelationKey::provides("mycontract")),
            OutsideGroup::new(id("child")),
        ]);
        let map = policies(&[("parent", true, false), ("child", true, true)]);
        assert!(run(&snap, &map).is_empty());
    }
}
