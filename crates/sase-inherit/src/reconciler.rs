//! Reconciler
//!
//! Diffs desired inherited relations against the provenance tags found
//! in a snapshot and emits the minimal set of tagged-relation changes.
//! Untagged relations are operator-owned and never touched.

use crate::model::{GroupId, RelationKey, ScopeId, ScopeSnapshot};
use crate::resolver::{ContributorSet, DesiredRelations};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// What to do with one tagged relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeAction {
    /// Ensure the relation is present and tagged with these contributors
    Attach { contributors: ContributorSet },
    /// Rewrite the tag's contributors; the relation stays in place
    Retag { contributors: ContributorSet },
    /// Remove the relation and its tag
    Detach,
}

/// One tagged-relation change; relation and tag are applied as a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationChange {
    pub group: GroupId,
    pub relation: RelationKey,
    /// Tag contributors seen in the snapshot (`None` if untagged)
    pub expected: Option<ContributorSet>,
    #[serde(flatten)]
    pub action: ChangeAction,
}

impl fmt::Display for RelationChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match &self.action {
            ChangeAction::Attach { .. } => "attach",
            ChangeAction::Retag { .. } => "retag",
            ChangeAction::Detach => "detach",
        };
        write!(f, "{} {} on {}", verb, self.relation, self.group)
    }
}

/// Changes for one reconciliation scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub scope: ScopeId,
    pub changes: Vec<RelationChange>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// Compute the delta that converges the snapshot toward `desired`
pub fn plan(snapshot: &ScopeSnapshot, desired: &DesiredRelations) -> Delta {
    let mut changes = Vec::new();

    for group in &snapshot.groups {
        let wanted = desired.for_group(&group.id);

        for tag in group.tags.values() {
            let expected = Some(tag.contributors.clone());
            match wanted.and_then(|w| w.get(&tag.relation)) {
                Some(contributors) if !group.holds(&tag.relation) => {
                    changes.push(RelationChange {
                        group: group.id.clone(),
                        relation: tag.relation.clone(),
                        expected,
                        action: ChangeAction::Attach {
                            contributors: contributors.clone(),
                        },
                    });
                }
                Some(contributors) if contributors != &tag.contributors => {
                    changes.push(RelationChange {
                        group: group.id.clone(),
                        relation: tag.relation.clone(),
                        expected,
                        action: ChangeAction::Retag {
                            contributors: contributors.clone(),
                        },
                    });
                }
                Some(_) => {}
                None => {
                    changes.push(RelationChange {
                        group: group.id.clone(),
                        relation: tag.relation.clone(),
                        expected,
                        action: ChangeAction::Detach,
                    });
                }
            }
        }

        let Some(wanted) = wanted else {
            continue;
        };
        for (relation, contributors) in wanted {
            if group.tag(relation).is_some() {
                continue;
            }
            if group.holds(relation) {
                debug!(group = %group.id, relation = %relation, "relation is operator-owned, not tagging");
                continue;
            }
            changes.push(RelationChange {
                group: group.id.clone(),
                relation: relation.clone(),
                expected: None,
                action: ChangeAction::Attach {
                    contributors: contributors.clone(),
                },
            });
        }
    }

    Delta {
        scope: snapshot.scope.clone(),
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OutsideGroup, ProvenanceTag};
    use crate::policy::{InheritancePolicy, PolicyMap};
    use crate::resolver::resolve;
    use crate::topology::Topology;
    use std::collections::BTreeSet;

    fn id(name: &str) -> GroupId {
        GroupId::outside("t1", "out1", name)
    }

    fn snapshot(groups: Vec<OutsideGroup>) -> ScopeSnapshot {
        let mut snap = ScopeSnapshot::empty(ScopeId::new("t1", "out1"));
        snap.groups = groups;
        snap
    }

    fn default_policies() -> PolicyMap {
        PolicyMap::from_iter([
            (id("p1"), InheritancePolicy::new(true, false)),
            (id("p2"), InheritancePolicy::new(true, false)),
            (id("child"), InheritancePolicy::new(false, true)),
        ])
    }

    fn delta_for(snap: &ScopeSnapshot, policies: &PolicyMap) -> Delta {
        let desired = resolve(snap, &Topology::from_snapshot(snap), policies);
        plan(snap, &desired)
    }

    fn contract() -> RelationKey {
        RelationKey::provides("mycontract")
    }

    fn parent(name: &str) -> OutsideGroup {
        OutsideGroup::new(id(name))
            .with_subnet("10.0.0.0/8".parse().unwrap())
            .with_relation(contract())
    }

    fn child() -> OutsideGroup {
        OutsideGroup::new(id("child")).with_subnet("10.1.0.0/16".parse().unwrap())
    }

    fn tagged(group: OutsideGroup, contributors: &[&str]) -> OutsideGroup {
        group.with_relation(contract()).with_tag(ProvenanceTag::new(
            contract(),
            contributors.iter().map(|n| id(n)).collect(),
        ))
    }

    #[test]
    fn test_attach_new_inherited_relation() {
        let snap = snapshot(vec![parent("p1"), child()]);
        let delta = delta_for(&snap, &default_policies());

        assert_eq!(delta.len(), 1);
        let change = &delta.changes[0];
        assert_eq!(change.group, id("child"));
        assert_eq!(change.expected, None);
        assert_eq!(
            change.action,
            ChangeAction::Attach {
                contributors: BTreeSet::from([id("p1")])
            }
        );
    }

    #[test]
    fn test_converged_state_is_empty() {
        let snap = snapshot(vec![parent("p1"), tagged(child(), &["p1"])]);
        assert!(delta_for(&snap, &default_policies()).is_empty());
    }

    #[test]
    fn test_losing_one_of_two_contributors_retags() {
        let p2_without = OutsideGroup::new(id("p2")).with_subnet("10.0.0.0/8".parse().unwrap());
        let snap = snapshot(vec![parent("p1"), p2_without, tagged(child(), &["p1", "p2"])]);
        let delta = delta_for(&snap, &default_policies());

        assert_eq!(delta.len(), 1);
        assert_eq!(
            delta.changes[0].action,
            ChangeAction::Retag {
                contributors: BTreeSet::from([id("p1")])
            }
        );
        assert_eq!(
            delta.changes[0].expected,
            Some(BTreeSet::from([id("p1"), id("p2")]))
        );
    }

    #[test]
    fn test_losing_last_contributor_detaches() {
        let p1_without = OutsideGroup::new(id("p1")).with_subnet("10.0.0.0/8".parse().unwrap());
        let snap = snapshot(vec![p1_without, tagged(child(), &["p1"])]);
        let delta = delta_for(&snap, &default_policies());

        assert_eq!(delta.len(), 1);
        assert_eq!(delta.changes[0].action, ChangeAction::Detach);
    }

    #[test]
    fn test_manual_relation_untouched() {
        // Operator-added relation that nothing justifies
        let snap = snapshot(vec![child().with_relation(RelationKey::consumes("manual"))]);
        assert!(delta_for(&snap, &default_policies()).is_empty());
    }

    #[test]
    fn test_manual_relation_not_claimed() {
        let snap = snapshot(vec![parent("p1"), child().with_relation(contract())]);
        assert!(delta_for(&snap, &default_policies()).is_empty());
    }

    #[test]
    fn test_tag_without_relation_restored() {
        let orphan_tag = child().with_tag(ProvenanceTag::new(contract(), BTreeSet::from([id("p1")])));
        let snap = snapshot(vec![parent("p1"), orphan_tag]);
        let delta = delta_for(&snap, &default_policies());

        assert_eq!(delta.len(), 1);
        assert!(matches!(delta.changes[0].action, ChangeAction::Attach { .. }));
        assert!(delta.changes[0].expected.is_some());
    }

    #[test]
    fn test_repeated_tag_entries_plan_one_change() {
        // A fetched group listing the same relation twice
        let mut value = serde_json::to_value(tagged(child(), &["p1"])).unwrap();
        let duplicate = serde_json::to_value(ProvenanceTag::new(contract(), BTreeSet::from([id("p2")]))).unwrap();
        value["tags"].as_array_mut().unwrap().push(duplicate);
        let fetched: OutsideGroup = serde_json::from_value(value).unwrap();

        let snap = snapshot(vec![parent("p1"), fetched]);
        let delta = delta_for(&snap, &default_policies());

        assert_eq!(delta.len(), 1);
        assert_eq!(
            delta.changes[0].expected,
            Some(BTreeSet::from([id("p1"), id("p2")]))
        );
        assert_eq!(
            delta.changes[0].action,
            ChangeAction::Retag {
                contributors: BTreeSet::from([id("p1")])
            }
        );
    }

    #[test]
    fn test_policy_disabled_detaches() {
        let snap = snapshot(vec![parent("p1"), tagged(child(), &["p1"])]);
        let policies = PolicyMap::from_iter([(id("p1"), InheritancePolicy::new(true, false))]);
        let delta = delta_for(&snap, &policies);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.changes[0].action, ChangeAction::Detach);
    }

    #[test]
    fn test_change_serializes_flat() {
        let change = RelationChange {
            group: id("child"),
            relation: contract(),
            expected: None,
            action: ChangeAction::Detach,
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["action"], "detach");
        assert_eq!(change.to_string(), "detach fvRsProv:mycontract on t1/l3out:out1/child");
    }
}
