//! Inheritance policy store with wholesale hot-swapping

use crate::model::{GroupId, ScopeId};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Operator-declared inheritance flags for one endpoint group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritancePolicy {
    /// Relations of this group may be inherited by its descendants
    pub allowed: bool,
    /// This group accepts relations inherited from its ancestors
    pub enabled: bool,
}

impl InheritancePolicy {
    pub fn new(allowed: bool, enabled: bool) -> Self {
        Self { allowed, enabled }
    }
}

/// Immutable policy map, keyed by group identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyMap {
    entries: BTreeMap<GroupId, InheritancePolicy>,
}

impl PolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: GroupId, policy: InheritancePolicy) -> Option<InheritancePolicy> {
        self.entries.insert(group, policy)
    }

    /// Policy for a group; unconfigured groups get both flags false
    pub fn get(&self, group: &GroupId) -> InheritancePolicy {
        self.entries.get(group).copied().unwrap_or_default()
    }

    pub fn contains(&self, group: &GroupId) -> bool {
        self.entries.contains_key(group)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupId, &InheritancePolicy)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every reconciliation scope referenced by an entry
    pub fn scopes(&self) -> BTreeSet<ScopeId> {
        self.entries.keys().filter_map(GroupId::scope).collect()
    }

    /// Entries whose group lives in the given scope
    pub fn in_scope<'a>(&'a self, scope: &'a ScopeId) -> impl Iterator<Item = (&'a GroupId, &'a InheritancePolicy)> + 'a {
        self.entries
            .iter()
            .filter(move |(id, _)| id.scope().as_ref() == Some(scope))
    }
}

impl FromIterator<(GroupId, InheritancePolicy)> for PolicyMap {
    fn from_iter<I: IntoIterator<Item = (GroupId, InheritancePolicy)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Result of a wholesale policy replacement
#[derive(Debug, Clone)]
pub struct PolicySwap {
    pub previous: Arc<PolicyMap>,
    pub current: Arc<PolicyMap>,
    pub version: u64,
}

impl PolicySwap {
    /// Scopes touched by either side of the swap.
    ///
    /// Groups dropped from the new map revert to the default policy, so
    /// their scopes must be reconciled as well.
    pub fn affected_scopes(&self) -> BTreeSet<ScopeId> {
        let mut scopes = self.previous.scopes();
        scopes.extend(self.current.scopes());
        scopes
    }
}

/// Shared read-mostly policy store.
///
/// Readers load the current map without locking and always observe a
/// complete map; writers serialize on a single lock.
pub struct PolicyStore {
    map: ArcSwap<PolicyMap>,
    writer: Mutex<()>,
    version: AtomicU64,
}

impl PolicyStore {
    /// Create empty store
    pub fn new() -> Self {
        Self {
            map: ArcSwap::from_pointee(PolicyMap::new()),
            writer: Mutex::new(()),
            version: AtomicU64::new(0),
        }
    }

    /// Create with an initial map
    pub fn with_map(map: PolicyMap) -> Self {
        Self {
            map: ArcSwap::from_pointee(map),
            writer: Mutex::new(()),
            version: AtomicU64::new(1),
        }
    }

    /// Current version
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Current map
    pub fn snapshot(&self) -> Arc<PolicyMap> {
        self.map.load_full()
    }

    /// Policy for one group
    pub fn policy(&self, group: &GroupId) -> InheritancePolicy {
        self.map.load().get(group)
    }

    /// Atomically replace the whole map
    pub fn replace(&self, next: PolicyMap) -> PolicySwap {
        let _guard = self.writer.lock();
        let current = Arc::new(next);
        let previous = self.map.swap(current.clone());
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        PolicySwap {
            previous,
            current,
            version,
        }
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> GroupId {
        GroupId::outside("t1", "out1", name)
    }

    #[test]
    fn test_default_policy() {
        let store = PolicyStore::new();
        assert_eq!(store.policy(&group("a")), InheritancePolicy::new(false, false));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_replace_reverts_absent_entries() {
        let store = PolicyStore::with_map(PolicyMap::from_iter([
            (group("a"), InheritancePolicy::new(true, true)),
            (group("b"), InheritancePolicy::new(true, false)),
        ]));
        assert!(store.policy(&group("b")).allowed);

        let swap = store.replace(PolicyMap::from_iter([(
            group("a"),
            InheritancePolicy::new(false, true),
        )]));

        assert_eq!(swap.version, 2);
        assert_eq!(store.policy(&group("a")), InheritancePolicy::new(false, true));
        assert_eq!(store.policy(&group("b")), InheritancePolicy::default());
        assert_eq!(swap.previous.len(), 2);
        assert_eq!(swap.current.len(), 1);
    }

    #[test]
    fn test_affected_scopes_cover_both_maps() {
        let store = PolicyStore::with_map(PolicyMap::from_iter([(
            GroupId::outside("t1", "old-out", "a"),
            InheritancePolicy::new(true, true),
        )]));
        let swap = store.replace(PolicyMap::from_iter([(
            GroupId::outside("t2", "new-out", "a"),
            InheritancePolicy::new(true, true),
        )]));

        let scopes = swap.affected_scopes();
        assert!(scopes.contains(&ScopeId::new("t1", "old-out")));
        assert!(scopes.contains(&ScopeId::new("t2", "new-out")));
        assert_eq!(scopes.len(), 2);
    }

    #[test]
    fn test_in_scope_filters() {
        let map = PolicyMap::from_iter([
            (GroupId::outside("t1", "out1", "a"), InheritancePolicy::new(true, true)),
            (GroupId::outside("t1", "out2", "b"), InheritancePolicy::new(true, true)),
        ]);
        let scope = ScopeId::new("t1", "out1");
        let names: Vec<_> = map.in_scope(&scope).map(|(id, _)| id.name.clone()).collect();
        assert_eq!(names, vec!["a".to_string()]);
    }
}
