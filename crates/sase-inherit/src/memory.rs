//! In-memory fabric (for testing and offline planning)
//!
//! Holds per-scope state, applies deltas with optimistic tag checks and
//! publishes change notifications the way a live controller would,
//! including for the engine's own pushes.

use crate::config::ConnectionConfig;
use crate::error::{InheritError, Result};
use crate::fabric::{ChangedObject, FabricClient, FabricEvent, ItemOutcome, PushReport};
use crate::model::{GroupId, OutsideGroup, ProvenanceTag, RelationKey, ScopeId, ScopeSnapshot};
use crate::reconciler::{ChangeAction, Delta, RelationChange};
use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

const FEED_CAPACITY: usize = 1024;

type ExternalEdit = Box<dyn FnOnce(&mut ScopeSnapshot) + Send>;

#[derive(Default)]
struct Faults {
    fetch_failures: u32,
    auth_rejections: u32,
    push_failures: u32,
    item_failures: u32,
    edit_after_fetch: Option<ExternalEdit>,
}

/// In-memory fabric controller
pub struct InMemoryFabric {
    scopes: DashMap<ScopeId, ScopeSnapshot>,
    sequences: DashMap<String, u64>,
    subscribers: Mutex<Vec<mpsc::Sender<FabricEvent>>>,
    faults: Mutex<Faults>,
    connection: Mutex<Option<ConnectionConfig>>,
    fetches: AtomicU64,
    pushes: AtomicU64,
    pushed_changes: AtomicU64,
}

impl InMemoryFabric {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
            sequences: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            connection: Mutex::new(None),
            fetches: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
            pushed_changes: AtomicU64::new(0),
        }
    }

    /// Seed from snapshots (no notifications)
    pub fn with_snapshots(snapshots: impl IntoIterator<Item = ScopeSnapshot>) -> Self {
        let fabric = Self::new();
        for snapshot in snapshots {
            fabric.scopes.insert(snapshot.scope.clone(), snapshot);
        }
        fabric
    }

    // ------------------------------------------------------------------
    // Operator-side edits
    // ------------------------------------------------------------------

    /// Create an empty outside group
    pub fn add_group(&self, group: &GroupId) {
        if let Some(scope) = group.scope() {
            self.edit_scope(&scope, |snap| {
                if !snap.contains_group(group) {
                    snap.groups.push(OutsideGroup::new(group.clone()));
                }
            });
            self.emit(&group.tenant, ChangedObject::OutsideGroup { group: group.clone() });
        }
    }

    pub fn remove_group(&self, group: &GroupId) {
        if let Some(scope) = group.scope() {
            self.edit_scope(&scope, |snap| snap.groups.retain(|g| &g.id != group));
            self.emit(&group.tenant, ChangedObject::OutsideGroup { group: group.clone() });
        }
    }

    pub fn add_subnet(&self, group: &GroupId, prefix: IpNet) {
        self.edit_group(group, |g| {
            g.subnets.insert(prefix);
        });
        self.emit(
            &group.tenant,
            ChangedObject::Subnet {
                group: group.clone(),
                prefix,
            },
        );
    }

    pub fn remove_subnet(&self, group: &GroupId, prefix: IpNet) {
        self.edit_group(group, |g| {
            g.subnets.remove(&prefix);
        });
        self.emit(
            &group.tenant,
            ChangedObject::Subnet {
                group: group.clone(),
                prefix,
            },
        );
    }

    /// Operator adds a relation (untagged)
    pub fn add_relation(&self, group: &GroupId, relation: RelationKey) {
        self.edit_group(group, |g| {
            g.relations.insert(relation.clone());
        });
        self.emit(
            &group.tenant,
            ChangedObject::Relation {
                group: group.clone(),
                relation,
            },
        );
    }

    /// Operator removes a relation; the tag, if any, is left behind
    pub fn remove_relation(&self, group: &GroupId, relation: RelationKey) {
        self.edit_group(group, |g| {
            g.relations.remove(&relation);
        });
        self.emit(
            &group.tenant,
            ChangedObject::Relation {
                group: group.clone(),
                relation,
            },
        );
    }

    /// Define a contract in every scope of the tenant
    pub fn add_contract(&self, tenant: &str, name: &str) {
        for mut entry in self.scopes.iter_mut() {
            if entry.key().tenant == tenant {
                entry.value_mut().contracts.insert(name.to_string());
            }
        }
        self.emit(
            tenant,
            ChangedObject::Contract {
                tenant: tenant.to_string(),
                name: name.to_string(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn group(&self, group: &GroupId) -> Option<OutsideGroup> {
        let scope = group.scope()?;
        self.scopes.get(&scope)?.group(group).cloned()
    }

    pub fn snapshot(&self, scope: &ScopeId) -> Option<ScopeSnapshot> {
        self.scopes.get(scope).map(|s| s.clone())
    }

    pub fn snapshots(&self) -> Vec<ScopeSnapshot> {
        let mut all: Vec<_> = self.scopes.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.scope.cmp(&b.scope));
        all
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// Changes applied or attempted across all pushes
    pub fn pushed_change_count(&self) -> u64 {
        self.pushed_changes.load(Ordering::Relaxed)
    }

    pub fn connection(&self) -> Option<ConnectionConfig> {
        self.connection.lock().clone()
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    pub fn fail_next_fetches(&self, count: u32) {
        self.faults.lock().fetch_failures = count;
    }

    pub fn reject_auth_next(&self, count: u32) {
        self.faults.lock().auth_rejections = count;
    }

    pub fn fail_next_pushes(&self, count: u32) {
        self.faults.lock().push_failures = count;
    }

    /// Fail the next `count` pushed items individually
    pub fn fail_next_items(&self, count: u32) {
        self.faults.lock().item_failures = count;
    }

    /// Apply an external edit right after the next fetch is served
    pub fn edit_after_next_fetch(&self, edit: impl FnOnce(&mut ScopeSnapshot) + Send + 'static) {
        self.faults.lock().edit_after_fetch = Some(Box::new(edit));
    }

    // ------------------------------------------------------------------
    // Feed
    // ------------------------------------------------------------------

    /// Publish a notification with the next sequence number of `partition`
    pub fn emit(&self, partition: &str, object: ChangedObject) {
        let sequence = {
            let mut seq = self.sequences.entry(partition.to_string()).or_insert(0);
            *seq += 1;
            *seq
        };
        self.publish(FabricEvent {
            partition: partition.to_string(),
            sequence,
            object,
        });
    }

    /// Publish a notification as-is (redelivery, reordering)
    pub fn publish(&self, event: FabricEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(partition = %event.partition, sequence = event.sequence, "feed full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Drop every open subscription, as a controller restart would
    pub fn close_subscriptions(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn edit_scope(&self, scope: &ScopeId, edit: impl FnOnce(&mut ScopeSnapshot)) {
        let mut snap = self
            .scopes
            .entry(scope.clone())
            .or_insert_with(|| ScopeSnapshot::empty(scope.clone()));
        edit(snap.value_mut());
    }

    fn edit_group(&self, group: &GroupId, edit: impl FnOnce(&mut OutsideGroup)) {
        let Some(scope) = group.scope() else {
            return;
        };
        self.edit_scope(&scope, |snap| {
            if !snap.contains_group(group) {
                snap.groups.push(OutsideGroup::new(group.clone()));
            }
            if let Some(g) = snap.groups.iter_mut().find(|g| &g.id == group) {
                edit(g);
            }
        });
    }
}

impl Default for InMemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one change to a group, checking the expected tag state first
fn apply_change(group: &mut OutsideGroup, change: &RelationChange) -> ItemOutcome {
    let current = group.tag(&change.relation).map(|t| t.contributors.clone());
    if current != change.expected {
        return ItemOutcome::Conflict(format!(
            "tag for {} on {} changed since snapshot",
            change.relation, change.group
        ));
    }

    match &change.action {
        ChangeAction::Attach { contributors } | ChangeAction::Retag { contributors } => {
            if contributors.is_empty() {
                return ItemOutcome::Failed("empty contributor set".to_string());
            }
            group.relations.insert(change.relation.clone());
            group.set_tag(ProvenanceTag::new(change.relation.clone(), contributors.clone()));
        }
        ChangeAction::Detach => {
            group.relations.remove(&change.relation);
            group.tags.remove(&change.relation);
        }
    }
    ItemOutcome::Applied
}

#[async_trait]
impl FabricClient for InMemoryFabric {
    async fn deep_fetch(&self, scope: &ScopeId) -> Result<ScopeSnapshot> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let edit = {
            let mut faults = self.faults.lock();
            if faults.auth_rejections > 0 {
                faults.auth_rejections -= 1;
                return Err(InheritError::AuthRejected("401 Unauthorized".to_string()));
            }
            if faults.fetch_failures > 0 {
                faults.fetch_failures -= 1;
                return Err(InheritError::Communication("connection reset".to_string()));
            }
            faults.edit_after_fetch.take()
        };

        let snapshot = self
            .snapshot(scope)
            .unwrap_or_else(|| ScopeSnapshot::empty(scope.clone()));

        if let Some(edit) = edit {
            self.edit_scope(scope, edit);
        }
        Ok(snapshot)
    }

    async fn push(&self, delta: &Delta) -> Result<PushReport> {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        let mut item_failures = {
            let mut faults = self.faults.lock();
            if faults.push_failures > 0 {
                faults.push_failures -= 1;
                return Err(InheritError::Communication("push timed out".to_string()));
            }
            std::mem::take(&mut faults.item_failures)
        };

        let mut report = PushReport::default();
        let mut applied = Vec::new();
        {
            let mut snap = self
                .scopes
                .entry(delta.scope.clone())
                .or_insert_with(|| ScopeSnapshot::empty(delta.scope.clone()));
            for change in &delta.changes {
                self.pushed_changes.fetch_add(1, Ordering::Relaxed);
                if item_failures > 0 {
                    item_failures -= 1;
                    report.outcomes.push(ItemOutcome::Failed("item rejected".to_string()));
                    continue;
                }
                let outcome = match snap.groups.iter_mut().find(|g| g.id == change.group) {
                    Some(group) => apply_change(group, change),
                    None => ItemOutcome::Conflict(format!("group {} no longer exists", change.group)),
                };
                if outcome == ItemOutcome::Applied {
                    applied.push(change.clone());
                }
                report.outcomes.push(outcome);
            }
        }
        if item_failures > 0 {
            self.faults.lock().item_failures = item_failures;
        }

        for change in applied {
            let tenant = change.group.tenant.clone();
            self.emit(
                &tenant,
                ChangedObject::Relation {
                    group: change.group,
                    relation: change.relation,
                },
            );
        }
        Ok(report)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<FabricEvent>> {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        self.subscribers.lock().push(tx);
        Ok(rx)
    }

    fn update_connection(&self, connection: &ConnectionConfig) {
        *self.connection.lock() = Some(connection.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn id(name: &str) -> GroupId {
        GroupId::outside("t1", "out1", name)
    }

    fn scope() -> ScopeId {
        ScopeId::new("t1", "out1")
    }

    fn attach(name: &str, expected: Option<BTreeSet<GroupId>>) -> RelationChange {
        RelationChange {
            group: id(name),
            relation: RelationKey::provides("c1"),
            expected,
            action: ChangeAction::Attach {
                contributors: BTreeSet::from([id("parent")]),
            },
        }
    }

    #[tokio::test]
    async fn test_push_applies_and_notifies() {
        let fabric = InMemoryFabric::new();
        fabric.add_group(&id("child"));
        let mut feed = fabric.subscribe().await.unwrap();

        let delta = Delta {
            scope: scope(),
            changes: vec![attach("child", None)],
        };
        let report = fabric.push(&delta).await.unwrap();
        assert!(report.is_clean());

        let child = fabric.group(&id("child")).unwrap();
        assert!(child.holds(&RelationKey::provides("c1")));
        assert_eq!(child.tag(&RelationKey::provides("c1")).unwrap().count(), 1);

        let event = feed.recv().await.unwrap();
        assert_eq!(event.sequence, 2);
        assert!(matches!(event.object, ChangedObject::Relation { .. }));
    }

    #[tokio::test]
    async fn test_push_conflict_on_stale_expectation() {
        let fabric = InMemoryFabric::new();
        fabric.add_group(&id("child"));

        let stale = Delta {
            scope: scope(),
            changes: vec![attach("child", Some(BTreeSet::from([id("ghost")])))],
        };
        let report = fabric.push(&stale).await.unwrap();
        assert_eq!(report.conflicts(), 1);
        assert!(!fabric.group(&id("child")).unwrap().holds(&RelationKey::provides("c1")));
    }

    #[tokio::test]
    async fn test_fetch_faults() {
        let fabric = InMemoryFabric::new();
        fabric.reject_auth_next(1);
        fabric.fail_next_fetches(1);

        assert!(matches!(
            fabric.deep_fetch(&scope()).await,
            Err(InheritError::AuthRejected(_))
        ));
        assert!(matches!(
            fabric.deep_fetch(&scope()).await,
            Err(InheritError::Communication(_))
        ));
        let snap = fabric.deep_fetch(&scope()).await.unwrap();
        assert!(snap.groups.is_empty());
        assert_eq!(fabric.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_edit_after_fetch_diverges_state() {
        let fabric = InMemoryFabric::new();
        fabric.add_group(&id("child"));
        fabric.edit_after_next_fetch(|snap| snap.groups.clear());

        let seen = fabric.deep_fetch(&scope()).await.unwrap();
        assert_eq!(seen.groups.len(), 1);
        assert!(fabric.group(&id("child")).is_none());
    }

    #[tokio::test]
    async fn test_closed_subscribers_pruned() {
        let fabric = InMemoryFabric::new();
        let feed = fabric.subscribe().await.unwrap();
        assert_eq!(fabric.subscriber_count(), 1);
        drop(feed);
        fabric.add_group(&id("a"));
        assert_eq!(fabric.subscriber_count(), 0);
    }
}
