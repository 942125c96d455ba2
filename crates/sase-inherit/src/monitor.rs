//! Event Monitor
//!
//! Maps change notifications to reconciliation scopes, drops duplicate
//! and out-of-order deliveries, and coalesces bursts per scope.

use crate::fabric::{ChangedObject, FabricEvent};
use crate::model::ScopeId;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of observing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Sequence already processed for this partition
    Duplicate,
    /// Event does not touch any routed-network boundary
    Ignored,
    /// Scopes to reconcile
    Scopes(BTreeSet<ScopeId>),
}

/// Sequence tracking and scope mapping for the change feed
#[derive(Debug, Default)]
pub struct EventMonitor {
    last_sequence: HashMap<String, u64>,
    known_scopes: BTreeSet<ScopeId>,
}

impl EventMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember scopes for tenant-wide events and gap rescans
    pub fn register_scopes<'a>(&mut self, scopes: impl IntoIterator<Item = &'a ScopeId>) {
        self.known_scopes.extend(scopes.into_iter().cloned());
    }

    pub fn known_scopes(&self) -> &BTreeSet<ScopeId> {
        &self.known_scopes
    }

    /// Forget sequence positions; a fresh subscription may renumber
    pub fn reset_sequences(&mut self) {
        self.last_sequence.clear();
    }

    pub fn observe(&mut self, event: &FabricEvent) -> Observation {
        let last = self.last_sequence.get(&event.partition).copied();
        if let Some(last) = last {
            if event.sequence <= last {
                debug!(partition = %event.partition, sequence = event.sequence, last, "dropping stale event");
                return Observation::Duplicate;
            }
        }
        self.last_sequence
            .insert(event.partition.clone(), event.sequence);

        let mut scopes = self.scopes_for(&event.object);
        self.known_scopes.extend(scopes.iter().cloned());

        if let Some(last) = last {
            if event.sequence > last + 1 {
                warn!(
                    partition = %event.partition,
                    missed = event.sequence - last - 1,
                    "gap in change feed, rescanning known scopes"
                );
                scopes.extend(self.known_scopes.iter().cloned());
            }
        }

        if scopes.is_empty() {
            Observation::Ignored
        } else {
            Observation::Scopes(scopes)
        }
    }

    fn scopes_for(&self, object: &ChangedObject) -> BTreeSet<ScopeId> {
        match object {
            ChangedObject::Subnet { group, .. }
            | ChangedObject::OutsideGroup { group }
            | ChangedObject::Relation { group, .. } => group.scope().into_iter().collect(),
            ChangedObject::InsideGroup { .. } => BTreeSet::new(),
            ChangedObject::Contract { tenant, .. } | ChangedObject::ContractInterface { tenant, .. } => self
                .known_scopes
                .iter()
                .filter(|s| &s.tenant == tenant)
                .cloned()
                .collect(),
        }
    }
}

/// Coalesces requests for the same scope within a fixed window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<ScopeId, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Request a scope; returns false if it was already pending
    pub fn add(&mut self, scope: ScopeId, now: Instant) -> bool {
        if self.pending.contains_key(&scope) {
            return false;
        }
        self.pending.insert(scope, now + self.window);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every scope whose window has closed
    pub fn take_due(&mut self, now: Instant) -> Vec<ScopeId> {
        let mut due: Vec<ScopeId> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(scope, _)| scope.clone())
            .collect();
        for scope in &due {
            self.pending.remove(scope);
        }
        due.sort();
        due
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
