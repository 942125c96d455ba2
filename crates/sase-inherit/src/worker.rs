//! Scope Reconciliation Pass
//!
//! fetch → topology → resolve → diff → push for one boundary, with
//! bounded backoff on transient failures and a fresh recompute (never a
//! blind resend) when the fabric rejects part of a delta.

use crate::error::{InheritError, Result};
use crate::fabric::FabricClient;
use crate::model::{GroupId, ScopeId, ScopeSnapshot};
use crate::policy::{PolicyMap, PolicyStore};
use crate::reconciler::{plan, ChangeAction, Delta};
use crate::resolver::resolve;
use crate::retry::RetryPolicy;
use crate::topology::Topology;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Delta that converges one snapshot under the given policies
pub fn compute_delta(snapshot: &ScopeSnapshot, policies: &PolicyMap) -> Delta {
    let topology = Topology::from_snapshot(snapshot);
    let desired = resolve(snapshot, &topology, policies);
    plan(snapshot, &desired)
}

/// Policy entries of `scope` whose group is missing from the snapshot
pub fn unknown_groups(snapshot: &ScopeSnapshot, policies: &PolicyMap) -> Vec<GroupId> {
    policies
        .in_scope(&snapshot.scope)
        .filter(|(id, _)| !snapshot.contains_group(id))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Summary of one completed pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub scope: ScopeId,
    /// Changes the fabric accepted
    pub applied: usize,
    /// Fresh recomputes after partially rejected pushes
    pub conflicts_recomputed: u32,
    pub unknown_groups: Vec<GroupId>,
}

impl PassReport {
    fn new(scope: &ScopeId) -> Self {
        Self {
            scope: scope.clone(),
            applied: 0,
            conflicts_recomputed: 0,
            unknown_groups: Vec::new(),
        }
    }
}

/// Runs reconciliation passes against one fabric
#[derive(Clone)]
pub struct ScopeWorker {
    client: Arc<dyn FabricClient>,
    policies: Arc<PolicyStore>,
    retry: RetryPolicy,
    max_conflict_recomputes: u32,
    shutdown: watch::Receiver<bool>,
}

impl ScopeWorker {
    pub fn new(
        client: Arc<dyn FabricClient>,
        policies: Arc<PolicyStore>,
        retry: RetryPolicy,
        max_conflict_recomputes: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            policies,
            retry,
            max_conflict_recomputes,
            shutdown,
        }
    }

    /// Reconcile one scope until its push is accepted in full
    pub async fn run_pass(&self, scope: &ScopeId) -> Result<PassReport> {
        let mut report = PassReport::new(scope);

        loop {
            let snapshot = self
                .with_retry(scope, "deep fetch", || self.client.deep_fetch(scope))
                .await?;
            let policies = self.policies.snapshot();

            report.unknown_groups = unknown_groups(&snapshot, &policies);
            for group in &report.unknown_groups {
                warn!(scope = %scope, error = %InheritError::UnknownGroup(group.clone()), "skipping policy entry");
            }

            let delta = compute_delta(&snapshot, &policies);
            if delta.is_empty() {
                debug!(scope = %scope, "scope already converged");
                return Ok(report);
            }
            for change in &delta.changes {
                debug!(scope = %scope, "{}", change);
                let detaching = matches!(change.action, ChangeAction::Detach);
                if !detaching && !snapshot.defines_target(&change.relation) {
                    warn!(scope = %scope, relation = %change.relation, "relation target not defined in tenant");
                }
            }

            let pushed = self
                .with_retry(scope, "push", || self.client.push(&delta))
                .await?;
            report.applied += pushed.applied();

            if pushed.is_clean() {
                info!(scope = %scope, applied = pushed.applied(), "scope reconciled");
                return Ok(report);
            }

            report.conflicts_recomputed += 1;
            if report.conflicts_recomputed > self.max_conflict_recomputes {
                return Err(InheritError::StateConflict(format!(
                    "{}: {} conflicts, {} failures after {} recomputes",
                    scope,
                    pushed.conflicts(),
                    pushed.failures(),
                    self.max_conflict_recomputes
                )));
            }
            warn!(
                scope = %scope,
                conflicts = pushed.conflicts(),
                failures = pushed.failures(),
                "push partially rejected, recomputing from a fresh snapshot"
            );
            if *self.shutdown.borrow() {
                debug!(scope = %scope, "shutdown requested, abandoning recompute");
                return Err(InheritError::Shutdown);
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, scope: &ScopeId, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            failures += 1;
            if !self.retry.should_retry(failures) {
                return Err(match err {
                    InheritError::AuthRejected(reason) => InheritError::FatalAuth(reason),
                    other => other,
                });
            }

            let delay = self.retry.delay(failures);
            warn!(scope = %scope, attempt = failures, ?delay, error = %err, "{} failed, backing off", what);

            let mut shutdown = self.shutdown.clone();
            if *shutdown.borrow() {
                return Err(InheritError::Shutdown);
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Err(InheritError::Shutdown),
            }
        }
    }
}
