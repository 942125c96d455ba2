//! Inheritance Controller
//!
//! Control handle over one dispatcher task and a fixed worker pool.
//!
//! ```text
//!   change feed ──► dispatcher ──► EventMonitor ──► Debouncer ──┐
//!                      ▲                                        │
//!   ingest_config ─► PolicyStore ─► affected scopes ────────────┤
//!                                                               ▼
//!                            FabricClient ◄── workers ◄── WorkQueue
//! ```

use crate::config::{ControllerSettings, InheritConfig};
use crate::error::{InheritError, Result};
use crate::fabric::{FabricClient, FabricEvent};
use crate::model::ScopeId;
use crate::monitor::{Debouncer, EventMonitor, Observation};
use crate::policy::{PolicyMap, PolicyStore};
use crate::queue::{Submission, WorkQueue};
use crate::retry::RetryPolicy;
use crate::worker::ScopeWorker;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ControllerStatus {
    Running,
    /// Stopped by a fatal authentication failure
    Halted(String),
    Stopped,
}

/// Controller counters (atomic, lock-free)
#[derive(Debug, Default)]
pub struct ControllerStats {
    /// Notifications received from the feed
    pub events: AtomicU64,
    /// Notifications dropped as redelivered or reordered
    pub duplicate_events: AtomicU64,
    /// Completed passes
    pub passes: AtomicU64,
    /// Passes that ended in an error
    pub failed_passes: AtomicU64,
    /// Changes accepted by the fabric
    pub applied_changes: AtomicU64,
    /// Feed resubscriptions after a closed feed
    pub resubscriptions: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStatsSnapshot {
    pub events: u64,
    pub duplicate_events: u64,
    pub passes: u64,
    pub failed_passes: u64,
    pub applied_changes: u64,
    pub resubscriptions: u64,
}

impl ControllerStats {
    pub fn snapshot(&self) -> ControllerStatsSnapshot {
        ControllerStatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_events.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            failed_passes: self.failed_passes.load(Ordering::Relaxed),
            applied_changes: self.applied_changes.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
        }
    }
}

/// Requests from the handle to the dispatcher
#[derive(Debug)]
enum Control {
    Reconcile(BTreeSet<ScopeId>),
    RescanAll,
}

struct Shared {
    client: Arc<dyn FabricClient>,
    policies: Arc<PolicyStore>,
    queue: WorkQueue,
    status: Mutex<ControllerStatus>,
    stats: ControllerStats,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn halt(&self, reason: String) {
        {
            let mut status = self.status.lock();
            if *status != ControllerStatus::Running {
                return;
            }
            *status = ControllerStatus::Halted(reason.clone());
        }
        error!(reason = %reason, "credentials rejected, halting reconciliation");
        self.shutdown.send_replace(true);
        self.queue.close();
    }

    fn submit(&self, scope: ScopeId) {
        match self.queue.submit(scope.clone()) {
            Submission::Enqueued => debug!(scope = %scope, "scope queued"),
            Submission::Merged | Submission::Deferred => debug!(scope = %scope, "merged into pending pass"),
            Submission::Closed => debug!(scope = %scope, "queue closed, request dropped"),
        }
    }
}

/// Handle to a running inheritance controller
pub struct InheritanceController {
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InheritanceController {
    /// Open the change feed, then spawn the dispatcher and worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(client: Arc<dyn FabricClient>, settings: ControllerSettings) -> Result<Self> {
        let feed = subscribe_with_retry(client.as_ref(), &settings.retry).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            client,
            policies: Arc::new(PolicyStore::new()),
            queue: WorkQueue::new(),
            status: Mutex::new(ControllerStatus::Running),
            stats: ControllerStats::default(),
            shutdown: shutdown_tx,
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let workers = settings.workers.max(1);
        let mut tasks = Vec::with_capacity(workers + 1);

        let dispatcher = Dispatcher::new(shared.clone(), &settings, feed, control_rx, shutdown_rx.clone());
        tasks.push(tokio::spawn(dispatcher.run()));

        for id in 0..workers {
            let worker = ScopeWorker::new(
                shared.client.clone(),
                shared.policies.clone(),
                settings.retry.clone(),
                settings.max_conflict_recomputes,
                shutdown_rx.clone(),
            );
            tasks.push(tokio::spawn(work(id, shared.clone(), worker)));
        }

        info!(workers, debounce = ?settings.debounce, "inheritance controller started");

        Ok(Self {
            shared,
            control: control_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Validate and apply a configuration document.
    ///
    /// The policy map is replaced wholesale; every scope named by the old
    /// or the new map is scheduled for reconciliation. On a validation
    /// error the previous map stays in force. Returns the new policy
    /// version.
    pub fn ingest_config(&self, document: &serde_json::Value) -> Result<u64> {
        if *self.shared.status.lock() != ControllerStatus::Running {
            return Err(InheritError::Shutdown);
        }

        let config = InheritConfig::from_value(document).map_err(|err| {
            warn!(error = %err, "configuration rejected, keeping previous policies");
            err
        })?;

        self.shared.client.update_connection(&config.connection);
        let swap = self.shared.policies.replace(config.policy_map());
        let scopes = swap.affected_scopes();

        info!(
            version = swap.version,
            policies = swap.current.len(),
            scopes = scopes.len(),
            "policy configuration replaced"
        );

        if self.control.send(Control::Reconcile(scopes)).is_err() {
            warn!("dispatcher stopped, reconciliation not scheduled");
        }
        Ok(swap.version)
    }

    /// Request a pass over every known scope
    pub fn rescan(&self) {
        if self.control.send(Control::RescanAll).is_err() {
            warn!("dispatcher stopped, rescan not scheduled");
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.shared.status.lock().clone()
    }

    pub fn stats(&self) -> ControllerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Policies currently in force
    pub fn policies(&self) -> Arc<PolicyMap> {
        self.shared.policies.snapshot()
    }

    pub fn policy_version(&self) -> u64 {
        self.shared.policies.version()
    }

    /// Stop accepting work, let in-flight passes finish and close the feed.
    ///
    /// Scopes queued but not yet started are discarded. Returns
    /// `FatalAuth` if the controller had halted on rejected credentials.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down inheritance controller");
        self.shared.shutdown.send_replace(true);

        let dropped = self.shared.queue.close();
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), "discarding queued scopes");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "controller task failed");
            }
        }

        let mut status = self.shared.status.lock();
        if let ControllerStatus::Halted(reason) = &*status {
            return Err(InheritError::FatalAuth(reason.clone()));
        }
        *status = ControllerStatus::Stopped;
        info!("inheritance controller stopped");
        Ok(())
    }
}

impl Drop for InheritanceController {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        self.shared.queue.close();
    }
}

async fn subscribe_with_retry(
    client: &dyn FabricClient,
    retry: &RetryPolicy,
) -> Result<mpsc::Receiver<FabricEvent>> {
    let mut failures = 0;
    loop {
        let err = match client.subscribe().await {
            Ok(feed) => return Ok(feed),
            Err(err) if err.is_transient() => err,
            Err(err) => return Err(err),
        };
        failures += 1;
        if !retry.should_retry(failures) {
            return Err(match err {
                InheritError::AuthRejected(reason) => InheritError::FatalAuth(reason),
                other => other,
            });
        }
        let delay = retry.delay(failures);
        warn!(attempt = failures, ?delay, error = %err, "subscribe failed, backing off");
        tokio::time::sleep(delay).await;
    }
}

/// Worker loop: one pass at a time until the queue closes
async fn work(id: usize, shared: Arc<Shared>, worker: ScopeWorker) {
    debug!(worker = id, "worker started");

    while let Some(scope) = shared.queue.next().await {
        match worker.run_pass(&scope).await {
            Ok(report) => {
                shared.stats.passes.fetch_add(1, Ordering::Relaxed);
                shared
                    .stats
                    .applied_changes
                    .fetch_add(report.applied as u64, Ordering::Relaxed);
                debug!(
                    worker = id,
                    scope = %scope,
                    applied = report.applied,
                    recomputed = report.conflicts_recomputed,
                    unknown = report.unknown_groups.len(),
                    "pass finished"
                );
            }
            Err(InheritError::Shutdown) => {
                debug!(worker = id, scope = %scope, "pass abandoned on shutdown");
            }
            Err(InheritError::FatalAuth(reason)) => {
                shared.stats.failed_passes.fetch_add(1, Ordering::Relaxed);
                shared.halt(reason);
            }
            Err(err) => {
                shared.stats.failed_passes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = id,
                    scope = %scope,
                    error = %err,
                    "pass failed, scope left for the next event or resync"
                );
            }
        }
        shared.queue.complete(&scope);
    }

    debug!(worker = id, "worker stopped");
}

/// Feed consumer and request router
struct Dispatcher {
    shared: Arc<Shared>,
    monitor: EventMonitor,
    debouncer: Debouncer,
    feed: Option<mpsc::Receiver<FabricEvent>>,
    resubscribe_at: Option<Instant>,
    resubscribe_failures: u32,
    retry: RetryPolicy,
    resync: Option<Interval>,
    control: mpsc::UnboundedReceiver<Control>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    fn new(
        shared: Arc<Shared>,
        settings: &ControllerSettings,
        feed: mpsc::Receiver<FabricEvent>,
        control: mpsc::UnboundedReceiver<Control>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let resync = settings.resync_interval.map(|period| {
            let mut resync = interval_at(Instant::now() + period, period);
            resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
            resync
        });

        Self {
            shared,
            monitor: EventMonitor::new(),
            debouncer: Debouncer::new(settings.debounce),
            feed: Some(feed),
            resubscribe_at: None,
            resubscribe_failures: 0,
            retry: settings.retry.clone(),
            resync,
            control,
            shutdown,
        }
    }

    async fn run(mut self) {
        debug!("dispatcher started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                event = next_event(&mut self.feed) => match event {
                    Some(event) => self.on_event(event),
                    None => self.on_feed_closed(),
                },

                Some(control) = self.control.recv() => self.on_control(control),

                _ = sleep_until(self.debouncer.next_deadline()) => self.release_due(),

                _ = sleep_until(self.resubscribe_at) => self.resubscribe().await,

                _ = tick(&mut self.resync) => self.rescan_all("periodic resync"),
            }
        }

        debug!("dispatcher stopped");
    }

    fn on_event(&mut self, event: FabricEvent) {
        self.shared.stats.events.fetch_add(1, Ordering::Relaxed);
        match self.monitor.observe(&event) {
            Observation::Duplicate => {
                self.shared.stats.duplicate_events.fetch_add(1, Ordering::Relaxed);
            }
            Observation::Ignored => {}
            Observation::Scopes(scopes) => {
                let now = Instant::now();
                for scope in scopes {
                    self.debouncer.add(scope, now);
                }
            }
        }
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Reconcile(scopes) => {
                self.monitor.register_scopes(&scopes);
                for scope in scopes {
                    self.shared.submit(scope);
                }
            }
            Control::RescanAll => self.rescan_all("requested"),
        }
    }

    fn release_due(&mut self) {
        for scope in self.debouncer.take_due(Instant::now()) {
            self.shared.submit(scope);
        }
    }

    fn on_feed_closed(&mut self) {
        warn!("change feed closed, resubscribing");
        self.feed = None;
        self.resubscribe_failures = 0;
        self.resubscribe_at = Some(Instant::now() + self.retry.base_delay);
    }

    async fn resubscribe(&mut self) {
        self.resubscribe_at = None;
        match self.shared.client.subscribe().await {
            Ok(feed) => {
                info!(failures = self.resubscribe_failures, "change feed resubscribed");
                self.feed = Some(feed);
                self.resubscribe_failures = 0;
                self.shared.stats.resubscriptions.fetch_add(1, Ordering::Relaxed);
                // Events may have been lost and the new feed may renumber
                self.monitor.reset_sequences();
                self.rescan_all("resubscribed");
            }
            Err(err) => {
                self.resubscribe_failures += 1;
                if let InheritError::AuthRejected(reason) = &err {
                    if !self.retry.should_retry(self.resubscribe_failures) {
                        self.shared.halt(reason.clone());
                        return;
                    }
                }
                let delay = self.retry.delay(self.resubscribe_failures);
                warn!(attempt = self.resubscribe_failures, ?delay, error = %err, "resubscribe failed");
                self.resubscribe_at = Some(Instant::now() + delay);
            }
        }
    }

    fn rescan_all(&mut self, reason: &str) {
        let scopes = self.monitor.known_scopes().clone();
        info!(scopes = scopes.len(), reason, "rescanning known scopes");
        for scope in scopes {
            self.shared.submit(scope);
        }
    }
}

async fn next_event(feed: &mut Option<mpsc::Receiver<FabricEvent>>) -> Option<FabricEvent> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(resync) => {
            resync.tick().await;
        }
        None => std::future::pending().await,
    }
}
