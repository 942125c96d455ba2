//! Scope Work Queue
//!
//! At most one pass per scope is in flight. A request for a busy scope
//! is folded into a single pending rerun instead of a second pass.

use crate::model::ScopeId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeStatus {
    Queued,
    Running,
    /// Running, with another pass requested meanwhile
    Rerun,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<ScopeId>,
    status: HashMap<ScopeId, ScopeStatus>,
    closed: bool,
}

/// What `submit` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Enqueued,
    /// Merged into a request already waiting
    Merged,
    /// Scope is running; a rerun was scheduled
    Deferred,
    Closed,
}

/// Work queue shared by the dispatcher and the worker pool
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, scope: ScopeId) -> Submission {
        let mut state = self.state.lock();
        if state.closed {
            return Submission::Closed;
        }
        match state.status.get(&scope).copied() {
            None => {
                state.status.insert(scope.clone(), ScopeStatus::Queued);
                state.ready.push_back(scope);
                drop(state);
                self.notify.notify_one();
                Submission::Enqueued
            }
            Some(ScopeStatus::Queued) | Some(ScopeStatus::Rerun) => Submission::Merged,
            Some(ScopeStatus::Running) => {
                state.status.insert(scope, ScopeStatus::Rerun);
                Submission::Deferred
            }
        }
    }

    /// Next scope to reconcile; `None` once the queue is closed
    pub async fn next(&self) -> Option<ScopeId> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(scope) = state.ready.pop_front() {
                    state.status.insert(scope.clone(), ScopeStatus::Running);
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(scope);
                }
            }
            notified.await;
        }
    }

    /// Mark a pass finished; requeues the scope if a rerun was requested
    pub fn complete(&self, scope: &ScopeId) {
        let mut state = self.state.lock();
        match state.status.get(scope).copied() {
            Some(ScopeStatus::Rerun) if !state.closed => {
                state.status.insert(scope.clone(), ScopeStatus::Queued);
                state.ready.push_back(scope.clone());
                drop(state);
                self.notify.notify_one();
            }
            _ => {
                state.status.remove(scope);
            }
        }
    }

    /// Stop handing out work; returns scopes that never started
    pub fn close(&self) -> Vec<ScopeId> {
        let dropped = {
            let mut state = self.state.lock();
            state.closed = true;
            let dropped: Vec<ScopeId> = state.ready.drain(..).collect();
            for scope in &dropped {
                state.status.remove(scope);
            }
            dropped
        };
        self.notify.notify_waiters();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Scopes queued or running
    pub fn outstanding(&self) -> usize {
        self.state.lock().status.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn scope(name: &str) -> ScopeId {
        ScopeId::new("t1", name)
    }

    #[tokio::test]
    async fn test_duplicate_submissions_merge() {
        let queue = WorkQueue::new();
        assert_eq!(queue.submit(scope("a")), Submission::Enqueued);
        assert_eq!(queue.submit(scope("a")), Submission::Merged);
        assert_eq!(queue.submit(scope("b")), Submission::Enqueued);

        assert_eq!(queue.next().await, Some(scope("a")));
        assert_eq!(queue.next().await, Some(scope("b")));
    }

    #[test]
    fn test_next_pending_until_submit() {
        let queue = WorkQueue::new();
        let mut next = tokio_test::task::spawn(queue.next());
        tokio_test::assert_pending!(next.poll());

        queue.submit(scope("a"));
        assert!(next.is_woken());
        assert_eq!(tokio_test::assert_ready!(next.poll()), Some(scope("a")));
    }

    #[tokio::test]
    async fn test_busy_scope_reruns_once() {
        let queue = WorkQueue::new();
        queue.submit(scope("a"));
        let running = queue.next().await.unwrap();

        assert_eq!(queue.submit(scope("a")), Submission::Deferred);
        assert_eq!(queue.submit(scope("a")), Submission::Merged);
        assert_eq!(queue.outstanding(), 1);

        queue.complete(&running);
        assert_eq!(queue.next().await, Some(scope("a")));
        queue.complete(&scope("a"));
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_drops_queued() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.submit(scope("a"));
        assert_eq!(waiter.await.unwrap(), Some(scope("a")));

        queue.submit(scope("b"));
        let dropped = queue.close();
        assert_eq!(dropped, vec![scope("b")]);
        assert_eq!(queue.next().await, None);
        assert_eq!(queue.submit(scope("c")), Submission::Closed);
    }

    #[tokio::test]
    async fn test_no_rerun_after_close() {
        let queue = WorkQueue::new();
        queue.submit(scope("a"));
        let running = queue.next().await.unwrap();
        queue.submit(scope("a"));
        queue.close();
        queue.complete(&running);
        assert_eq!(queue.outstanding(), 0);
    }
}
