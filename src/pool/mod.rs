//! Priority-queued, deduplicated pool of pending slice fetches.
//!
//! The pool guarantees at most one outstanding fetch per slice id across all
//! priority classes. This is the core concurrency contract: when the volume
//! streamer and an independent slice load target the same identity
//! concurrently, only one transport request ever runs.
//!
//! # Scheduling
//!
//! Two priority classes exist: `Interaction` dispatches before `Prefetch`,
//! FIFO within a class. Execution is bounded by a semaphore; each dispatched
//! request runs as its own task, so completions arrive in arbitrary order.
//!
//! Failures are delivered to the failing request's callback only and are not
//! retried by the pool; retry policy belongs to the caller.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::FetchError;
use crate::io::FetchPayload;

/// Default bound on concurrently executing fetches.
pub const DEFAULT_MAX_CONCURRENT: usize = 6;

/// Boxed future produced by a fetch function.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchPayload, FetchError>> + Send>>;

/// Deferred fetch: invoked when the pool dispatches the request.
pub type FetchFn = Box<dyn FnOnce() -> FetchFuture + Send>;

/// Success continuation, run after the outstanding marker is cleared.
pub type SuccessFn = Box<dyn FnOnce(FetchPayload) + Send>;

/// Failure continuation, run after the outstanding marker is cleared.
pub type FailureFn = Box<dyn FnOnce(FetchError) + Send>;

// =============================================================================
// Priority
// =============================================================================

/// Scheduling class of a fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPriority {
    /// Demanded by direct interaction; always dispatched first.
    Interaction,

    /// Speculative fetch ahead of demand; lowest priority.
    Prefetch,
}

impl RequestPriority {
    fn index(self) -> usize {
        match self {
            RequestPriority::Interaction => 0,
            RequestPriority::Prefetch => 1,
        }
    }
}

// =============================================================================
// Pool internals
// =============================================================================

struct PendingRequest {
    slice_id: Arc<str>,
    volume_id: Option<Arc<str>>,
    fetch: FetchFn,
    on_success: SuccessFn,
    on_failure: FailureFn,
}

#[derive(Default)]
struct PoolState {
    /// Queued-but-not-started requests, one queue per priority class.
    queues: [VecDeque<PendingRequest>; 2],

    /// Ids whose fetch is currently executing.
    executing: HashSet<Arc<str>>,
}

impl PoolState {
    fn is_outstanding(&self, slice_id: &str) -> bool {
        self.executing.contains(slice_id)
            || self
                .queues
                .iter()
                .any(|queue| queue.iter().any(|req| req.slice_id.as_ref() == slice_id))
    }

    /// Pop the next request honoring priority order, marking it executing.
    fn pop_next(&mut self) -> Option<PendingRequest> {
        for queue in self.queues.iter_mut() {
            if let Some(request) = queue.pop_front() {
                self.executing.insert(request.slice_id.clone());
                return Some(request);
            }
        }
        None
    }
}

/// Pending (not yet started) request ids per priority class, in queue order.
#[derive(Debug, Clone, Default)]
pub struct RequestPoolSnapshot {
    pub interaction: Vec<Arc<str>>,
    pub prefetch: Vec<Arc<str>>,
}

impl RequestPoolSnapshot {
    /// Total number of pending requests across both classes.
    pub fn pending_count(&self) -> usize {
        self.interaction.len() + self.prefetch.len()
    }
}

// =============================================================================
// Request Pool Manager
// =============================================================================

/// Deduplicated, priority-ordered fetch scheduler.
///
/// Cheap to clone; clones share the same queues and concurrency bound.
#[derive(Clone)]
pub struct RequestPoolManager {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl RequestPoolManager {
    /// Create a pool with the default concurrency bound.
    pub fn new() -> Self {
        Self::with_concurrency(DEFAULT_MAX_CONCURRENT)
    }

    /// Create a pool executing at most `max_concurrent` fetches at once.
    pub fn with_concurrency(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                max_concurrent: max_concurrent.max(1),
            }),
        }
    }

    /// Enqueue a fetch request.
    ///
    /// Returns `false` and drops the request when `slice_id` already has an
    /// outstanding request in any priority class; the existing request's
    /// completion is the one that runs. Otherwise the request is queued and
    /// the pump dispatches it as soon as priority order and the concurrency
    /// bound allow.
    pub fn add_request(
        &self,
        slice_id: Arc<str>,
        volume_id: Option<Arc<str>>,
        priority: RequestPriority,
        fetch: FetchFn,
        on_success: SuccessFn,
        on_failure: FailureFn,
    ) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if state.is_outstanding(&slice_id) {
                debug!(id = %slice_id, "dropping duplicate fetch request");
                return false;
            }
            state.queues[priority.index()].push_back(PendingRequest {
                slice_id,
                volume_id,
                fetch,
                on_success,
                on_failure,
            });
        }
        Self::pump(&self.inner);
        true
    }

    /// Pending (not yet started) request ids per class.
    ///
    /// Introspection only; used to verify that cache reuse left no stale
    /// requests behind.
    pub fn snapshot(&self) -> RequestPoolSnapshot {
        let state = lock(&self.inner.state);
        RequestPoolSnapshot {
            interaction: state.queues[0].iter().map(|r| r.slice_id.clone()).collect(),
            prefetch: state.queues[1].iter().map(|r| r.slice_id.clone()).collect(),
        }
    }

    /// Drop every pending request tagged with `volume_id`.
    ///
    /// Their callbacks never run. Requests already executing complete
    /// normally; discarding their result is the caller's responsibility.
    pub fn clear_for_volume(&self, volume_id: &str) {
        let dropped: Vec<PendingRequest> = {
            let mut state = lock(&self.inner.state);
            let mut dropped = Vec::new();
            for queue in state.queues.iter_mut() {
                let kept: VecDeque<PendingRequest> = queue
                    .drain(..)
                    .filter_map(|req| {
                        if req.volume_id.as_deref() == Some(volume_id) {
                            dropped.push(req);
                            None
                        } else {
                            Some(req)
                        }
                    })
                    .collect();
                *queue = kept;
            }
            dropped
        };
        if !dropped.is_empty() {
            debug!(volume_id, count = dropped.len(), "cleared pending requests");
        }
    }

    /// Drop every pending request regardless of tag.
    pub fn clear_pending(&self) {
        let mut state = lock(&self.inner.state);
        for queue in state.queues.iter_mut() {
            queue.clear();
        }
    }

    /// The configured concurrency bound.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Dispatch queued requests while permits are available.
    fn pump(inner: &Arc<PoolInner>) {
        loop {
            let permit = match inner.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let request = {
                let mut state = lock(&inner.state);
                match state.pop_next() {
                    Some(request) => request,
                    None => {
                        drop(permit);
                        return;
                    }
                }
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                let PendingRequest {
                    slice_id,
                    volume_id: _,
                    fetch,
                    on_success,
                    on_failure,
                } = request;

                let result = fetch().await;

                // Clear the outstanding marker before the continuation runs,
                // so a retry issued from the callback is not deduplicated
                // against the request that just finished.
                {
                    let mut state = lock(&inner.state);
                    state.executing.remove(&slice_id);
                }
                drop(permit);

                match result {
                    Ok(payload) => on_success(payload),
                    Err(error) => on_failure(error),
                }

                Self::pump(&inner);
            });
        }
    }
}

impl Default for RequestPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Tests
// =============================================================================
