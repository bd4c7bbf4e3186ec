//! Test utilities for integration tests.
//!
//! Provides a pre-wired streaming context with the synthetic loader stack,
//! frame id builders matching the synthetic id grammar, and an event log
//! for asserting on callback traffic.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use vox_streamer::synthetic::{self, synthetic_frame_id, SyntheticSliceLoader};
use vox_streamer::{
    CacheEntry, ContextOptions, LoadCallback, Slice, StreamEvent, StreamingContext,
};

/// Context with the synthetic stack registered under the `synthetic` scheme.
pub fn context() -> (StreamingContext, Arc<SyntheticSliceLoader>) {
    let ctx = StreamingContext::new();
    let loader = synthetic::register(&ctx);
    (ctx, loader)
}

/// Context with a configured loader and explicit pool concurrency.
pub fn context_with(
    loader: SyntheticSliceLoader,
    max_concurrent: usize,
) -> (StreamingContext, Arc<SyntheticSliceLoader>) {
    let ctx = StreamingContext::with_options(ContextOptions {
        max_concurrent,
        ..ContextOptions::default()
    });
    let loader = synthetic::register_with(&ctx, loader);
    (ctx, loader)
}

/// Frame ids `synthetic:frame<i>_<rows>_<columns>_<i+1>` for `i in 0..n`:
/// frame 0 is uniformly 1, frame n-1 uniformly n.
pub fn frame_ids(n: usize, rows: u32, columns: u32) -> Vec<String> {
    (0..n)
        .map(|i| synthetic_frame_id(&format!("frame{i}"), rows, columns, i as u8 + 1))
        .collect()
}

/// A resolved slice entry, as an independent slice load would have cached it.
pub fn cached_slice(id: &str, rows: u32, columns: u32, value: u8) -> CacheEntry {
    let pixels = vec![value; (rows * columns) as usize];
    CacheEntry::for_slice(Arc::new(Slice::new(id, rows, columns, Bytes::from(pixels))))
}

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Event Log
// =============================================================================

/// Records every event a load callback observes.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback that appends into this log.
    pub fn callback(&self) -> LoadCallback {
        let events = self.events.clone();
        Arc::new(move |event: &StreamEvent| {
            events.lock().unwrap().push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn frame_loaded_count(&self) -> usize {
        self.count(|e| matches!(e, StreamEvent::FrameLoaded { .. }))
    }

    pub fn frame_failed_count(&self) -> usize {
        self.count(|e| matches!(e, StreamEvent::FrameFailed { .. }))
    }

    pub fn completed_count(&self) -> usize {
        self.count(|e| matches!(e, StreamEvent::Completed))
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(|e| matches!(e, StreamEvent::Cancelled))
    }

    fn count(&self, pred: impl Fn(&StreamEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}
