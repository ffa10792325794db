// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request-trace windows and pending-request counters.
//!
//! The router calls into this module for every request, so the hot path is a
//! single concurrent-map lookup followed by atomic increments. Each model has
//! one cell holding its pending counter and its *current* window; windows are
//! rotated by the flusher, which advances the model's term and installs a
//! fresh window.
//!
//! A request is admitted into the window of the term it observed, and its
//! completion is credited to that same term, even when the flusher has
//! rotated in between. That is what keeps the pending counter exact: for any
//! interleaving of admissions, completions and rotations, pending returns to
//! zero once every admitted request has completed.
//!
//! The per-model slot is read-locked by admissions and write-locked only by
//! rotation, so a term can never be observed as current and sealed by the
//! same request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

/// Log-bucketing precision: buckets per doubling is `1 / PRECISION`.
pub const REQUEST_TRACE_PRECISION: f64 = 0.1;

/// Trace-document schema version, written as `meta_v` on flush.
pub const TRACE_SCHEMA_VERSION: i64 = 2;

/// Per-model window epoch. Monotonically increasing; advanced only by
/// rotation. A later admission always observes a term >= an earlier one.
pub type Term = u64;

/// Counters and token-pair buckets for one (model, term).
#[derive(Debug, Default)]
pub struct TraceWindow {
    num_requests: AtomicI32,
    completed_requests: AtomicI32,
    num_keys: AtomicI32,
    buckets: DashMap<String, AtomicI32>,
}

impl TraceWindow {
    pub fn num_requests(&self) -> i32 {
        self.num_requests.load(Ordering::Acquire)
    }

    pub fn completed_requests(&self) -> i32 {
        self.completed_requests.load(Ordering::Acquire)
    }

    /// Number of distinct token-pair buckets touched in this window.
    pub fn num_keys(&self) -> i32 {
        self.num_keys.load(Ordering::Acquire)
    }

    pub fn bucket(&self, key: &str) -> Option<i32> {
        self.buckets.get(key).map(|count| count.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.num_requests() == 0 && self.num_keys() == 0
    }

    /// Owned copy of the bucket map, for serialization.
    pub fn snapshot_buckets(&self) -> HashMap<String, i32> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Acquire)))
            .collect()
    }

    fn record_pair(&self, input_tokens: i64, output_tokens: i64) {
        let key = bucket_key(input_tokens, output_tokens);
        self.buckets
            .entry(key)
            .or_insert_with(|| {
                self.num_keys.fetch_add(1, Ordering::AcqRel);
                AtomicI32::new(0)
            })
            .fetch_add(1, Ordering::AcqRel);
    }
}

struct CurrentSlot {
    term: Term,
    window: Arc<TraceWindow>,
}

struct ModelTrace {
    pending: AtomicI32,
    /// Completions whose term had already been released. Diagnostic only.
    late_completions: AtomicI32,
    /// The current (term, window) pair. Shared for admissions; rotation is
    /// the only writer.
    current: RwLock<CurrentSlot>,
    /// Every live window: the current one plus sealed windows the flusher has
    /// not released yet.
    windows: DashMap<Term, Arc<TraceWindow>>,
}

impl ModelTrace {
    fn new() -> Self {
        let window = Arc::new(TraceWindow::default());
        let windows = DashMap::new();
        windows.insert(0, window.clone());
        Self {
            pending: AtomicI32::new(0),
            late_completions: AtomicI32::new(0),
            current: RwLock::new(CurrentSlot { term: 0, window }),
            windows,
        }
    }

    fn credit(&self, term: Term, pair: Option<(i64, i64)>) {
        match self.windows.get(&term) {
            Some(window) => {
                window.completed_requests.fetch_add(1, Ordering::AcqRel);
                if let Some((input_tokens, output_tokens)) = pair {
                    if input_tokens >= 0 && output_tokens >= 0 {
                        window.record_pair(input_tokens, output_tokens);
                    } else {
                        tracing::warn!(
                            input_tokens,
                            output_tokens,
                            "negative token counts rejected, bucket not recorded"
                        );
                    }
                }
            }
            None => {
                // The window was flushed and released before this request
                // finished. Pending has already been decremented by the
                // caller; only the per-term accounting is off, so count it.
                self.late_completions.fetch_add(1, Ordering::AcqRel);
                tracing::trace!(term, "completion credited after window release");
            }
        }
    }
}

/// Sharded per-model trace state. Cheap to share; all methods take `&self`.
#[derive(Default)]
pub struct RequestTracker {
    models: DashMap<String, Arc<ModelTrace>>,
    /// Tracker-wide count of per-model trace entries. Bumped when a model's
    /// cell is first allocated; never decremented.
    num_requests_traces: AtomicI32,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The model's cell, allocated at most once per model. The concurrent
    /// map's entry lock is the single-flight guard.
    fn cell(&self, model: &str) -> Arc<ModelTrace> {
        if let Some(cell) = self.models.get(model) {
            return cell.value().clone();
        }
        self.models
            .entry(model.to_string())
            .or_insert_with(|| {
                self.num_requests_traces.fetch_add(1, Ordering::AcqRel);
                Arc::new(ModelTrace::new())
            })
            .value()
            .clone()
    }

    /// Admit one request: bump the pending counter and the current window's
    /// request count. Returns the term the request was admitted into; the
    /// caller must hand the same term back on completion.
    pub fn add_request_count(&self, _request_id: &str, model: &str) -> Term {
        let cell = self.cell(model);
        cell.pending.fetch_add(1, Ordering::AcqRel);
        let slot = cell.current.read().expect("trace slot poisoned");
        slot.window.num_requests.fetch_add(1, Ordering::AcqRel);
        slot.term
    }

    /// Complete one request admitted at `term`.
    pub fn done_request_count(&self, _request_id: &str, model: &str, term: Term) {
        let Some(cell) = self.models.get(model).map(|cell| cell.value().clone()) else {
            tracing::warn!(model, "completion for a model that was never admitted");
            return;
        };
        cell.pending.fetch_sub(1, Ordering::AcqRel);
        cell.credit(term, None);
    }

    /// Record the (input, output) token pair of a request in the current
    /// window. Zero token counts are coerced to one; negative counts are
    /// rejected.
    pub fn add_request_trace(
        &self,
        _request_id: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) {
        if input_tokens < 0 || output_tokens < 0 {
            tracing::warn!(
                model,
                input_tokens,
                output_tokens,
                "negative token counts rejected, bucket not recorded"
            );
            return;
        }
        let cell = self.cell(model);
        let slot = cell.current.read().expect("trace slot poisoned");
        slot.window.record_pair(input_tokens, output_tokens);
    }

    /// Complete one request and record its token pair against the window of
    /// the term it was admitted into.
    pub fn done_request_trace(
        &self,
        _request_id: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        term: Term,
    ) {
        let Some(cell) = self.models.get(model).map(|cell| cell.value().clone()) else {
            tracing::warn!(model, "completion for a model that was never admitted");
            return;
        };
        cell.pending.fetch_sub(1, Ordering::AcqRel);
        cell.credit(term, Some((input_tokens, output_tokens)));
    }

    /// Live (not yet completed) requests for `model`.
    pub fn pending(&self, model: &str) -> i32 {
        self.models
            .get(model)
            .map(|cell| cell.pending.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of per-model trace entries the tracker maintains. One per
    /// model ever admitted; completions do not decrement it.
    pub fn num_requests_traces(&self) -> i32 {
        self.num_requests_traces.load(Ordering::Acquire)
    }

    pub fn current_term(&self, model: &str) -> Option<Term> {
        let cell = self.models.get(model)?;
        let slot = cell.current.read().expect("trace slot poisoned");
        Some(slot.term)
    }

    /// The window a request admitted at `term` would be credited to, if it is
    /// still live.
    pub fn window(&self, model: &str, term: Term) -> Option<Arc<TraceWindow>> {
        let cell = self.models.get(model)?;
        cell.windows.get(&term).map(|window| window.value().clone())
    }

    pub fn late_completions(&self, model: &str) -> i32 {
        self.models
            .get(model)
            .map(|cell| cell.late_completions.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Models whose current window has recorded anything.
    pub(crate) fn models_with_data(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|entry| {
                let slot = entry.value().current.read().expect("trace slot poisoned");
                !slot.window.is_empty()
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Seal the model's current window and install a fresh one under the next
    /// term. Returns the sealed (term, window); the sealed window stays live
    /// for late completions until [`RequestTracker::release`]. Returns `None`
    /// when the current window is empty; an empty window is never sealed.
    pub(crate) fn rotate(&self, model: &str) -> Option<(Term, Arc<TraceWindow>)> {
        let cell = self.models.get(model)?.value().clone();
        let mut slot = cell.current.write().expect("trace slot poisoned");
        if slot.window.is_empty() {
            return None;
        }
        let sealed_term = slot.term;
        let sealed = slot.window.clone();
        slot.term += 1;
        slot.window = Arc::new(TraceWindow::default());
        cell.windows.insert(slot.term, slot.window.clone());
        Some((sealed_term, sealed))
    }

    /// Drop a sealed window. Completions arriving afterwards are counted as
    /// late.
    pub(crate) fn release(&self, model: &str, term: Term) {
        if let Some(cell) = self.models.get(model) {
            cell.windows.remove(&term);
        }
    }

    /// Sum of `numRequests - completedRequests` over every live window.
    /// Equals the pending counter whenever no released window carried
    /// in-flight requests.
    #[cfg(test)]
    fn live_imbalance(&self, model: &str) -> i32 {
        let Some(cell) = self.models.get(model) else {
            return 0;
        };
        cell.windows
            .iter()
            .map(|entry| entry.value().num_requests() - entry.value().completed_requests())
            .sum()
    }
}

/// Log-scaled bucket index of a token count. Zero is coerced to one so the
/// logarithm stays finite; callers reject negatives before getting here.
fn bucket_index(tokens: i64) -> i64 {
    let tokens = tokens.max(1) as f64;
    (tokens.log2() / REQUEST_TRACE_PRECISION).round() as i64
}

/// The `"i:o"` bucket key for an (input, output) token pair.
pub fn bucket_key(input_tokens: i64, output_tokens: i64) -> String {
    format!(
        "{}:{}",
        bucket_index(input_tokens),
        bucket_index(output_tokens)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_is_stable() {
        // log2(1) == 0 on both axes.
        assert_eq!(bucket_key(1, 1), "0:0");
        // Zero is coerced to one rather than producing -inf.
        assert_eq!(bucket_key(0, 0), "0:0");
        // log2(8) / 0.1 == 30.
        assert_eq!(bucket_key(8, 1), "30:0");
        // Rounding, not truncation: log2(100)/0.1 = 66.43... -> 66.
        assert_eq!(bucket_key(100, 1), "66:0");
    }

    #[test]
    fn request_lifecycle_counters() {
        let tracker = RequestTracker::new();
        let model = "llama-7b";

        let term = tracker.add_request_count("r", model);
        assert_eq!(tracker.num_requests_traces(), 1);
        let window = tracker.window(model, term).unwrap();
        assert_eq!(window.num_keys(), 0);
        assert_eq!(window.num_requests(), 1);
        assert_eq!(window.completed_requests(), 0);
        assert_eq!(tracker.pending(model), 1);

        tracker.done_request_count("r", model, term);
        assert_eq!(tracker.num_requests_traces(), 1);
        let window = tracker.window(model, term).unwrap();
        assert_eq!(window.num_requests(), 1);
        assert_eq!(window.completed_requests(), 1);
        assert_eq!(tracker.pending(model), 0);

        tracker.add_request_trace("r", model, 1, 1);
        assert_eq!(window.num_keys(), 1);
        assert_eq!(window.bucket("0:0"), Some(1));
    }

    #[test]
    fn trace_entry_counter_counts_each_model_once() {
        let tracker = RequestTracker::new();
        assert_eq!(tracker.num_requests_traces(), 0);

        let term = tracker.add_request_count("a", "m1");
        tracker.add_request_count("b", "m1");
        assert_eq!(tracker.num_requests_traces(), 1);

        tracker.add_request_count("c", "m2");
        assert_eq!(tracker.num_requests_traces(), 2);

        // Completions and rotations never decrement it.
        tracker.done_request_count("a", "m1", term);
        tracker.rotate("m1");
        assert_eq!(tracker.num_requests_traces(), 2);
    }

    #[test]
    fn completion_never_exceeds_admission() {
        let tracker = RequestTracker::new();
        let term = tracker.add_request_count("r", "m");
        tracker.add_request_count("r2", "m");
        tracker.done_request_count("r", "m", term);
        let window = tracker.window("m", term).unwrap();
        assert!(window.completed_requests() <= window.num_requests());
        tracker.done_request_count("r2", "m", term);
        let window = tracker.window("m", term).unwrap();
        assert_eq!(window.completed_requests(), window.num_requests());
    }

    #[test]
    fn pending_converges_to_zero_under_contention() {
        let tracker = Arc::new(RequestTracker::new());
        let workers = 10;
        let iterations = 100_000;

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        let term = tracker.add_request_count("r", "model");
                        tracker.done_request_trace("r", "model", 1, 1, term);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.pending("model"), 0);
        assert_eq!(tracker.live_imbalance("model"), 0);
    }

    #[test]
    fn pending_matches_live_window_imbalance() {
        let tracker = RequestTracker::new();
        let t1 = tracker.add_request_count("a", "m");
        tracker.add_request_count("b", "m");
        tracker.add_request_count("c", "m");
        tracker.done_request_count("a", "m", t1);
        assert_eq!(tracker.pending("m"), 2);
        assert_eq!(tracker.live_imbalance("m"), 2);
    }

    #[test]
    fn rotation_advances_term_and_preserves_credit() {
        let tracker = RequestTracker::new();
        let term = tracker.add_request_count("r", "m");

        let (sealed_term, sealed) = tracker.rotate("m").unwrap();
        assert_eq!(sealed_term, term);
        assert_eq!(tracker.current_term("m"), Some(term + 1));

        // Completion after rotation still lands in the sealed window.
        tracker.done_request_trace("r", "m", 4, 4, term);
        assert_eq!(sealed.completed_requests(), 1);
        assert_eq!(sealed.bucket("20:20"), Some(1));
        assert_eq!(tracker.pending("m"), 0);
        assert_eq!(tracker.late_completions("m"), 0);
    }

    #[test]
    fn empty_window_is_not_rotated() {
        let tracker = RequestTracker::new();
        let term = tracker.add_request_count("r", "m");
        tracker.done_request_count("r", "m", term);
        let (_, _) = tracker.rotate("m").unwrap();
        // Fresh window has no data, so a second rotation is a no-op.
        assert!(tracker.rotate("m").is_none());
        assert_eq!(tracker.current_term("m"), Some(term + 1));
    }

    #[test]
    fn completion_after_release_is_late_but_pending_stays_exact() {
        let tracker = RequestTracker::new();
        let term = tracker.add_request_count("r", "m");
        let (sealed_term, _) = tracker.rotate("m").unwrap();
        tracker.release("m", sealed_term);

        tracker.done_request_count("r", "m", term);
        assert_eq!(tracker.pending("m"), 0);
        assert_eq!(tracker.late_completions("m"), 1);
    }

    #[test]
    fn negative_tokens_are_rejected() {
        let tracker = RequestTracker::new();
        let term = tracker.add_request_count("r", "m");
        tracker.add_request_trace("r", "m", -1, 5);
        let window = tracker.window("m", term).unwrap();
        assert_eq!(window.num_keys(), 0);
    }

    #[test]
    fn later_admission_observes_later_or_equal_term() {
        let tracker = RequestTracker::new();
        let t1 = tracker.add_request_count("a", "m");
        let t2 = tracker.add_request_count("b", "m");
        assert!(t2 >= t1);
        tracker.rotate("m");
        let t3 = tracker.add_request_count("c", "m");
        assert!(t3 > t1);
    }
}
