// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Periodic trace flush to an external key/value store.
//!
//! Every cycle the flusher seals the non-empty window of each model and
//! publishes it under `aibrix:<model>_request_trace_<roundT>`, where `roundT`
//! is the wall clock aligned down to the flush interval. The document is a
//! flat JSON object: `meta_*` fields describing the bucketing scheme plus one
//! `"i:o": count` entry per touched bucket.
//!
//! Sealed windows stay live for one extra cycle so completions that raced the
//! rotation still credit the right term; they are released on the next tick.
//! A failed store write is logged and the window is still released: holding
//! windows across repeated failures would grow without bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::trace::{RequestTracker, Term, TraceWindow, REQUEST_TRACE_PRECISION, TRACE_SCHEMA_VERSION};

const KEY_META_INTERVAL_SEC: &str = "meta_interval_sec";
const KEY_META_PRECISION: &str = "meta_precision";
const KEY_META_VERSION: &str = "meta_v";

/// The external key/value store traces are published to.
///
/// The embedding program supplies the production binding (the deployment
/// stores traces in Redis); [`MemoryTraceStore`] backs the tests.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// `SET key value EX ttl`.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;
}

/// In-memory [`TraceStore`] for tests and local runs.
#[derive(Default)]
pub struct MemoryTraceStore {
    entries: Mutex<HashMap<String, StoredTrace>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrace {
    pub value: String,
    pub ttl: Duration,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StoredTrace> {
        self.entries.lock().expect("store lock poisoned").get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), StoredTrace { value, ttl });
        Ok(())
    }
}

/// Background task that rotates and publishes trace windows.
pub(crate) struct TraceFlusher {
    tracker: std::sync::Arc<RequestTracker>,
    store: std::sync::Arc<dyn TraceStore>,
    interval: Duration,
    expiry: Duration,
    /// Windows sealed in the previous cycle, released at the start of the
    /// next one.
    pending_release: Vec<(String, Term)>,
}

impl TraceFlusher {
    pub(crate) fn new(
        tracker: std::sync::Arc<RequestTracker>,
        store: std::sync::Arc<dyn TraceStore>,
        interval: Duration,
        expiry: Duration,
    ) -> Self {
        Self {
            tracker,
            store,
            interval,
            expiry,
            pending_release: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("trace flusher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.flush_once(SystemTime::now()).await;
                }
            }
        }
    }

    /// One flush cycle. Returns the number of successful store writes; zero
    /// when every window was empty.
    pub(crate) async fn flush_once(&mut self, now: SystemTime) -> usize {
        for (model, term) in self.pending_release.drain(..) {
            self.tracker.release(&model, term);
        }

        let models = self.tracker.models_with_data();
        if models.is_empty() {
            return 0;
        }

        let interval_secs = self.interval.as_secs();
        let unix_now = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let round_t = unix_now - unix_now % interval_secs;

        let mut writes = 0;
        for model in models {
            let Some((term, window)) = self.tracker.rotate(&model) else {
                continue;
            };
            let key = format!("aibrix:{model}_request_trace_{round_t}");
            let document = serialize_window(&window, interval_secs);
            match self.store.set_ex(&key, document, self.expiry).await {
                Ok(()) => writes += 1,
                Err(error) => {
                    // The window is still released below: a lost profiling
                    // interval beats unbounded growth.
                    tracing::error!(model = %model, %key, %error, "failed to publish request trace");
                }
            }
            self.pending_release.push((model, term));
        }
        tracing::trace!(writes, round_t, "request traces flushed");
        writes
    }
}

/// The flat JSON trace document for one sealed window.
fn serialize_window(window: &TraceWindow, interval_secs: u64) -> String {
    let mut document = serde_json::Map::new();
    document.insert(
        KEY_META_INTERVAL_SEC.to_string(),
        serde_json::Value::from(interval_secs),
    );
    document.insert(
        KEY_META_PRECISION.to_string(),
        serde_json::Value::from((1.0 / REQUEST_TRACE_PRECISION).round() as i64),
    );
    document.insert(
        KEY_META_VERSION.to_string(),
        serde_json::Value::from(TRACE_SCHEMA_VERSION),
    );
    for (key, count) in window.snapshot_buckets() {
        document.insert(key, serde_json::Value::from(count));
    }
    serde_json::Value::Object(document).to_string()
}
