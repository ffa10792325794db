// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The cache service handle.
//!
//! [`FleetCache::start`] wires the pieces together: it validates the
//! configuration, constructs the shared state, and spawns the background
//! loops (event ingest, metric scraping, trace flushing, prefix eviction)
//! under a single cancellation token. There is no process-wide singleton;
//! the program entrypoint owns the handle and everything stops when it is
//! dropped or [`FleetCache::shutdown`] is called.
//!
//! The inherent methods are the read/write surface the router consumes.
//! None of them performs I/O or blocks on anything but short in-memory
//! locks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::events::{self, ClusterEvent};
use crate::flush::{TraceFlusher, TraceStore};
use crate::metrics::scrape::MetricsAggregator;
use crate::metrics::MetricValue;
use crate::prefix::{PrefixIndex, PrefixMatch, Token};
use crate::registry::{Pod, PodRegistry};
use crate::trace::{RequestTracker, Term};

/// The shared runtime cache backing the request router.
pub struct FleetCache {
    registry: Arc<PodRegistry>,
    tracker: Arc<RequestTracker>,
    prefix: Arc<PrefixIndex>,
    cancel: CancellationToken,
}

impl FleetCache {
    /// Construct the cache and spawn its background loops.
    ///
    /// `events` feeds cluster lifecycle events from the external source.
    /// `trace_store` is the key/value backend traces are flushed to; `None`
    /// disables flushing. Must be called within a tokio runtime. The only
    /// fatal error is an invalid configuration.
    pub fn start(
        config: CacheConfig,
        events: mpsc::Receiver<ClusterEvent>,
        trace_store: Option<Arc<dyn TraceStore>>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.scrape_timeout)
            .build()
            .map_err(|error| CacheError::InvalidConfig(error.to_string()))?;

        let registry = Arc::new(PodRegistry::new());
        let tracker = Arc::new(RequestTracker::new());
        let prefix = Arc::new(PrefixIndex::new(config.prefix_block_size));
        let cancel = CancellationToken::new();

        tokio::spawn(events::run_ingest(
            registry.clone(),
            events,
            cancel.child_token(),
        ));

        let aggregator = MetricsAggregator::new(registry.clone(), client, &config);
        tokio::spawn(aggregator.run(cancel.child_token()));

        match trace_store {
            Some(store) => {
                let flusher = TraceFlusher::new(
                    tracker.clone(),
                    store,
                    config.flush_interval,
                    config.trace_expiry,
                );
                tokio::spawn(flusher.run(cancel.child_token()));
            }
            None => {
                tracing::info!("trace store not configured, request traces will not be flushed")
            }
        }

        tokio::spawn(run_prefix_eviction(
            prefix.clone(),
            config.prefix_eviction_interval,
            config.prefix_ttl,
            cancel.child_token(),
        ));

        tracing::info!(
            scrape_interval_ms = config.scrape_interval.as_millis() as u64,
            prefix_block_size = config.prefix_block_size,
            "fleet cache started"
        );
        Ok(Self {
            registry,
            tracker,
            prefix,
            cancel,
        })
    }

    /// Stop every background loop. In-flight scrapes are abandoned.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // --- pod/model index ---

    pub fn get_pod(&self, name: &str) -> Result<Pod, CacheError> {
        self.registry.get_pod(name)
    }

    pub fn get_pods(&self) -> Vec<Pod> {
        self.registry.list_pods()
    }

    pub fn get_pods_for_model(&self, model: &str) -> Result<Vec<Pod>, CacheError> {
        self.registry.get_pods_for_model(model)
    }

    pub fn get_models_for_pod(&self, pod: &str) -> Result<HashSet<String>, CacheError> {
        self.registry.get_models_for_pod(pod)
    }

    pub fn check_model_exists(&self, model: &str) -> bool {
        self.registry.model_exists(model)
    }

    // --- metrics ---

    pub fn get_pod_metric(&self, pod: &str, metric: &str) -> Result<MetricValue, CacheError> {
        self.registry.get_pod_metric(pod, metric)
    }

    pub fn get_model_metric(&self, model: &str, metric: &str) -> Result<MetricValue, CacheError> {
        self.registry.get_model_metric(model, metric)
    }

    // --- request traces ---

    pub fn add_request_count(&self, request_id: &str, model: &str) -> Term {
        self.tracker.add_request_count(request_id, model)
    }

    pub fn done_request_count(&self, request_id: &str, model: &str, term: Term) {
        self.tracker.done_request_count(request_id, model, term)
    }

    pub fn add_request_trace(
        &self,
        request_id: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) {
        self.tracker
            .add_request_trace(request_id, model, input_tokens, output_tokens)
    }

    pub fn done_request_trace(
        &self,
        request_id: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        term: Term,
    ) {
        self.tracker
            .done_request_trace(request_id, model, input_tokens, output_tokens, term)
    }

    /// Live requests for `model`.
    pub fn pending_requests(&self, model: &str) -> i32 {
        self.tracker.pending(model)
    }

    // --- prefix cache ---

    pub fn match_prefix(
        &self,
        tokens: &[Token],
        model: &str,
        candidate_pods: &[String],
    ) -> PrefixMatch {
        self.prefix.match_prefix(tokens, model, candidate_pods)
    }

    pub fn add_prefix_block(&self, tokens: &[Token], model: &str, pod: &str) {
        self.prefix.add_blocks(tokens, model, pod)
    }

    #[doc(hidden)]
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }
}

impl Drop for FleetCache {
    fn drop(&mut self) {
        tracing::debug!("dropping fleet cache, cancelling background tasks");
        self.cancel.cancel();
    }
}

async fn run_prefix_eviction(
    prefix: Arc<PrefixIndex>,
    interval: std::time::Duration,
    ttl: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("prefix eviction stopped");
                return;
            }
            _ = ticker.tick() => {
                prefix.evict(SystemTime::now() - ttl);
            }
        }
    }
}
