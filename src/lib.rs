// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared runtime cache for a fleet of LLM inference workers.
//!
//! The cache maintains three correlated views the request router consumes on
//! every decision:
//!
//! - **Pod/model index**: which pods host which models (base models and
//!   adapters), kept current by cluster lifecycle events.
//! - **Runtime metrics**: per-pod counters, gauges and histograms scraped
//!   from each worker's metrics endpoint, optionally augmented with instant
//!   queries against an external time-series backend.
//! - **Request traces**: a time-bucketed histogram of recent (input, output)
//!   token distributions per model, plus the per-model pending-request
//!   counters the load balancer and autoscaler read.
//!
//! On top of those sits the prefix-token-block cache, which routes prompts
//! with long shared prefixes to pods that already hold their KV state.
//!
//! # Usage
//!
//! The cache is an explicitly constructed service, owned by the program
//! entrypoint:
//!
//! ```no_run
//! use fleet_cache::{CacheConfig, ClusterEvent, FleetCache};
//!
//! # async fn run() -> Result<(), fleet_cache::CacheError> {
//! let (_events_tx, events_rx) = tokio::sync::mpsc::channel::<ClusterEvent>(1024);
//! let cache = FleetCache::start(CacheConfig::from_env(), events_rx, None)?;
//!
//! // The router's request lifecycle:
//! let term = cache.add_request_count("req-1", "llama-7b");
//! cache.add_request_trace("req-1", "llama-7b", 128, 32);
//! cache.done_request_count("req-1", "llama-7b", term);
//! # Ok(())
//! # }
//! ```
//!
//! Hot-path calls ([`FleetCache::add_request_count`] and friends,
//! [`FleetCache::match_prefix`]) never perform I/O; all blocking work lives
//! in background tasks that stop when the handle is dropped.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod flush;
pub mod metrics;
pub mod prefix;
pub mod registry;
pub mod trace;

pub use cache::FleetCache;
pub use config::{BasicAuth, CacheConfig};
pub use error::CacheError;
pub use events::ClusterEvent;
pub use flush::{MemoryTraceStore, StoredTrace, TraceStore};
pub use metrics::{HistogramBucket, HistogramValue, MetricValue, QueryResult};
pub use prefix::{PrefixMatch, Token};
pub use registry::{ModelAdapter, Pod, PodPhase, MODEL_IDENTIFIER_LABEL};
pub use trace::Term;
