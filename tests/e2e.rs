// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios through the public cache handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use fleet_cache::{
    CacheConfig, ClusterEvent, FleetCache, MemoryTraceStore, ModelAdapter, Pod, PodPhase, Token,
    MODEL_IDENTIFIER_LABEL,
};

const TOKENS: [Token; 33] = [
    9906, 4435, 0, 3639, 264, 7839, 6187, 0, 7839, 29084, 0, 220, 57668, 53901, 3574, 244, 98220,
    6447, 43240, 82696, 58666, 53901, 9554, 15120, 36827, 28308, 232, 6447, 6079, 102, 17905,
    53901, 6447,
];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn labeled_pod(name: &str, model: &str) -> Pod {
    Pod {
        name: name.to_string(),
        namespace: "default".to_string(),
        pod_ip: String::new(),
        phase: PodPhase::Running,
        labels: HashMap::from([(MODEL_IDENTIFIER_LABEL.to_string(), model.to_string())]),
    }
}

fn quiet_config() -> CacheConfig {
    // Slow tickers so background loops stay out of the assertions.
    CacheConfig {
        scrape_interval: Duration::from_secs(3600),
        flush_interval: Duration::from_secs(3600),
        prefix_eviction_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn request_lifecycle_counters() {
    init_tracing();
    let (_tx, rx) = mpsc::channel(16);
    let cache = FleetCache::start(quiet_config(), rx, None).unwrap();
    let model = "llama-7b";

    let term = cache.add_request_count("r", model);
    assert_eq!(cache.tracker().num_requests_traces(), 1);
    let window = cache.tracker().window(model, term).unwrap();
    assert_eq!(window.num_requests(), 1);
    assert_eq!(window.completed_requests(), 0);
    assert_eq!(cache.pending_requests(model), 1);

    cache.done_request_count("r", model, term);
    assert_eq!(cache.tracker().num_requests_traces(), 1);
    assert_eq!(window.completed_requests(), 1);
    assert_eq!(cache.pending_requests(model), 0);

    cache.add_request_trace("r", model, 1, 1);
    assert_eq!(window.num_keys(), 1);
    assert_eq!(window.bucket("0:0"), Some(1));
}

#[tokio::test]
async fn prefix_populate_match_and_evict() {
    init_tracing();
    let (_tx, rx) = mpsc::channel(16);
    let cache = FleetCache::start(quiet_config(), rx, None).unwrap();
    let candidates = vec!["p1".to_string(), "p2".to_string()];

    // Empty cache: nothing matches.
    let result = cache.match_prefix(&TOKENS, "m1", &candidates);
    assert!(result.matched.is_empty());
    assert_eq!(result.unmatched, TOKENS.to_vec());
    assert!(result.pods.is_empty());

    // Populate, then the whole prompt matches on p1.
    cache.add_prefix_block(&TOKENS, "m1", "p1");
    let result = cache.match_prefix(&TOKENS, "m1", &candidates);
    assert_eq!(result.matched, TOKENS.to_vec());
    assert!(result.unmatched.is_empty());
    assert_eq!(result.pods, vec!["p1".to_string()]);
}

#[tokio::test]
async fn prefix_eviction_loop_purges_stale_blocks() {
    init_tracing();
    let (_tx, rx) = mpsc::channel(16);
    // An eviction sweep every 50ms with zero TTL purges everything it sees.
    let config = CacheConfig {
        prefix_eviction_interval: Duration::from_millis(50),
        prefix_ttl: Duration::ZERO,
        scrape_interval: Duration::from_secs(3600),
        flush_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let cache = FleetCache::start(config, rx, None).unwrap();
    let candidates = vec!["p1".to_string()];

    cache.add_prefix_block(&TOKENS, "m1", "p1");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = cache.match_prefix(&TOKENS, "m1", &candidates);
    assert_eq!(result.unmatched, TOKENS.to_vec());
    assert!(result.pods.is_empty());
}

#[tokio::test]
async fn pod_and_adapter_events_keep_mirror() {
    init_tracing();
    let (tx, rx) = mpsc::channel(16);
    let cache = FleetCache::start(quiet_config(), rx, None).unwrap();

    tx.send(ClusterEvent::PodAdded(labeled_pod("p1", "llama")))
        .await
        .unwrap();
    let adapter = ModelAdapter {
        name: "lora-a".to_string(),
        namespace: "default".to_string(),
        instances: vec!["p1".to_string()],
    };
    tx.send(ClusterEvent::ModelAdapterAdded(adapter.clone()))
        .await
        .unwrap();
    tx.send(ClusterEvent::ModelAdapterDeleted(adapter))
        .await
        .unwrap();

    wait_for(|| cache.get_pod("p1").is_ok() && !cache.check_model_exists("lora-a")).await;

    let models = cache.get_models_for_pod("p1").unwrap();
    assert_eq!(models.len(), 1);
    assert!(models.contains("llama"));

    let pods = cache.get_pods_for_model("llama").unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].name, "p1");

    assert!(!cache.check_model_exists("lora-a"));
    assert!(cache.get_pods_for_model("lora-a").is_err());
}

#[tokio::test]
async fn traces_flush_to_store_with_aligned_keys() {
    init_tracing();
    let (_tx, rx) = mpsc::channel(16);
    let store = Arc::new(MemoryTraceStore::new());
    let config = CacheConfig {
        flush_interval: Duration::from_secs(1),
        scrape_interval: Duration::from_secs(3600),
        prefix_eviction_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let cache = FleetCache::start(config, rx, Some(store.clone())).unwrap();

    let term = cache.add_request_count("r", "llama-7b");
    cache.done_request_trace("r", "llama-7b", 128, 32, term);

    wait_for(|| !store.is_empty()).await;

    let keys = store.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("aibrix:llama-7b_request_trace_"));

    let stored = store.get(&keys[0]).unwrap();
    assert_eq!(stored.ttl, Duration::from_secs(600));
    let document: serde_json::Value = serde_json::from_str(&stored.value).unwrap();
    assert_eq!(document["meta_interval_sec"], 1);
    assert_eq!(document["meta_precision"], 10);
    assert_eq!(document["meta_v"], 2);
    // log2(128)/0.1 = 70, log2(32)/0.1 = 50.
    assert_eq!(document["70:50"], 1);

    // The key suffix is a unix timestamp.
    let _suffix: u64 = keys[0].rsplit('_').next().unwrap().parse().unwrap();
    assert_eq!(cache.pending_requests("llama-7b"), 0);
}

#[tokio::test]
async fn shutdown_stops_background_loops() {
    init_tracing();
    let (tx, rx) = mpsc::channel(16);
    let cache = FleetCache::start(quiet_config(), rx, None).unwrap();
    cache.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The ingest loop is gone; the receiver is dropped and nothing applies.
    let _ = tx.send(ClusterEvent::PodAdded(labeled_pod("p1", "llama"))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cache.get_pod("p1").is_err());
}
