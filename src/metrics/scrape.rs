// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Periodic per-pod metrics aggregation.
//!
//! Each tick takes a registry snapshot under the read lock, releases it, and
//! fans the HTTP scrapes out concurrently. No lock is held across I/O and
//! every pod fails independently, so a slow or dead pod never stalls the
//! cache. Results are written back under brief per-pod write locks.
//!
//! Scrape failures are transient by design: the pod keeps its previous
//! values until a later cycle succeeds or the pod is deleted.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::metrics::names::{COUNTER_GAUGE_METRICS, EXTERNAL_METRICS, HISTOGRAM_METRICS};
use crate::metrics::query::MetricsBackend;
use crate::metrics::{names, parse, MetricValue};
use crate::registry::{Pod, PodRegistry};

pub(crate) struct MetricsAggregator {
    registry: Arc<PodRegistry>,
    client: reqwest::Client,
    backend: Option<MetricsBackend>,
    port: u16,
    interval: Duration,
}

impl MetricsAggregator {
    pub(crate) fn new(
        registry: Arc<PodRegistry>,
        client: reqwest::Client,
        config: &CacheConfig,
    ) -> Self {
        let backend = config.prometheus_endpoint.as_ref().map(|endpoint| {
            MetricsBackend::new(client.clone(), endpoint.clone(), config.prometheus_auth.clone())
        });
        if backend.is_none() {
            tracing::info!("external metrics endpoint not configured, skipping external queries");
        }
        Self {
            registry,
            client,
            backend,
            port: config.pod_metrics_port,
            interval: config.scrape_interval,
        }
    }

    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("metrics aggregator stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.scrape_once().await;
                }
            }
        }
    }

    /// One aggregation cycle: every addressable pod, then the model-level
    /// external queries.
    pub(crate) async fn scrape_once(&self) {
        let pods = self.registry.list_pods();
        let scrapes = pods
            .iter()
            .filter(|pod| !pod.pod_ip.is_empty())
            .map(|pod| self.scrape_pod(pod));
        for result in join_all(scrapes).await.into_iter().flatten() {
            let (pod, values) = result;
            self.registry.update_pod_metrics(&pod, values);
        }

        self.update_model_metrics().await;
    }

    /// Scrape one pod's metrics endpoint and augment with per-pod external
    /// queries. Returns `None` when the endpoint was unreachable.
    async fn scrape_pod(&self, pod: &Pod) -> Option<(String, Vec<(String, MetricValue)>)> {
        let url = format!("http://{}:{}/metrics", pod.pod_ip, self.port);
        let body = match self.fetch_body(&url).await {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(pod = %pod.name, %url, %error, "failed to scrape pod metrics");
                return None;
            }
        };

        let mut values = Vec::new();
        for family in COUNTER_GAUGE_METRICS {
            match parse::parse_scalar(&body, family) {
                Some(value) => values.push((family.to_string(), MetricValue::Scalar(value))),
                None => tracing::debug!(pod = %pod.name, family, "metric family not in scrape"),
            }
        }
        for family in HISTOGRAM_METRICS {
            match parse::parse_histogram(&body, family) {
                Some(histogram) => {
                    values.push((family.to_string(), MetricValue::Histogram(histogram)))
                }
                None => tracing::debug!(pod = %pod.name, family, "histogram family not in scrape"),
            }
        }

        if let Some(backend) = &self.backend {
            let model = pod.model_label().unwrap_or_default();
            let instance = format!("{}/{}", pod.pod_ip, self.port);
            for metric in EXTERNAL_METRICS {
                let query = names::render_query(
                    metric.pod_query,
                    &[("model_name", model), ("instance", instance.as_str())],
                );
                match backend.query_scalar(&query).await {
                    Ok(result) => {
                        values.push((metric.name.to_string(), MetricValue::External(result)))
                    }
                    Err(error) => {
                        tracing::warn!(pod = %pod.name, metric = metric.name, %error, "external query failed")
                    }
                }
            }
        }

        Some((pod.name.clone(), values))
    }

    /// Model-level external queries, recorded independently of any pod.
    async fn update_model_metrics(&self) {
        let Some(backend) = &self.backend else {
            return;
        };
        for model in self.registry.list_models() {
            for metric in EXTERNAL_METRICS {
                let query =
                    names::render_query(metric.model_query, &[("model_name", model.as_str())]);
                match backend.query_scalar(&query).await {
                    Ok(result) => {
                        self.registry
                            .set_model_metric(&model, metric.name, MetricValue::External(result));
                    }
                    Err(error) => {
                        tracing::warn!(model = %model, metric = metric.name, %error, "external query failed")
                    }
                }
            }
        }
    }

    async fn fetch_body(&self, url: &str) -> anyhow::Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}
