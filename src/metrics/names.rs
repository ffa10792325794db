// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Metric name constants.
//!
//! Single source of truth for the metric families the aggregator scrapes from
//! every pod and the queries it issues against the external backend. Keeping
//! them here (instead of scattered literals) lets the scraper, the router and
//! the tests agree on spelling.

/// Number of requests currently running on the engine.
pub const NUM_REQUESTS_RUNNING: &str = "vllm:num_requests_running";
/// Number of requests waiting in the engine queue.
pub const NUM_REQUESTS_WAITING: &str = "vllm:num_requests_waiting";
/// Number of requests swapped out of GPU memory.
pub const NUM_REQUESTS_SWAPPED: &str = "vllm:num_requests_swapped";
/// Average prompt throughput in tokens per second.
pub const AVG_PROMPT_THROUGHPUT_TOKS_PER_S: &str = "vllm:avg_prompt_throughput_toks_per_s";
/// Average generation throughput in tokens per second.
pub const AVG_GENERATION_THROUGHPUT_TOKS_PER_S: &str = "vllm:avg_generation_throughput_toks_per_s";

pub const ITERATION_TOKENS_TOTAL: &str = "vllm:iteration_tokens_total";
pub const TIME_TO_FIRST_TOKEN_SECONDS: &str = "vllm:time_to_first_token_seconds";
pub const TIME_PER_OUTPUT_TOKEN_SECONDS: &str = "vllm:time_per_output_token_seconds";
pub const E2E_REQUEST_LATENCY_SECONDS: &str = "vllm:e2e_request_latency_seconds";
pub const REQUEST_QUEUE_TIME_SECONDS: &str = "vllm:request_queue_time_seconds";
pub const REQUEST_INFERENCE_TIME_SECONDS: &str = "vllm:request_inference_time_seconds";
pub const REQUEST_DECODE_TIME_SECONDS: &str = "vllm:request_decode_time_seconds";
pub const REQUEST_PREFILL_TIME_SECONDS: &str = "vllm:request_prefill_time_seconds";

/// Counter and gauge families parsed from every pod scrape.
pub const COUNTER_GAUGE_METRICS: [&str; 5] = [
    NUM_REQUESTS_RUNNING,
    NUM_REQUESTS_WAITING,
    NUM_REQUESTS_SWAPPED,
    AVG_PROMPT_THROUGHPUT_TOKS_PER_S,
    AVG_GENERATION_THROUGHPUT_TOKS_PER_S,
];

/// Histogram families parsed from every pod scrape.
pub const HISTOGRAM_METRICS: [&str; 8] = [
    ITERATION_TOKENS_TOTAL,
    TIME_TO_FIRST_TOKEN_SECONDS,
    TIME_PER_OUTPUT_TOKEN_SECONDS,
    E2E_REQUEST_LATENCY_SECONDS,
    REQUEST_QUEUE_TIME_SECONDS,
    REQUEST_INFERENCE_TIME_SECONDS,
    REQUEST_DECODE_TIME_SECONDS,
    REQUEST_PREFILL_TIME_SECONDS,
];

/// A metric resolved through the external time-series backend rather than a
/// pod scrape. `pod_query` is templated per pod, `model_query` per model.
#[derive(Debug, Clone, Copy)]
pub struct ExternalMetric {
    pub name: &'static str,
    pub pod_query: &'static str,
    pub model_query: &'static str,
}

/// p95 time-to-first-token over the trailing five minutes.
pub const P95_TTFT_5M: ExternalMetric = ExternalMetric {
    name: "p95_ttft_5m",
    pod_query: "histogram_quantile(0.95, sum by(le) (rate(vllm:time_to_first_token_seconds_bucket{model_name=\"${model_name}\", instance=\"${instance}\"}[5m])))",
    model_query: "histogram_quantile(0.95, sum by(le) (rate(vllm:time_to_first_token_seconds_bucket{model_name=\"${model_name}\"}[5m])))",
};

/// Metrics resolved through the external backend each scrape cycle.
pub const EXTERNAL_METRICS: [ExternalMetric; 1] = [P95_TTFT_5M];

/// Substitute `${label}` placeholders in a query template.
pub fn render_query(template: &str, labels: &[(&str, &str)]) -> String {
    let mut query = template.to_string();
    for (key, value) in labels {
        query = query.replace(&format!("${{{key}}}"), value);
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_all_labels() {
        let query = render_query(
            P95_TTFT_5M.pod_query,
            &[("model_name", "llama-7b"), ("instance", "10.0.0.7/8000")],
        );
        assert!(query.contains("model_name=\"llama-7b\""));
        assert!(query.contains("instance=\"10.0.0.7/8000\""));
        assert!(!query.contains("${"));
    }

    #[test]
    fn model_query_has_no_instance_label() {
        let query = render_query(P95_TTFT_5M.model_query, &[("model_name", "llama-7b")]);
        assert!(!query.contains("instance"));
        assert!(!query.contains("${"));
    }
}
