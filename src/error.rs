// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the cache's read API.
///
/// These are the only errors the router sees on the request path. Scrape and
/// external-backend failures never reach here; they are logged and the prior
/// value is retained.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The pod is absent from the registry. The router should pick a fallback.
    #[error("pod does not exist in the cache: {0}")]
    PodNotFound(String),

    /// The model is absent from the registry.
    #[error("model does not exist in the cache: {0}")]
    ModelNotFound(String),

    /// The pod exists but the metric has not been scraped yet (or did not
    /// parse). Callers should assume the pessimistic value.
    #[error("no metric {metric} available for pod {pod}")]
    MetricMissing { pod: String, metric: String },

    /// Construction-time mis-configuration. Fatal; nothing else is.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
