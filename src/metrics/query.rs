// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! External time-series backend client.
//!
//! Issues instant queries against the configured backend and reduces the
//! response vector to a scalar. Failures here are always non-fatal to the
//! scrape cycle: the caller logs and retains the previous observation.

use serde::Deserialize;

use crate::config::BasicAuth;
use crate::metrics::QueryResult;

pub(crate) struct MetricsBackend {
    client: reqwest::Client,
    endpoint: String,
    auth: Option<BasicAuth>,
}

#[derive(Deserialize)]
struct QueryEnvelope {
    status: String,
    #[serde(default)]
    data: QueryData,
}

#[derive(Deserialize, Default)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySample>,
}

#[derive(Deserialize)]
struct QuerySample {
    /// `[unix timestamp, value-as-string]`
    value: (f64, String),
}

impl MetricsBackend {
    pub(crate) fn new(client: reqwest::Client, endpoint: String, auth: Option<BasicAuth>) -> Self {
        Self {
            client,
            endpoint,
            auth,
        }
    }

    /// Run an instant query and return the first sample as a scalar.
    pub(crate) async fn query_scalar(&self, query: &str) -> anyhow::Result<QueryResult> {
        let url = format!("{}/api/v1/query", self.endpoint.trim_end_matches('/'));
        let mut request = self.client.get(&url).query(&[("query", query)]);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await?.error_for_status()?;
        let envelope: QueryEnvelope = response.json().await?;
        if envelope.status != "success" {
            anyhow::bail!("query failed with status {}", envelope.status);
        }
        let sample = envelope
            .data
            .result
            .first()
            .ok_or_else(|| anyhow::anyhow!("query returned an empty result"))?;
        let value = sample.value.1.parse::<f64>()?;
        Ok(QueryResult { value })
    }
}
