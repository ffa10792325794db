// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pod and model metrics.
//!
//! Values come from two places: the text exposition endpoint every inference
//! pod serves (counters, gauges, histograms), and instant queries against an
//! optional external time-series backend. Whatever the source, a value is
//! replaced wholesale on the next successful observation; nothing is merged.

pub mod names;
pub mod parse;
pub mod query;
pub mod scrape;

use serde::Serialize;

/// A single observed metric value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetricValue {
    /// A counter or gauge sample.
    Scalar(f64),
    /// A full histogram family (`_sum`, `_count`, `_bucket` samples).
    Histogram(HistogramValue),
    /// The scalar result of an external backend query.
    External(QueryResult),
}

impl MetricValue {
    /// The scalar view of this value, when one exists.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(value) => Some(*value),
            MetricValue::External(result) => Some(result.value),
            MetricValue::Histogram(_) => None,
        }
    }

    pub fn as_histogram(&self) -> Option<&HistogramValue> {
        match self {
            MetricValue::Histogram(histogram) => Some(histogram),
            _ => None,
        }
    }
}

/// A scraped histogram family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramValue {
    pub sum: f64,
    pub count: f64,
    /// `(upper bound, cumulative count)` pairs in exposition order.
    pub buckets: Vec<HistogramBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBucket {
    pub upper_bound: f64,
    pub cumulative_count: f64,
}

/// The scalar an external backend query returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub value: f64,
}
