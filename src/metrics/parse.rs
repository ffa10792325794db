// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Text exposition parsing.
//!
//! The scraper only needs a fixed set of families out of each body, so this
//! is a targeted line scan rather than a full exposition parser: comments are
//! skipped, a sample belongs to a family when its name (the text before `{`
//! or whitespace) matches exactly, and the value is the last whitespace-
//! separated field. Timestamps and exemplars are not expected from the
//! engines we scrape.

use super::{HistogramBucket, HistogramValue};

/// Extract a counter or gauge sample for `family`.
///
/// When the family carries several labeled samples the first one wins; the
/// engine exposes one sample per family per pod.
pub fn parse_scalar(body: &str, family: &str) -> Option<f64> {
    body.lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| sample_value(line, family))
}

/// Extract a full histogram family: `<family>_sum`, `<family>_count` and the
/// ordered `<family>_bucket{le="..."}` samples.
///
/// Returns `None` unless both `_sum` and `_count` are present; a histogram
/// without buckets is accepted (the engine may not have observed anything
/// yet).
pub fn parse_histogram(body: &str, family: &str) -> Option<HistogramValue> {
    let sum_name = format!("{family}_sum");
    let count_name = format!("{family}_count");
    let bucket_name = format!("{family}_bucket");

    let mut sum = None;
    let mut count = None;
    let mut buckets = Vec::new();

    for line in body.lines() {
        if line.starts_with('#') {
            continue;
        }
        if let Some(value) = sample_value(line, &sum_name) {
            sum.get_or_insert(value);
        } else if let Some(value) = sample_value(line, &count_name) {
            count.get_or_insert(value);
        } else if let Some(value) = sample_value(line, &bucket_name) {
            if let Some(upper_bound) = le_bound(line) {
                buckets.push(HistogramBucket {
                    upper_bound,
                    cumulative_count: value,
                });
            }
        }
    }

    Some(HistogramValue {
        sum: sum?,
        count: count?,
        buckets,
    })
}

/// The sample value when `line` belongs to `family` (exact name match).
fn sample_value(line: &str, family: &str) -> Option<f64> {
    let rest = line.strip_prefix(family)?;
    let is_sample = rest.starts_with('{') || rest.starts_with(' ') || rest.starts_with('\t');
    if !is_sample {
        return None;
    }
    line.split_whitespace().last()?.parse::<f64>().ok()
}

/// The `le` label of a `_bucket` sample. `+Inf` maps to `f64::INFINITY`.
fn le_bound(line: &str) -> Option<f64> {
    let start = line.find("le=\"")? + 4;
    let end = start + line[start..].find('"')?;
    let raw = &line[start..end];
    if raw == "+Inf" {
        Some(f64::INFINITY)
    } else {
        raw.parse::<f64>().ok()
    }
}
