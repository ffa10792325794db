// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pod/model bidirectional index.
//!
//! The registry is the canonical record of which pods exist and which models
//! (base models and adapters) each one hosts. The two mirrored projections,
//! `pod->models` and `model->pods`, are kept entry-for-entry consistent: no
//! binding may exist in one without the other. The mirrors hold pod *names*
//! and resolve to the canonical [`Pod`] on read, so there is no ownership
//! cycle between the two directions.
//!
//! One reader/writer lock guards the registry together with the pod and
//! model metrics maps. Every write serializes on it; reads take the shared
//! lock and return owned snapshots, so callers never iterate under the lock.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::metrics::MetricValue;

/// Pod label naming the base model the pod serves. Pods without it are
/// invisible to the cache.
pub const MODEL_IDENTIFIER_LABEL: &str = "model.aibrix.ai/name";

/// Liveness phase reported by the event source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

/// A pod as seen by the cache: identity, network address, phase and labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    /// Empty until the pod has been assigned an address.
    pub pod_ip: String,
    pub phase: PodPhase,
    pub labels: HashMap<String, String>,
}

impl Pod {
    /// The base model this pod serves, when labeled.
    pub fn model_label(&self) -> Option<&str> {
        self.labels.get(MODEL_IDENTIFIER_LABEL).map(String::as_str)
    }
}

/// An adapter model and the pods currently hosting it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelAdapter {
    pub name: String,
    pub namespace: String,
    /// Pod names reported by the adapter controller.
    pub instances: Vec<String>,
}

#[derive(Default)]
struct Inner {
    pods: HashMap<String, Pod>,
    pod_to_models: HashMap<String, HashSet<String>>,
    model_to_pods: HashMap<String, HashSet<String>>,
    pod_metrics: HashMap<String, HashMap<String, MetricValue>>,
    model_metrics: HashMap<String, HashMap<String, MetricValue>>,
}

/// The canonical pod registry with its mirrored model projections.
#[derive(Default)]
pub struct PodRegistry {
    inner: RwLock<Inner>,
}

impl PodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pod and bind it to its base model. Pods without the model
    /// identifier label are ignored. Idempotent on repeated adds.
    pub fn add_pod(&self, pod: Pod) {
        let Some(model) = pod.model_label().map(str::to_string) else {
            return;
        };
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let name = pod.name.clone();
        inner.pods.insert(name.clone(), pod);
        add_binding(&mut inner, &name, &model);
        tracing::debug!(pod = %name, model = %model, "pod registered");
    }

    /// Replace the bindings implied by `old`'s label with those of `new`.
    /// A no-op when neither carries the model identifier label.
    pub fn update_pod(&self, old: &Pod, new: Pod) {
        let old_model = old.model_label().map(str::to_string);
        let new_model = new.model_label().map(str::to_string);
        if old_model.is_none() && new_model.is_none() {
            return;
        }

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(model) = old_model {
            inner.pods.remove(&old.name);
            remove_binding(&mut inner, &old.name, &model);
        }
        if let Some(model) = new_model {
            let name = new.name.clone();
            inner.pods.insert(name.clone(), new);
            add_binding(&mut inner, &name, &model);
        }
        tracing::debug!(pod = %old.name, "pod updated");
    }

    /// Drop a pod, every binding that references it, and its metrics.
    pub fn delete_pod(&self, pod: &Pod) {
        if pod.model_label().is_none() {
            return;
        }
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(models) = inner.pod_to_models.get(&pod.name).cloned() {
            for model in models {
                remove_binding(&mut inner, &pod.name, &model);
            }
        }
        inner.pod_to_models.remove(&pod.name);
        inner.pods.remove(&pod.name);
        inner.pod_metrics.remove(&pod.name);
        tracing::debug!(pod = %pod.name, "pod deleted");
    }

    /// Bind an adapter model to each of its instance pods. Unknown pods are
    /// logged and skipped; the adapter itself still registers.
    pub fn add_model_adapter(&self, adapter: &ModelAdapter) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for pod in &adapter.instances {
            add_binding(&mut inner, pod, &adapter.name);
        }
        tracing::debug!(adapter = %adapter.name, "model adapter registered");
    }

    /// Apply the symmetric difference of two adapter revisions: bindings only
    /// in `old` are removed, bindings only in `new` are added.
    pub fn update_model_adapter(&self, old: &ModelAdapter, new: &ModelAdapter) {
        let old_pods: HashSet<&String> = old.instances.iter().collect();
        let new_pods: HashSet<&String> = new.instances.iter().collect();

        let mut inner = self.inner.write().expect("registry lock poisoned");
        for pod in old_pods.difference(&new_pods) {
            remove_binding(&mut inner, pod, &old.name);
        }
        for pod in new_pods.difference(&old_pods) {
            add_binding(&mut inner, pod, &new.name);
        }
        tracing::debug!(adapter = %new.name, "model adapter updated");
    }

    /// Remove every binding for the adapter and drop its projection entry.
    pub fn delete_model_adapter(&self, adapter: &ModelAdapter) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for pod in &adapter.instances {
            remove_binding(&mut inner, pod, &adapter.name);
        }
        inner.model_to_pods.remove(&adapter.name);
        inner.model_metrics.remove(&adapter.name);
        tracing::debug!(adapter = %adapter.name, "model adapter deleted");
    }

    pub fn get_pod(&self, name: &str) -> Result<Pod, CacheError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .pods
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::PodNotFound(name.to_string()))
    }

    /// Snapshot of every registered pod.
    pub fn list_pods(&self) -> Vec<Pod> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.pods.values().cloned().collect()
    }

    /// Models currently present in the projection.
    pub fn list_models(&self) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.model_to_pods.keys().cloned().collect()
    }

    /// The pods hosting `model`, resolved through the canonical registry.
    pub fn get_pods_for_model(&self, model: &str) -> Result<Vec<Pod>, CacheError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let names = inner
            .model_to_pods
            .get(model)
            .ok_or_else(|| CacheError::ModelNotFound(model.to_string()))?;
        Ok(names
            .iter()
            .filter_map(|name| inner.pods.get(name).cloned())
            .collect())
    }

    pub fn get_models_for_pod(&self, pod: &str) -> Result<HashSet<String>, CacheError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .pod_to_models
            .get(pod)
            .cloned()
            .ok_or_else(|| CacheError::PodNotFound(pod.to_string()))
    }

    pub fn model_exists(&self, model: &str) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.model_to_pods.contains_key(model)
    }

    pub fn get_pod_metric(&self, pod: &str, metric: &str) -> Result<MetricValue, CacheError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let metrics = inner
            .pod_metrics
            .get(pod)
            .ok_or_else(|| CacheError::PodNotFound(pod.to_string()))?;
        metrics
            .get(metric)
            .cloned()
            .ok_or_else(|| CacheError::MetricMissing {
                pod: pod.to_string(),
                metric: metric.to_string(),
            })
    }

    pub fn get_model_metric(&self, model: &str, metric: &str) -> Result<MetricValue, CacheError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let metrics = inner
            .model_metrics
            .get(model)
            .ok_or_else(|| CacheError::ModelNotFound(model.to_string()))?;
        metrics
            .get(metric)
            .cloned()
            .ok_or_else(|| CacheError::MetricMissing {
                pod: model.to_string(),
                metric: metric.to_string(),
            })
    }

    /// Merge one pod's scrape results. Each key is replaced wholesale; keys
    /// absent from `values` keep their prior value, so a family that failed
    /// to parse this cycle does not erase the last good observation.
    pub(crate) fn update_pod_metrics(&self, pod: &str, values: Vec<(String, MetricValue)>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if !inner.pods.contains_key(pod) {
            // The pod was deleted while its scrape was in flight.
            return;
        }
        let metrics = inner.pod_metrics.entry(pod.to_string()).or_default();
        for (name, value) in values {
            metrics.insert(name, value);
        }
    }

    pub(crate) fn set_model_metric(&self, model: &str, metric: &str, value: MetricValue) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner
            .model_metrics
            .entry(model.to_string())
            .or_default()
            .insert(metric.to_string(), value);
    }

    /// Trace-level dump of the full registry state, for chasing mapping bugs
    /// in live clusters. Free when TRACE is disabled.
    pub fn debug_dump(&self) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        let inner = self.inner.read().expect("registry lock poisoned");
        for pod in inner.pods.values() {
            tracing::trace!(pod = %pod.name, ip = %pod.pod_ip, phase = ?pod.phase, "registry pod");
        }
        for (pod, models) in &inner.pod_to_models {
            tracing::trace!(pod = %pod, models = ?models, "pod->models");
        }
        for (model, pods) in &inner.model_to_pods {
            tracing::trace!(model = %model, pods = ?pods, "model->pods");
        }
    }

    #[cfg(test)]
    fn assert_mirrored(&self) {
        let inner = self.inner.read().expect("registry lock poisoned");
        for (pod, models) in &inner.pod_to_models {
            for model in models {
                assert!(
                    inner
                        .model_to_pods
                        .get(model)
                        .is_some_and(|pods| pods.contains(pod)),
                    "binding ({pod}, {model}) missing from model->pods"
                );
            }
        }
        for (model, pods) in &inner.model_to_pods {
            for pod in pods {
                assert!(
                    inner
                        .pod_to_models
                        .get(pod)
                        .is_some_and(|models| models.contains(model)),
                    "binding ({pod}, {model}) missing from pod->models"
                );
            }
        }
    }
}

/// Install the (pod, model) binding in both projections. The pod must already
/// be in the canonical registry; a binding against an unknown pod is an event
/// worth surfacing but never a failure.
fn add_binding(inner: &mut Inner, pod: &str, model: &str) {
    if !inner.pods.contains_key(pod) {
        tracing::error!(pod = %pod, model = %model, "pod does not exist in the registry");
        return;
    }
    inner
        .pod_to_models
        .entry(pod.to_string())
        .or_default()
        .insert(model.to_string());
    inner
        .model_to_pods
        .entry(model.to_string())
        .or_default()
        .insert(pod.to_string());
}

fn remove_binding(inner: &mut Inner, pod: &str, model: &str) {
    if let Some(models) = inner.pod_to_models.get_mut(pod) {
        models.remove(model);
    }
    if let Some(pods) = inner.model_to_pods.get_mut(model) {
        pods.remove(pod);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled_pod(name: &str, model: &str) -> Pod {
        Pod {
            name: name.to_string(),
            namespace: "default".to_string(),
            pod_ip: "10.0.0.1".to_string(),
            phase: PodPhase::Running,
            labels: HashMap::from([(MODEL_IDENTIFIER_LABEL.to_string(), model.to_string())]),
        }
    }

    #[test]
    fn unlabeled_pod_is_ignored() {
        let registry = PodRegistry::new();
        registry.add_pod(Pod {
            name: "p1".to_string(),
            ..Default::default()
        });
        assert!(registry.get_pod("p1").is_err());
        assert!(registry.list_pods().is_empty());
    }

    #[test]
    fn add_pod_binds_base_model() {
        let registry = PodRegistry::new();
        registry.add_pod(labeled_pod("p1", "llama"));
        registry.add_pod(labeled_pod("p1", "llama")); // idempotent

        assert!(registry.model_exists("llama"));
        let pods = registry.get_pods_for_model("llama").unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].name, "p1");
        assert_eq!(
            registry.get_models_for_pod("p1").unwrap(),
            HashSet::from(["llama".to_string()])
        );
        registry.assert_mirrored();
    }

    #[test]
    fn adapter_lifecycle_keeps_mirror() {
        let registry = PodRegistry::new();
        registry.add_pod(labeled_pod("p1", "llama"));

        let adapter = ModelAdapter {
            name: "lora-a".to_string(),
            namespace: "default".to_string(),
            instances: vec!["p1".to_string()],
        };
        registry.add_model_adapter(&adapter);
        registry.assert_mirrored();
        assert!(registry.model_exists("lora-a"));
        assert_eq!(
            registry.get_models_for_pod("p1").unwrap(),
            HashSet::from(["llama".to_string(), "lora-a".to_string()])
        );

        registry.delete_model_adapter(&adapter);
        registry.assert_mirrored();
        assert!(!registry.model_exists("lora-a"));
        assert_eq!(
            registry.get_models_for_pod("p1").unwrap(),
            HashSet::from(["llama".to_string()])
        );
        let pods = registry.get_pods_for_model("llama").unwrap();
        assert_eq!(pods[0].name, "p1");
    }

    #[test]
    fn adapter_update_applies_symmetric_difference() {
        let registry = PodRegistry::new();
        registry.add_pod(labeled_pod("p1", "llama"));
        registry.add_pod(labeled_pod("p2", "llama"));

        let old = ModelAdapter {
            name: "lora-a".to_string(),
            namespace: "default".to_string(),
            instances: vec!["p1".to_string()],
        };
        registry.add_model_adapter(&old);

        let new = ModelAdapter {
            instances: vec!["p2".to_string()],
            ..old.clone()
        };
        registry.update_model_adapter(&old, &new);
        registry.assert_mirrored();

        let pods = registry.get_pods_for_model("lora-a").unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].name, "p2");
        assert!(!registry.get_models_for_pod("p1").unwrap().contains("lora-a"));
    }

    #[test]
    fn adapter_with_unknown_pod_does_not_fail() {
        let registry = PodRegistry::new();
        registry.add_model_adapter(&ModelAdapter {
            name: "lora-a".to_string(),
            namespace: "default".to_string(),
            instances: vec!["ghost".to_string()],
        });
        registry.assert_mirrored();
        // The binding was skipped entirely: no half-entries anywhere.
        assert!(!registry.model_exists("lora-a"));
    }

    #[test]
    fn update_pod_swaps_label_bindings() {
        let registry = PodRegistry::new();
        let old = labeled_pod("p1", "llama");
        registry.add_pod(old.clone());

        let new = labeled_pod("p1", "mistral");
        registry.update_pod(&old, new);
        registry.assert_mirrored();

        assert_eq!(
            registry.get_models_for_pod("p1").unwrap(),
            HashSet::from(["mistral".to_string()])
        );
        assert!(registry.get_pods_for_model("llama").unwrap().is_empty());
    }

    #[test]
    fn delete_pod_drops_bindings_and_metrics() {
        let registry = PodRegistry::new();
        let pod = labeled_pod("p1", "llama");
        registry.add_pod(pod.clone());
        registry.update_pod_metrics(
            "p1",
            vec![(
                "vllm:num_requests_running".to_string(),
                MetricValue::Scalar(2.0),
            )],
        );
        assert!(registry
            .get_pod_metric("p1", "vllm:num_requests_running")
            .is_ok());

        registry.delete_pod(&pod);
        registry.assert_mirrored();
        assert!(registry.get_pod("p1").is_err());
        assert!(matches!(
            registry.get_pod_metric("p1", "vllm:num_requests_running"),
            Err(CacheError::PodNotFound(_))
        ));
        assert!(registry.get_pods_for_model("llama").unwrap().is_empty());
    }

    #[test]
    fn metric_missing_is_distinct_from_pod_missing() {
        let registry = PodRegistry::new();
        registry.add_pod(labeled_pod("p1", "llama"));
        registry.update_pod_metrics(
            "p1",
            vec![(
                "vllm:num_requests_running".to_string(),
                MetricValue::Scalar(2.0),
            )],
        );
        assert!(matches!(
            registry.get_pod_metric("p1", "vllm:num_requests_waiting"),
            Err(CacheError::MetricMissing { .. })
        ));
    }

    #[test]
    fn scrape_merge_retains_unparsed_families() {
        let registry = PodRegistry::new();
        registry.add_pod(labeled_pod("p1", "llama"));
        registry.update_pod_metrics(
            "p1",
            vec![
                ("a".to_string(), MetricValue::Scalar(1.0)),
                ("b".to_string(), MetricValue::Scalar(2.0)),
            ],
        );
        // Next cycle only family "a" parsed; "b" keeps its prior value.
        registry.update_pod_metrics("p1", vec![("a".to_string(), MetricValue::Scalar(9.0))]);
        assert_eq!(
            registry.get_pod_metric("p1", "a").unwrap().as_scalar(),
            Some(9.0)
        );
        assert_eq!(
            registry.get_pod_metric("p1", "b").unwrap().as_scalar(),
            Some(2.0)
        );
    }
}
