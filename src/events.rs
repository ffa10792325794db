// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster event ingest.
//!
//! The external event source delivers pod and model-adapter lifecycle events
//! over a channel; the cache does not care whether that is a cluster
//! informer, a gossip relay or a replay log. Delivery is at-least-once with
//! monotonic resource versions per object, so every handler below must be
//! idempotent under replays.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::{ModelAdapter, Pod, PodRegistry};

/// A lifecycle event for one of the two resource kinds the cache tracks.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    PodAdded(Pod),
    PodUpdated { old: Pod, new: Pod },
    PodDeleted(Pod),
    ModelAdapterAdded(ModelAdapter),
    ModelAdapterUpdated { old: ModelAdapter, new: ModelAdapter },
    ModelAdapterDeleted(ModelAdapter),
}

/// Apply one event to the registry.
pub fn apply_event(registry: &PodRegistry, event: ClusterEvent) {
    match event {
        ClusterEvent::PodAdded(pod) => registry.add_pod(pod),
        ClusterEvent::PodUpdated { old, new } => registry.update_pod(&old, new),
        ClusterEvent::PodDeleted(pod) => registry.delete_pod(&pod),
        ClusterEvent::ModelAdapterAdded(adapter) => registry.add_model_adapter(&adapter),
        ClusterEvent::ModelAdapterUpdated { old, new } => {
            registry.update_model_adapter(&old, &new)
        }
        ClusterEvent::ModelAdapterDeleted(adapter) => registry.delete_model_adapter(&adapter),
    }
}

/// Drain the event stream into the registry until the stream closes or the
/// token fires.
pub(crate) async fn run_ingest(
    registry: Arc<PodRegistry>,
    mut events: mpsc::Receiver<ClusterEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("event ingest stopped");
                return;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!("cluster event stream closed");
                    return;
                };
                apply_event(&registry, event);
                registry.debug_dump();
            }
        }
    }
}
