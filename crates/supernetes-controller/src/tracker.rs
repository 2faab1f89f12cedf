//! Tracked-pod registry
//!
//! Maps workload identifiers to the pod that created them and a status
//! update capability. The workload reconciliation loop pushes job state
//! through here so that the originating tracked pod converges with HPC
//! reality. The `StatusUpdater` capability breaks the reference cycle
//! between the pod provider, the tracker and the workload reconciler: no
//! participant holds another's concrete type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use parking_lot::RwLock;
use tracing::trace;

use supernetes_common::labels::LABEL_WORKLOAD_IDENTIFIER;
use supernetes_common::Result;

/// Asynchronous pod status update capability.
///
/// Implementors must not modify the pod's spec nor rely on it being present;
/// only the metadata and status carry meaning.
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    /// Update the status of the given pod. `cache` indicates whether the
    /// implementation is allowed to retain the update for a pod it does not
    /// know yet.
    async fn update_status(&self, pod: &Pod, cache: bool) -> Result<()>;
}

struct Tracked {
    meta: ObjectMeta,
    updater: Arc<dyn StatusUpdater>,
}

/// Global map from workload identifier to the tracked pod and its updater
#[derive(Default)]
pub struct Tracker {
    tracked: RwLock<HashMap<String, Tracked>>,
}

impl Tracker {
    /// Create an empty tracker
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track the given pod under its workload identifier label. The most
    /// recent mapping for an identifier wins.
    pub fn track(&self, pod: &Pod, updater: Arc<dyn StatusUpdater>) {
        let Some(identifier) = identifier(pod) else {
            return; // Nothing to key the pod on
        };

        trace!(
            name = pod.metadata.name.as_deref().unwrap_or_default(),
            namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
            "tracking pod"
        );

        self.tracked.write().insert(
            identifier,
            Tracked {
                meta: pod.metadata.clone(),
                updater,
            },
        );
    }

    /// Remove the pod's identifier mapping
    pub fn untrack(&self, pod: &Pod) {
        let Some(identifier) = identifier(pod) else {
            return;
        };

        trace!(
            name = pod.metadata.name.as_deref().unwrap_or_default(),
            namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
            "untracking pod"
        );

        self.tracked.write().remove(&identifier);
    }
}

#[async_trait]
impl StatusUpdater for Tracker {
    async fn update_status(&self, pod: &Pod, cache: bool) -> Result<()> {
        let Some(identifier) = identifier(pod) else {
            return Ok(());
        };

        // Dispatch happens outside the lock
        let entry = {
            let tracked = self.tracked.read();
            tracked
                .get(&identifier)
                .map(|entry| (entry.meta.clone(), entry.updater.clone()))
        };

        if let Some((meta, updater)) = entry {
            // Carrier binding the tracked pod's metadata to the status of
            // the passed-in pod
            let status_pod = Pod {
                metadata: meta,
                spec: None,
                status: pod.status.clone(),
            };

            return updater.update_status(&status_pod, cache).await;
        }

        Ok(())
    }
}

fn identifier(pod: &Pod) -> Option<String> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_WORKLOAD_IDENTIFIER))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(Pod, bool)>>,
    }

    #[async_trait]
    impl StatusUpdater for Recorder {
        async fn update_status(&self, pod: &Pod, cache: bool) -> Result<()> {
            self.updates.lock().push((pod.clone(), cache));
            Ok(())
        }
    }

    fn tracked_pod(name: &str, identifier: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    [(LABEL_WORKLOAD_IDENTIFIER.to_string(), identifier.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_update_forwards_tracked_meta_with_new_status() {
        let tracker = Tracker::new();
        let recorder = Arc::new(Recorder::default());

        let pod = tracked_pod("job-pod", "42");
        tracker.track(&pod, recorder.clone());

        // Status carrier with different metadata but the same identifier
        let mut carrier = tracked_pod("42-job-0", "42");
        carrier.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });

        tracker.update_status(&carrier, false).await.unwrap();

        let updates = recorder.updates.lock();
        assert_eq!(updates.len(), 1);
        let (forwarded, cache) = &updates[0];
        // Metadata of the originally tracked pod, status of the carrier
        assert_eq!(forwarded.metadata.name.as_deref(), Some("job-pod"));
        assert_eq!(
            forwarded.status.as_ref().unwrap().phase.as_deref(),
            Some("Running")
        );
        assert!(forwarded.spec.is_none(), "spec must never be forwarded");
        assert!(!cache);
    }

    #[tokio::test]
    async fn test_last_track_wins_and_untrack_removes() {
        let tracker = Tracker::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let pod_a = tracked_pod("a", "7");
        let pod_b = tracked_pod("b", "7");
        tracker.track(&pod_a, first.clone());
        tracker.track(&pod_b, second.clone());

        tracker.update_status(&tracked_pod("x", "7"), true).await.unwrap();
        assert!(first.updates.lock().is_empty());
        assert_eq!(second.updates.lock().len(), 1);
        assert_eq!(
            second.updates.lock()[0].0.metadata.name.as_deref(),
            Some("b")
        );

        tracker.untrack(&pod_b);
        tracker.update_status(&tracked_pod("x", "7"), true).await.unwrap();
        assert_eq!(second.updates.lock().len(), 1, "no update after untrack");
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_a_silent_noop() {
        let tracker = Tracker::new();
        tracker
            .update_status(&tracked_pod("x", "missing"), true)
            .await
            .unwrap();

        // Pods without the identifier label are ignored entirely
        let unlabeled = Pod::default();
        tracker.update_status(&unlabeled, true).await.unwrap();
        tracker.track(&unlabeled, Arc::new(Recorder::default()));
        tracker.untrack(&unlabeled);
    }
}
