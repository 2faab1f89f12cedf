//! Per-node pod lifecycle provider
//!
//! Translates Kubernetes pod CRUD into workload RPCs, tracks submitted
//! workloads and keeps pod statuses converging with scheduler reality.
//! Status updates that arrive before the pod does are cached and applied
//! on creation.

mod conversion;
mod key;
mod logs;
mod metrics;
mod phase;

pub use conversion::{apply_workload_meta, pod_to_workload, workload_meta};
pub use key::PodKey;
pub use logs::{ContainerLogOpts, LogReader};
pub use metrics::MetricsProvider;
pub use phase::{change_phase, pod_phase};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tokio::sync::{mpsc, Mutex};
use tonic::transport::Channel;
use tracing::{error, trace};

use supernetes_common::labels;
use supernetes_common::{Error, Result};
use supernetes_proto::workload_api_client::WorkloadApiClient;
use supernetes_proto::WorkloadLogRequest;

use crate::tracker::{StatusUpdater, Tracker};

/// The pod lifecycle handler for one virtual node
pub struct PodProvider {
    node_name: String,
    workload_client: WorkloadApiClient<Channel>,
    tracker: Arc<Tracker>,
    metrics: Arc<MetricsProvider>,
    state: Mutex<ProviderState>,
}

#[derive(Default)]
struct ProviderState {
    pods: HashMap<PodKey, Pod>,
    pending_status: HashMap<PodKey, PodStatus>,
    notifier: Option<mpsc::Sender<Pod>>,
}

impl PodProvider {
    /// Create a provider for the given node
    pub fn new(
        node_name: String,
        workload_client: WorkloadApiClient<Channel>,
        tracker: Arc<Tracker>,
        metrics: Arc<MetricsProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name,
            workload_client,
            tracker,
            metrics,
            state: Mutex::new(ProviderState::default()),
        })
    }

    /// The node this provider serves
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Node metrics fed by the reconciliation sweeps
    pub fn metrics(&self) -> &MetricsProvider {
        &self.metrics
    }

    /// Register the notifier callback. Must be called before any other
    /// operation; pods mutated by the provider are sent through it for the
    /// pod controller to publish.
    pub async fn notify_pods(&self, notifier: mpsc::Sender<Pod>) {
        self.state.lock().await.notifier = Some(notifier);
    }

    /// Handle pod creation: submit tracked workloads to the agent, register
    /// them with the tracker and publish the initial status.
    pub async fn create_pod(self: &Arc<Self>, mut pod: Pod) -> Result<()> {
        let mut state = self.state.lock().await;

        let pod_key = PodKey::from(&pod);
        trace!(key = %pod_key, "CreatePod called");

        if let Some(status) = state.pending_status.remove(&pod_key) {
            trace!(key = %pod_key, "loaded pending pod status");
            pod.status = Some(status);
        }

        // Tracked jobs are detected through the absence of the untracked
        // workload kind label
        let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
        if labels::is_tracked(&pod_labels) {
            trace!(key = %pod_key, "tracked workload detected");

            // An absent workload identifier means the pod hasn't been
            // submitted yet
            if !pod_labels.contains_key(labels::LABEL_WORKLOAD_IDENTIFIER) {
                trace!(key = %pod_key, "deploying workload");
                let workload = pod_to_workload(&pod, &self.node_name)?;

                match self.workload_client.clone().create(workload).await {
                    Err(e) => {
                        // Mark the pod as failed and continue, otherwise the
                        // pod controller would attempt this over and over
                        error!(key = %pod_key, error = %e, "deploying workload failed");
                        pod.status.get_or_insert_with(Default::default).phase =
                            Some(pod_phase::FAILED.to_string());
                    }
                    Ok(response) => {
                        trace!(key = %pod_key, "applying returned metadata");
                        apply_workload_meta(&response.into_inner(), &mut pod);
                    }
                }
            }

            let has_identifier = pod
                .metadata
                .labels
                .as_ref()
                .map(|labels| labels.contains_key(labels::LABEL_WORKLOAD_IDENTIFIER))
                .unwrap_or(false);
            if has_identifier {
                // With an identifier present, register the pod into the
                // tracker so that its status keeps converging with the
                // workload pods the created job spawned
                self.tracker.track(&pod, self.clone());
            }
        }

        let phase = current_phase(&pod);
        change_phase(&mut pod, &phase);
        set_message(&mut pod, "Supernetes workload was created");

        state.pods.insert(pod_key.clone(), pod.clone());
        notify(&state, pod).await;

        trace!(key = %pod_key, "pod created");
        Ok(())
    }

    /// Handle a pod update, keeping the existing phase
    pub async fn update_pod(&self, mut pod: Pod) -> Result<()> {
        let mut state = self.state.lock().await;

        let pod_key = PodKey::from(&pod);
        trace!(key = %pod_key, "UpdatePod called");

        let phase = current_phase(&pod);
        change_phase(&mut pod, &phase);
        set_message(&mut pod, "Supernetes workload was updated");

        state.pods.insert(pod_key.clone(), pod.clone());
        notify(&state, pod).await;

        trace!(key = %pod_key, "pod updated");
        Ok(())
    }

    /// Handle pod deletion: opportunistically cancel tracked workloads and
    /// drop the pod from the provider.
    pub async fn delete_pod(&self, mut pod: Pod) -> Result<()> {
        let mut state = self.state.lock().await;

        let pod_key = PodKey::from(&pod);
        trace!(key = %pod_key, "DeletePod called");

        if !state.pods.contains_key(&pod_key) {
            trace!(key = %pod_key, "unknown pod");
            return Err(Error::not_found(format!("unknown pod {pod_key}")));
        }

        let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
        if labels::is_tracked(&pod_labels) {
            // Issue an opportunistic deletion request to the agent; job
            // level garbage collection belongs to workload reconciliation
            if let Err(e) = self
                .workload_client
                .clone()
                .delete(workload_meta(&pod))
                .await
            {
                error!(key = %pod_key, error = %e, "deleting workload failed");
            }

            self.tracker.untrack(&pod);
        }

        change_phase(&mut pod, pod_phase::SUCCEEDED);
        set_message(&mut pod, "Supernetes workload was deleted");

        state.pods.remove(&pod_key);
        notify(&state, pod).await;

        trace!(key = %pod_key, "pod deleted");
        Ok(())
    }

    /// Retrieve a deep copy of the given pod
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let state = self.state.lock().await;

        let pod_key = PodKey::new(namespace, name);
        trace!(key = %pod_key, "GetPod called");

        state
            .pods
            .get(&pod_key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown pod {pod_key}")))
    }

    /// Retrieve a deep copy of the given pod's status
    pub async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus> {
        let state = self.state.lock().await;

        let pod_key = PodKey::new(namespace, name);
        trace!(key = %pod_key, "GetPodStatus called");

        state
            .pods
            .get(&pod_key)
            .and_then(|pod| pod.status.clone())
            .ok_or_else(|| Error::not_found(format!("unknown pod {pod_key}")))
    }

    /// Retrieve deep copies of all pods known to this provider
    pub async fn get_pods(&self) -> Vec<Pod> {
        let state = self.state.lock().await;
        trace!(count = state.pods.len(), "GetPods called");
        state.pods.values().cloned().collect()
    }

    /// Whether the provider currently holds the given pod
    pub async fn has_pod(&self, pod_key: &PodKey) -> bool {
        self.state.lock().await.pods.contains_key(pod_key)
    }

    /// Open a log stream for the given pod.
    ///
    /// The `previous` option is irrelevant here: once the workload
    /// associated with a pod completes it cannot restart, scheduler jobs
    /// are one-shot by definition.
    pub async fn container_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        opts: ContainerLogOpts,
    ) -> Result<LogReader> {
        trace!(namespace, pod = pod_name, "GetContainerLogs called");

        let pod = self.get_pod(namespace, pod_name).await?;

        let (request_tx, request_rx) = mpsc::channel(1);
        let response = self
            .workload_client
            .clone()
            .logs(tokio_stream::wrappers::ReceiverStream::new(request_rx))
            .await?;

        request_tx
            .send(WorkloadLogRequest {
                meta: Some(workload_meta(&pod)),
                follow: opts.follow,
                tail: opts.tail.clamp(0, i32::MAX as i64) as i32,
            })
            .await
            .map_err(|_| Error::internal("provider", "log request channel closed"))?;

        Ok(LogReader::start(response.into_inner(), opts, request_tx))
    }
}

#[async_trait]
impl StatusUpdater for PodProvider {
    /// Update the status of the given pod in the provider. Unknown pods are
    /// cached when `cache` is set and silently dropped otherwise; known
    /// pods only change when the phase differs.
    async fn update_status(&self, updated: &Pod, cache: bool) -> Result<()> {
        let mut state = self.state.lock().await;

        let pod_key = PodKey::from(updated);

        let Some(pod) = state.pods.get(&pod_key) else {
            if !cache {
                trace!(key = %pod_key, "pod not found");
                return Ok(());
            }

            trace!(key = %pod_key, "pod not found, caching status");
            state
                .pending_status
                .insert(pod_key, updated.status.clone().unwrap_or_default());
            return Ok(());
        };

        if current_phase(pod) == current_phase(updated) {
            return Ok(()); // Same phase, nothing to do
        }

        let mut pod = pod.clone();

        // Take over the incoming status but keep the recorded container
        // statuses: status carriers never have any, and the phase rebuild
        // below must see the previous ones to carry their start times and
        // restart counts forward
        let container_statuses = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.clone());
        let mut status = updated.status.clone().unwrap_or_default();
        status.container_statuses = container_statuses;
        pod.status = Some(status);

        let phase = current_phase(&pod);
        change_phase(&mut pod, &phase);
        set_message(&mut pod, "Supernetes workload status was updated");

        state.pods.insert(pod_key.clone(), pod.clone());
        notify(&state, pod).await;

        trace!(key = %pod_key, "pod status updated");
        Ok(())
    }
}

fn current_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_else(|| pod_phase::PENDING.to_string())
}

fn set_message(pod: &mut Pod, message: &str) {
    pod.status.get_or_insert_with(Default::default).message = Some(message.to_string());
}

async fn notify(state: &ProviderState, pod: Pod) {
    if let Some(notifier) = &state.notifier {
        let _ = notifier.send(pod).await;
    }
}
