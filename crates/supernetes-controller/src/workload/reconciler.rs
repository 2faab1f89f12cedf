//! Workload reconciliation
//!
//! Streams the agent's job inventory, projects every job into untracked
//! pods via server-side apply, pushes their statuses into the providers
//! (and, for the primary pod, into the tracker), and garbage-collects pods
//! whose originating job has vanished.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::debug;

use supernetes_common::labels::{WorkloadKind, SCOPE_CONTROLLER};
use supernetes_common::Result;
use supernetes_proto::workload_api_client::WorkloadApiClient;

use crate::reconciler::Reconcile;
use crate::tracker::{StatusUpdater, Tracker};
use crate::util::with_gvk;

use super::conversion::workload_to_pods;
use super::inventory::{Inventory, ResourceRef};

/// Outcome of a server-side apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyAction {
    /// The pod did not exist before
    Created,
    /// The pod spec changed
    Configured,
    /// The force-apply left the pod as it was
    Unchanged,
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApplyAction::Created => "created",
            ApplyAction::Configured => "configured",
            ApplyAction::Unchanged => "unchanged",
        })
    }
}

/// Configuration for the workload reconciler
pub struct WorkloadReconcilerConfig {
    /// Client for accessing the workload API
    pub workload_client: WorkloadApiClient<Channel>,
    /// Callback to trigger manual pod status updates in the providers
    pub status_updater: Arc<dyn StatusUpdater>,
    /// Manager for tracked pods
    pub tracker: Arc<Tracker>,
    /// Kubernetes client
    pub kube_client: Client,
}

/// Reconciles the agent's job inventory into untracked pods
pub struct WorkloadReconciler {
    workload_client: WorkloadApiClient<Channel>,
    status_updater: Arc<dyn StatusUpdater>,
    tracker: Arc<Tracker>,
    kube_client: Client,
    state: tokio::sync::Mutex<SweepState>,
}

#[derive(Default)]
struct SweepState {
    /// Inventory of the previous completed sweep, lazily bootstrapped from
    /// the cluster
    inventory: Option<Inventory>,
    /// resourceVersion of every applied pod, for apply-action
    /// classification
    versions: HashMap<ResourceRef, String>,
}

impl WorkloadReconciler {
    /// Create a workload reconciler
    pub fn new(config: WorkloadReconcilerConfig) -> Arc<Self> {
        Arc::new(Self {
            workload_client: config.workload_client,
            status_updater: config.status_updater,
            tracker: config.tracker,
            kube_client: config.kube_client,
            state: tokio::sync::Mutex::new(SweepState::default()),
        })
    }

    async fn apply_pod(&self, pod: &Pod, previous: Option<&String>) -> Result<(ApplyAction, String)> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.kube_client.clone(), namespace);

        // The pod status is applied separately through the providers, strip
        // it from the submission
        let mut object = with_gvk(pod)?;
        if let Some(object) = object.as_object_mut() {
            object.remove("status");
        }

        let applied = api
            .patch(
                name,
                &PatchParams::apply(SCOPE_CONTROLLER).force(),
                &Patch::Apply(&object),
            )
            .await?;

        let version = applied.metadata.resource_version.unwrap_or_default();
        let action = match previous {
            None => ApplyAction::Created,
            Some(previous) if *previous == version => ApplyAction::Unchanged,
            Some(_) => ApplyAction::Configured,
        };

        Ok((action, version))
    }

    async fn delete_stale(&self, stale: Vec<ResourceRef>) -> Result<()> {
        for resource in stale {
            let api: Api<Pod> = Api::namespaced(self.kube_client.clone(), &resource.namespace);
            match api
                .delete(&resource.name, &DeleteParams::background())
                .await
            {
                Ok(_) => {
                    debug!(subject = %format!("{}/{}", resource.namespace, resource.name), action = "deleted", "applied pod")
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {} // Already gone
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Reconcile for WorkloadReconciler {
    async fn reconcile(&self, _token: &CancellationToken) -> Result<()> {
        let mut stream = self
            .workload_client
            .clone()
            .list(())
            .await?
            .into_inner();

        let mut state = self.state.lock().await;

        if state.inventory.is_none() {
            // Initialize the pod tracking inventory with the untracked pods
            // currently present in the cluster
            let mut inventory = Inventory::new();
            inventory
                .populate(&self.kube_client, WorkloadKind::Untracked)
                .await?;
            state.inventory = Some(inventory);
        }

        // Inventory for the resources of this sweep
        let mut new_inventory = Inventory::new();
        let mut new_versions = HashMap::new();

        while let Some(workload) = stream.message().await? {
            let pods = workload_to_pods(&workload);

            for (index, pod) in pods.iter().enumerate() {
                let resource = ResourceRef::from_pod(pod);
                let (action, version) = self
                    .apply_pod(pod, state.versions.get(&resource))
                    .await?;

                new_inventory.add(resource.clone());
                new_versions.insert(resource.clone(), version);

                if matches!(action, ApplyAction::Created | ApplyAction::Unchanged) {
                    // For any created pods or pods with an unchanged spec
                    // (but possibly changed status), a manual status update
                    // in the provider is the only way the untracked pod
                    // learns its phase
                    self.status_updater.update_status(pod, true).await?;

                    // The primary pod additionally updates the
                    // corresponding tracked pod, if present. Tracked pod
                    // status updates are not cached in the provider.
                    if index == 0 {
                        self.tracker.update_status(pod, false).await?;
                    }
                }

                if action != ApplyAction::Unchanged {
                    debug!(
                        subject = %format!("{}/{}", resource.namespace, resource.name),
                        action = %action,
                        "applied pod"
                    );
                }
            }
        }

        // Detect and collect stale resources
        let stale = state
            .inventory
            .as_ref()
            .map(|inventory| inventory.diff(&new_inventory))
            .unwrap_or_default();
        self.delete_stale(stale).await?;

        // The new inventory is now current
        state.inventory = Some(new_inventory);
        state.versions = new_versions;

        Ok(())
    }
}
