//! Pod controller
//!
//! Watches pods bound to one virtual node and drives the pod provider:
//! new pods are created in the provider, pods with a deletion timestamp are
//! deleted (and force-removed from the API, the grace period has already
//! been waited out by the time the provider reports a terminal phase), and
//! provider-side mutations are published back as status patches through the
//! notifier loop.

use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use supernetes_common::Result;

use crate::provider::{pod_phase, PodKey, PodProvider};

/// Drives one node's pod provider from the cluster's pod state
pub struct PodController {
    client: Client,
    provider: Arc<PodProvider>,
    node_name: String,
}

impl PodController {
    /// Create a pod controller for the given node and provider
    pub fn new(client: Client, provider: Arc<PodProvider>, node_name: String) -> Self {
        Self {
            client,
            provider,
            node_name,
        }
    }

    /// Run the controller until cancelled. `ready` fires once the initial
    /// pod listing has been replayed into the provider.
    pub async fn run(&self, token: CancellationToken, ready: oneshot::Sender<()>) -> Result<()> {
        // Provider-side mutations flow back to the API server through this
        // channel
        let (notify_tx, notify_rx) = mpsc::channel(64);
        self.provider.notify_pods(notify_tx).await;

        let sync_client = self.client.clone();
        let sync_token = token.clone();
        let sync = tokio::spawn(status_sync(sync_client, sync_token, notify_rx));

        // Node-specific watcher for pod events
        let api: Api<Pod> = Api::all(self.client.clone());
        let config =
            watcher::Config::default().fields(&format!("spec.nodeName={}", self.node_name));
        let mut events = std::pin::pin!(watcher::watcher(api, config));

        let mut ready = Some(ready);

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.try_next() => event,
            };

            match event {
                Ok(Some(Event::Init)) => {}
                Ok(Some(Event::InitApply(pod))) | Ok(Some(Event::Apply(pod))) => {
                    self.handle_apply(pod).await;
                }
                Ok(Some(Event::InitDone)) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
                Ok(Some(Event::Delete(pod))) => {
                    self.handle_delete(pod).await;
                }
                Ok(None) => break, // Watcher stream ended
                Err(e) => {
                    // The watcher retries internally, transient errors show
                    // up here only for visibility
                    debug!(node = %self.node_name, error = %e, "pod watch error");
                }
            }
        }

        sync.abort();
        Ok(())
    }

    async fn handle_apply(&self, pod: Pod) {
        let pod_key = PodKey::from(&pod);

        if pod.metadata.deletion_timestamp.is_some() {
            trace!(key = %pod_key, "pod is terminating");
            self.handle_delete(pod).await;
            return;
        }

        let result = if self.provider.has_pod(&pod_key).await {
            self.provider.update_pod(pod).await
        } else {
            self.provider.create_pod(pod).await
        };

        if let Err(e) = result {
            warn!(key = %pod_key, error = %e, "pod sync failed");
        }
    }

    async fn handle_delete(&self, pod: Pod) {
        let pod_key = PodKey::from(&pod);

        if !self.provider.has_pod(&pod_key).await {
            return; // Deletion of a pod this provider never held
        }

        if let Err(e) = self.provider.delete_pod(pod).await {
            warn!(key = %pod_key, error = %e, "pod deletion failed");
            return;
        }

        // The provider has released the pod; force-remove it from the API
        // server so it doesn't linger in Terminating
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod_key.namespace);
        match api.delete(&pod_key.name, &DeleteParams::default().grace_period(0)).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => warn!(key = %pod_key, error = %e, "force-deleting pod failed"),
        }
    }
}

/// Publish provider-side pod mutations as status patches
async fn status_sync(client: Client, token: CancellationToken, mut pods: mpsc::Receiver<Pod>) {
    loop {
        let pod = tokio::select! {
            _ = token.cancelled() => return,
            pod = pods.recv() => match pod {
                Some(pod) => pod,
                None => return,
            },
        };

        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();

        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let patch = serde_json::json!({"status": pod.status});
        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => trace!(namespace = %namespace, name = %name, "pod status published"),
            Err(kube::Error::Api(e)) if e.code == 404 => {} // Pod already gone
            Err(e) => warn!(namespace = %namespace, name = %name, error = %e, "publishing pod status failed"),
        }

        // Terminal pods that the user asked to delete are released with an
        // immediate grace period once their status says so
        let terminal = matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some(pod_phase::SUCCEEDED) | Some(pod_phase::FAILED)
        );
        if terminal && pod.metadata.deletion_timestamp.is_some() {
            match api
                .delete(&name, &DeleteParams::default().grace_period(0))
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => warn!(namespace = %namespace, name = %name, error = %e, "releasing pod failed"),
            }
        }
    }
}
