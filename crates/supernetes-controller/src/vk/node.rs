//! Node controller
//!
//! Publishes the virtual Node object, keeps a coordination/v1 lease fresh
//! as its heartbeat and updates the node status on request. The node status
//! is externally managed: reconciliation marks the node ready once the
//! instance is serving.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use supernetes_common::labels::SCOPE_CONTROLLER;
use supernetes_common::Result;

use crate::util::with_gvk;

/// Namespace holding the node heartbeat leases
const LEASE_NAMESPACE: &str = "kube-node-lease";

/// Lease duration granted per renewal
const LEASE_DURATION: Duration = Duration::from_secs(40);

/// Interval between lease renewals
const LEASE_INTERVAL: Duration = Duration::from_secs(10);

/// Publishes and maintains a single virtual Node
pub struct NodeController {
    client: Client,
    node: Node,
}

impl NodeController {
    /// Create a controller for the given node object
    pub fn new(client: Client, node: Node) -> Self {
        Self { client, node }
    }

    /// The name of the managed node
    pub fn node_name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }

    /// Publish the Node object and its initial status. Completion of this
    /// call is the controller's readiness signal.
    pub async fn publish(&self) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let name = self.node_name().to_string();

        let mut object = with_gvk(&self.node)?;
        if let Some(object) = object.as_object_mut() {
            object.remove("status");
        }
        api.patch(
            &name,
            &PatchParams::apply(SCOPE_CONTROLLER).force(),
            &Patch::Apply(&object),
        )
        .await?;

        if let Some(status) = &self.node.status {
            let patch = serde_json::json!({"status": status});
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        debug!(node = %name, "node published");
        Ok(())
    }

    /// Renew the node lease until cancelled. Renewal errors are logged and
    /// retried on the next tick; cancellation is silent.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(LEASE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.renew_lease().await {
                // The next tick retries
                warn!(node = %self.node_name(), error = %e, "status update failed");
            }
        }
    }

    async fn renew_lease(&self) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        let name = self.node_name().to_string();

        let lease = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {"name": name},
            "spec": {
                "holderIdentity": name,
                "leaseDurationSeconds": LEASE_DURATION.as_secs(),
                "renewTime": MicroTime(chrono::Utc::now()),
            },
        });

        api.patch(
            &name,
            &PatchParams::apply(SCOPE_CONTROLLER).force(),
            &Patch::Apply(&lease),
        )
        .await?;

        Ok(())
    }

    /// Mark the node as ready
    pub async fn set_ready(&self) -> Result<()> {
        debug!(node = %self.node_name(), "marking node as ready");

        let now = Time(chrono::Utc::now());
        let patch = serde_json::json!({
            "status": {
                "phase": "Running",
                "conditions": [{
                    "type": "Ready",
                    "status": "True",
                    "reason": "KubeletReady",
                    "message": "Kubelet is ready",
                    "lastHeartbeatTime": now,
                    "lastTransitionTime": now,
                }],
            }
        });

        let api: Api<Node> = Api::all(self.client.clone());
        api.patch_status(
            self.node_name(),
            &PatchParams::default(),
            &Patch::Strategic(&patch),
        )
        .await?;

        Ok(())
    }

}
