//! Per-node instance
//!
//! Composes the node controller, pod controller, pod provider and optional
//! kubelet façade for one virtual node. All background tasks share a single
//! cancellation scope: any task's failure tears down the rest. `run` may be
//! invoked again after a previous termination; every run builds its cluster
//! objects from a fresh copy of the original node data.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node as K8sNode, NodeAddress, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo, Taint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::Client;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, error};

use supernetes_common::labels::{
    NODE_ROLE_SUPERNETES, NODE_TYPE_VIRTUAL_KUBELET, TAINT_NO_SCHEDULE,
};
use supernetes_common::{Error, Result};
use supernetes_proto::workload_api_client::WorkloadApiClient;
use supernetes_proto::Node;

use crate::environment::Environment;
use crate::provider::{MetricsProvider, PodProvider};
use crate::tracker::Tracker;
use crate::vk::{Auth, KubeletServer, NodeController, PodController};

/// Configuration for one virtual node instance
#[derive(Clone)]
pub struct InstanceConfig {
    /// Kubernetes client
    pub kube_client: Client,
    /// Node data received from the agent
    pub node: Node,
    /// Client for accessing the workload API
    pub workload_client: WorkloadApiClient<Channel>,
    /// Manager for tracked pods
    pub tracker: Arc<Tracker>,
    /// Controller environment configuration
    pub environment: Environment,
    /// Webhook auth shared by all kubelet façades, absent when the
    /// controller identity is unknown
    pub auth: Option<Arc<Auth>>,
    /// Allow anonymous kubelet API access (OpenShift/OKD mode)
    pub disable_kubelet_auth: bool,
}

/// All virtual-kubelet machinery for handling a single node
pub struct Instance {
    config: InstanceConfig,
    metrics: Arc<MetricsProvider>,
    provider: parking_lot::Mutex<Option<Arc<PodProvider>>>,
}

impl Instance {
    /// Create an instance for the given node. Nothing runs until [`run`].
    ///
    /// [`run`]: Instance::run
    pub fn new(config: InstanceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            metrics: Arc::new(MetricsProvider::new()),
            provider: parking_lot::Mutex::new(None),
        })
    }

    /// The node name this instance serves
    pub fn node_name(&self) -> &str {
        self.config
            .node
            .meta
            .as_ref()
            .map(|meta| meta.name.as_str())
            .unwrap_or_default()
    }

    /// Fold a fresh status reading from a reconciliation sweep into the
    /// instance metrics
    pub fn update_metrics(&self, status: Option<&supernetes_proto::NodeStatus>) {
        if let Some(status) = status {
            self.metrics.update(status);
        }
    }

    /// Forward a status update to the pod provider. A no-op until the
    /// instance has started running.
    pub async fn update_status(&self, pod: &k8s_openapi::api::core::v1::Pod, cache: bool) -> Result<()> {
        let provider = self.provider.lock().clone();
        match provider {
            Some(provider) => {
                use crate::tracker::StatusUpdater;
                provider.update_status(pod, cache).await
            }
            None => Ok(()),
        }
    }

    /// Run the instance until the token is cancelled or a component fails.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let node_name = self.node_name().to_string();
        debug!(node = %node_name, "starting instance");

        // Fresh node object per run; the original node data is immutable
        let mut node_object = build_node(&self.config.node, &self.config.environment);

        let provider = PodProvider::new(
            node_name.clone(),
            self.config.workload_client.clone(),
            self.config.tracker.clone(),
            self.metrics.clone(),
        );
        *self.provider.lock() = Some(provider.clone());

        // Pod controller goes first: it must be ready before the node
        // exists, or the cluster could schedule onto a dead node
        let pod_controller = PodController::new(
            self.config.kube_client.clone(),
            provider.clone(),
            node_name.clone(),
        );
        let (pod_ready_tx, pod_ready_rx) = oneshot::channel();
        spawn_component(&token, &node_name, "pod-controller", {
            let token = token.clone();
            async move { pod_controller.run(token, pod_ready_tx).await }
        });

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            ready = pod_ready_rx => {
                if ready.is_err() {
                    return Err(Error::internal("instance", "pod controller failed to become ready"));
                }
            }
        }

        // Kubelet HTTP façade, only when the cluster can reach us
        if let (Some(address), Some(auth)) = (
            self.config.environment.controller_address(),
            self.config.auth.clone(),
        ) {
            let server = KubeletServer::new(
                self.config.kube_client.clone(),
                provider.clone(),
                auth,
                self.config.disable_kubelet_auth,
                node_name.clone(),
                vec![node_name.clone()],
                vec![address],
            );

            let (port_tx, port_rx) = oneshot::channel();
            spawn_component(&token, &node_name, "kubelet-server", {
                let token = token.clone();
                async move { server.run(token, port_tx).await }
            });

            let port = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                port = port_rx => port.map_err(|_| {
                    Error::internal("instance", "kubelet server failed to become ready")
                })?,
            };

            // The façade port goes into the node before it is published
            set_kubelet_port(&mut node_object, port);
        }

        // Publish the node and keep its lease fresh
        let node_controller = Arc::new(NodeController::new(
            self.config.kube_client.clone(),
            node_object,
        ));
        node_controller.publish().await?;
        spawn_component(&token, &node_name, "node-controller", {
            let token = token.clone();
            let node_controller = node_controller.clone();
            async move { node_controller.run(token).await }
        });

        node_controller.set_ready().await?;
        debug!(node = %node_name, "instance running");

        token.cancelled().await;
        debug!(node = %node_name, "instance stopped");
        Ok(())
    }
}

/// Spawn an instance component bound to the shared cancellation scope: a
/// failing component cancels every sibling.
fn spawn_component<F>(token: &CancellationToken, node: &str, component: &'static str, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let token = token.clone();
    let node = node.to_string();

    tokio::spawn(async move {
        match fut.await {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => {}
            Err(e) => error!(node = %node, component, error = %e, "instance component failed"),
        }

        token.cancel();
    });
}

/// Record the kubelet façade port in the node's daemon endpoints
fn set_kubelet_port(node: &mut K8sNode, port: u16) {
    use k8s_openapi::api::core::v1::{DaemonEndpoint, NodeDaemonEndpoints};

    node.status
        .get_or_insert_with(Default::default)
        .daemon_endpoints = Some(NodeDaemonEndpoints {
        kubelet_endpoint: Some(DaemonEndpoint { port: port as i32 }),
    });
}

/// Build the cluster Node object from the agent's node data
fn build_node(node: &Node, environment: &Environment) -> K8sNode {
    let name = node
        .meta
        .as_ref()
        .map(|meta| meta.name.clone())
        .unwrap_or_default();
    let spec = node.spec.clone().unwrap_or_default();

    let mut addresses = vec![NodeAddress {
        type_: "Hostname".to_string(),
        address: name.clone(),
    }];
    if let Some(address) = environment.controller_address() {
        // Pods and the API server reach the kubelet façade through the
        // controller itself
        addresses.push(NodeAddress {
            type_: "InternalIP".to_string(),
            address: address.to_string(),
        });
    }

    let conditions = ["Ready", "DiskPressure", "MemoryPressure", "PIDPressure", "NetworkUnavailable"]
        .into_iter()
        .map(|type_| NodeCondition {
            type_: type_.to_string(),
            status: "False".to_string(),
            ..Default::default()
        })
        .collect();

    let capacity = [
        ("cpu".to_string(), Quantity(spec.cpu_count.to_string())),
        ("memory".to_string(), Quantity(spec.mem_bytes.to_string())),
        ("pods".to_string(), Quantity("110".to_string())),
    ]
    .into_iter()
    .collect::<std::collections::BTreeMap<_, _>>();

    K8sNode {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(
                [
                    ("type".to_string(), NODE_TYPE_VIRTUAL_KUBELET.to_string()),
                    (
                        "kubernetes.io/role".to_string(),
                        NODE_ROLE_SUPERNETES.to_string(),
                    ),
                    ("kubernetes.io/hostname".to_string(), name),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: Some(vec![Taint {
                key: TAINT_NO_SCHEDULE.to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            phase: Some("Pending".to_string()),
            conditions: Some(conditions),
            addresses: Some(addresses),
            capacity: Some(capacity.clone()),
            allocatable: Some(capacity),
            node_info: Some(NodeSystemInfo {
                architecture: std::env::consts::ARCH.to_string(),
                operating_system: std::env::consts::OS.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}
