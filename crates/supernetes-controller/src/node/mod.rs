//! Node reconciliation
//!
//! Streams the agent's node inventory and owns one [`Instance`] per node:
//! instances are started for tracked nodes, stopped and retired for nodes
//! that vanished from the sweep. Sweeps are atomic: the stream is buffered
//! before any state is committed, so a failure mid-stream leaves the
//! instance set untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, error};

use supernetes_common::Result;
use supernetes_proto::node_api_client::NodeApiClient;
use supernetes_proto::workload_api_client::WorkloadApiClient;
use supernetes_proto::Node;

use crate::environment::Environment;
use crate::reconciler::Reconcile;
use crate::tracker::{StatusUpdater, Tracker};
use crate::vk::{Auth, Instance, InstanceConfig};

/// Configuration for the node reconciler
pub struct NodeReconcilerConfig {
    /// Client for accessing the node API
    pub node_client: NodeApiClient<Channel>,
    /// Client for accessing the workload API
    pub workload_client: WorkloadApiClient<Channel>,
    /// Manager for tracked pods
    pub tracker: Arc<Tracker>,
    /// Kubernetes client
    pub kube_client: Client,
    /// Controller environment configuration
    pub environment: Environment,
    /// Allow anonymous kubelet API access (OpenShift/OKD mode)
    pub disable_kubelet_auth: bool,
}

struct InstanceEntry {
    tracked: bool,
    instance: Arc<Instance>,
    run: Option<RunHandle>,
}

struct RunHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl InstanceEntry {
    fn new(instance: Arc<Instance>) -> Self {
        Self {
            tracked: true, // New instances are always tracked
            instance,
            run: None,
        }
    }

    /// Start the instance if it isn't already running
    fn start(&mut self, parent: &CancellationToken) {
        if let Some(run) = &self.run {
            if !run.handle.is_finished() {
                return; // Already running
            }
        }

        let token = parent.child_token();
        let instance = self.instance.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            let node = instance.node_name().to_string();
            if let Err(e) = instance.run(run_token).await {
                if !e.is_cancellation() {
                    error!(node = %node, error = %e, "failed to run virtual node instance");
                }
            }
        });

        self.run = Some(RunHandle { token, handle });
    }

    fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.token.cancel();
        }
    }
}

/// Manages the per-node virtual-kubelet instances
pub struct NodeReconciler {
    config: NodeReconcilerConfig,
    auth: Option<Arc<Auth>>,
    instances: tokio::sync::Mutex<HashMap<String, InstanceEntry>>,
}

impl NodeReconciler {
    /// Create a node reconciler. The kubelet webhook auth is started only
    /// when the controller's identity is fully known; without it the
    /// kubelet façades stay disabled.
    pub async fn new(config: NodeReconcilerConfig) -> Result<Arc<Self>> {
        let identity_known = config.environment.controller_namespace().is_some()
            && config.environment.controller_address().is_some();

        let auth = if identity_known {
            Some(Auth::start(config.kube_client.clone()).await?)
        } else {
            debug!("controller identity unknown, kubelet HTTP façades disabled");
            None
        };

        Ok(Arc::new(Self {
            config,
            auth,
            instances: tokio::sync::Mutex::new(HashMap::new()),
        }))
    }

    /// Names of the nodes currently backed by an instance
    pub async fn tracked_nodes(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        let mut names: Vec<_> = instances.keys().cloned().collect();
        names.sort();
        names
    }

    fn new_instance(&self, node: Node) -> Arc<Instance> {
        Instance::new(InstanceConfig {
            kube_client: self.config.kube_client.clone(),
            node,
            workload_client: self.config.workload_client.clone(),
            tracker: self.config.tracker.clone(),
            environment: self.config.environment.clone(),
            auth: self.auth.clone(),
            disable_kubelet_auth: self.config.disable_kubelet_auth,
        })
    }
}

#[async_trait]
impl Reconcile for NodeReconciler {
    async fn reconcile(&self, token: &CancellationToken) -> Result<()> {
        let mut stream = self
            .config
            .node_client
            .clone()
            .get_nodes(())
            .await?
            .into_inner();

        // Buffer the whole sweep first: a partial stream must not commit
        // any state changes
        let mut sweep = Vec::new();
        while let Some(node) = stream.message().await? {
            sweep.push(node);
        }

        let mut instances = self.instances.lock().await;

        // Untrack everything
        for entry in instances.values_mut() {
            entry.tracked = false;
        }

        for node in sweep {
            let name = node
                .meta
                .as_ref()
                .map(|meta| meta.name.clone())
                .unwrap_or_default();
            let status = node.status.clone();

            match instances.get_mut(&name) {
                Some(entry) => {
                    // Existing node, still tracked; duplicate names within
                    // one sweep only refresh the existing instance
                    entry.tracked = true;
                }
                None => {
                    debug!(node = %name, "discovered node");
                    instances.insert(name.clone(), InstanceEntry::new(self.new_instance(node)));
                }
            }

            if let Some(entry) = instances.get(&name) {
                entry.instance.update_metrics(status.as_ref());
            }
        }

        // Start tracked and stop untracked instances
        for entry in instances.values_mut() {
            if entry.tracked {
                entry.start(token);
            } else {
                debug!(node = %entry.instance.node_name(), "retiring node");
                entry.stop();
            }
        }

        // Remove all instances that are no longer tracked
        instances.retain(|_, entry| entry.tracked);

        Ok(())
    }
}

#[async_trait]
impl StatusUpdater for NodeReconciler {
    async fn update_status(&self, pod: &Pod, cache: bool) -> Result<()> {
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
            .unwrap_or_default();

        if node_name.is_empty() {
            return Ok(()); // Pod is not scheduled onto any node
        }

        let instances = self.instances.lock().await;
        if let Some(entry) = instances.get(node_name) {
            return entry.instance.update_status(pod, cache).await;
        }

        Ok(()) // Pod is associated with an unknown node
    }
}
