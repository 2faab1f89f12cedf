//! Stale-resource inventory
//!
//! A set of resource identities recorded per reconciliation sweep. Diffing
//! the previous sweep's inventory against the current one yields the
//! resources whose originating job has vanished and which are subject to
//! garbage collection.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;

use supernetes_common::labels::{WorkloadKind, LABEL_WORKLOAD_KIND};
use supernetes_common::Result;

/// Identity of a managed cluster resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    /// API version, e.g. `v1`
    pub api_version: String,
    /// Resource kind, e.g. `Pod`
    pub kind: String,
    /// Namespace of the resource
    pub namespace: String,
    /// Name of the resource
    pub name: String,
}

impl ResourceRef {
    /// Identity of the given pod
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            api_version: <Pod as k8s_openapi::Resource>::API_VERSION.to_string(),
            kind: <Pod as k8s_openapi::Resource>::KIND.to_string(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

/// Set of resource identities for stale-resource diffing
#[derive(Debug, Default)]
pub struct Inventory {
    entries: BTreeSet<ResourceRef>,
}

impl Inventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add all pods carrying the given workload kind label to the inventory
    pub async fn populate(&mut self, client: &Client, kind: WorkloadKind) -> Result<()> {
        let pods: Api<Pod> = Api::all(client.clone());
        let params = ListParams::default().labels(&format!("{LABEL_WORKLOAD_KIND}={kind}"));

        for pod in pods.list(&params).await?.items {
            self.add(ResourceRef::from_pod(&pod));
        }

        Ok(())
    }

    /// Record a resource identity
    pub fn add(&mut self, resource: ResourceRef) {
        self.entries.insert(resource);
    }

    /// The resources present here but absent from `target`
    pub fn diff(&self, target: &Inventory) -> Vec<ResourceRef> {
        self.entries.difference(&target.entries).cloned().collect()
    }

    /// Number of recorded identities
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the inventory is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
