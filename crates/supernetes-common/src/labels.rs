//! Well-known labels, taints and environment variables
//!
//! Everything Supernetes stamps onto cluster objects lives under one of
//! three scopes so that user labels can never collide with ours.

use std::fmt;

/// Scope for node-related metadata
pub const SCOPE_NODE: &str = "supernetes-node";

/// Taint applied to every virtual node; tracked and untracked workload pods
/// tolerate it, nothing else schedules there.
pub const TAINT_NO_SCHEDULE: &str = "supernetes-node/no-schedule";

/// Label carrying a comma-separated list of additional nodes for a workload
pub const LABEL_ADDITIONAL_NODES: &str = "supernetes-node/additional-nodes";

/// Scope for workload-related metadata
pub const SCOPE_WORKLOAD: &str = "supernetes-workload";

/// Label distinguishing tracked from untracked workload pods
pub const LABEL_WORKLOAD_KIND: &str = "supernetes-workload/kind";

/// Label carrying the scheduler-assigned workload identifier
pub const LABEL_WORKLOAD_IDENTIFIER: &str = "supernetes-workload/identifier";

/// Scheduling gate applied to untracked pods without a node allocation
pub const SG_WORKLOAD_UNALLOCATED: &str = "supernetes-workload/unallocated";

/// Scope under which workload diagnostics metadata is projected into labels
pub const SCOPE_EXTRA: &str = "supernetes-extra";

/// Scope under which pod labels are harvested into batch job options
pub const SCOPE_OPTION: &str = "supernetes-option";

/// Field manager for server-side apply and the controller metadata scope
pub const SCOPE_CONTROLLER: &str = "supernetes-controller";

/// Namespace that untracked workload pods are projected into
pub const NAMESPACE_WORKLOAD: &str = "supernetes";

/// Placeholder container name for untracked pods
pub const CONTAINER_PLACEHOLDER: &str = "workload";

/// Placeholder container image for untracked pods
pub const IMAGE_PLACEHOLDER: &str = "none";

/// Node label value marking virtual-kubelet-backed nodes
pub const NODE_TYPE_VIRTUAL_KUBELET: &str = "virtual-kubelet";

/// Node role label value
pub const NODE_ROLE_SUPERNETES: &str = "supernetes";

/// Fixed SAN that the endpoint certificate must carry and that agents accept
pub const CERT_SAN: &str = "supernetes.internal";

/// Environment variable carrying the controller's namespace
pub const ENV_CONTROLLER_NAMESPACE: &str = "SUPERNETES_CONTROLLER_NAMESPACE";

/// Environment variable carrying the controller's service account name
pub const ENV_CONTROLLER_SERVICEACCOUNT: &str = "SUPERNETES_CONTROLLER_SERVICEACCOUNT";

/// Environment variable carrying the controller's pod IP
pub const ENV_CONTROLLER_ADDRESS: &str = "SUPERNETES_CONTROLLER_ADDRESS";

/// The two kinds of workloads Supernetes distinguishes. Tracked workloads are
/// created through the Kubernetes interface (user creates a Pod), while
/// untracked workloads are populated through the agent (user submits, e.g., a
/// Slurm job directly). Tracked workloads must adhere to stricter Kubernetes
/// standards, which includes being deployed through a container image.
/// Untracked workloads can represent anything gathered from the agent
/// environment, including jobs from other users, but have limited utility in
/// the Kubernetes environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Workload originating from a user-created Pod
    Tracked,
    /// Workload observed on the HPC side only
    Untracked,
}

impl WorkloadKind {
    /// Label value for this kind
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Tracked => "tracked",
            WorkloadKind::Untracked => "untracked",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the given label set marks a tracked workload pod. Tracked pods are
/// detected through the *absence* of the untracked kind label.
pub fn is_tracked(labels: &std::collections::BTreeMap<String, String>) -> bool {
    labels
        .get(LABEL_WORKLOAD_KIND)
        .map(|kind| kind != WorkloadKind::Untracked.as_str())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_scoped_constants_share_prefixes() {
        assert!(TAINT_NO_SCHEDULE.starts_with(SCOPE_NODE));
        assert!(LABEL_WORKLOAD_KIND.starts_with(SCOPE_WORKLOAD));
        assert!(LABEL_WORKLOAD_IDENTIFIER.starts_with(SCOPE_WORKLOAD));
        assert!(SG_WORKLOAD_UNALLOCATED.starts_with(SCOPE_WORKLOAD));
    }

    #[test]
    fn test_is_tracked() {
        let mut labels = BTreeMap::new();
        assert!(is_tracked(&labels), "no kind label means tracked");

        labels.insert(
            LABEL_WORKLOAD_KIND.to_string(),
            WorkloadKind::Untracked.as_str().to_string(),
        );
        assert!(!is_tracked(&labels));

        labels.insert(
            LABEL_WORKLOAD_KIND.to_string(),
            WorkloadKind::Tracked.as_str().to_string(),
        );
        assert!(is_tracked(&labels));
    }
}
