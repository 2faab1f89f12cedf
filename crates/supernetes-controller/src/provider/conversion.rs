//! Conversion between pods and workloads in the agent-invoking direction

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;

use supernetes_common::labels::{
    LABEL_ADDITIONAL_NODES, LABEL_WORKLOAD_IDENTIFIER, SCOPE_EXTRA, SCOPE_OPTION,
};
use supernetes_common::{Error, Result};
use supernetes_proto::{Workload, WorkloadMeta, WorkloadSpec};

/// Build the node name list for a workload: the primary node first, then any
/// additional nodes from the additional-nodes label.
fn get_nodes(pod: &Pod, node_name: &str) -> Vec<String> {
    let mut nodes = vec![node_name.to_string()];

    if let Some(additional) = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_ADDITIONAL_NODES))
    {
        nodes.extend(additional.split(',').map(String::from));
    }

    nodes
}

/// Extract pod labels within a Supernetes scope, with the scope prefix
/// stripped.
fn get_scoped_labels(pod: &Pod, scope: &str) -> std::collections::HashMap<String, String> {
    let prefix = format!("{scope}/");

    pod.metadata
        .labels
        .iter()
        .flatten()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

/// Build the workload metadata for the given pod
pub fn workload_meta(pod: &Pod) -> WorkloadMeta {
    let identifier = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_WORKLOAD_IDENTIFIER))
        .cloned()
        .unwrap_or_default();

    WorkloadMeta {
        name: pod.metadata.name.clone().unwrap_or_default(),
        identifier,
        extra: get_scoped_labels(pod, SCOPE_EXTRA),
    }
}

/// Convert the given pod spec into a workload for deployment
pub fn pod_to_workload(pod: &Pod, node_name: &str) -> Result<Workload> {
    let containers = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();

    let [container] = containers else {
        return Err(Error::validation("pod must have exactly one container"));
    };

    Ok(Workload {
        meta: Some(workload_meta(pod)),
        spec: Some(WorkloadSpec {
            image: container.image.clone().unwrap_or_default(),
            command: container.command.clone().unwrap_or_default(),
            args: container.args.clone().unwrap_or_default(),
            node_names: get_nodes(pod, node_name),
            job_options: get_scoped_labels(pod, SCOPE_OPTION),
        }),
        status: None,
    })
}

/// Apply workload metadata returned by the agent back onto the pod
pub fn apply_workload_meta(meta: &WorkloadMeta, pod: &mut Pod) {
    let labels: &mut BTreeMap<String, String> =
        pod.metadata.labels.get_or_insert_with(Default::default);

    for (key, value) in &meta.extra {
        labels.insert(format!("{SCOPE_EXTRA}/{key}"), value.clone());
    }

    labels.insert(
        LABEL_WORKLOAD_IDENTIFIER.to_string(),
        meta.identifier.clone(),
    );
}
