//! Projection of agent workloads into untracked pods

use k8s_openapi::api::core::v1::{
    Container, Pod, PodSchedulingGate, PodSpec, PodStatus, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;

use supernetes_common::labels::{
    WorkloadKind, CONTAINER_PLACEHOLDER, IMAGE_PLACEHOLDER, LABEL_WORKLOAD_IDENTIFIER,
    LABEL_WORKLOAD_KIND, NAMESPACE_WORKLOAD, SCOPE_EXTRA, SG_WORKLOAD_UNALLOCATED,
    TAINT_NO_SCHEDULE,
};
use supernetes_proto::{Workload, WorkloadPhase};

use crate::provider::pod_phase;

/// Expand a workload into one pod per allocated node, or a single pod with
/// the unallocated scheduling gate when no nodes are assigned. Index
/// positions are stable.
pub fn workload_to_pods(workload: &Workload) -> Vec<Pod> {
    let nodes = workload
        .status
        .as_ref()
        .map(|status| status.nodes.as_slice())
        .unwrap_or_default();

    if nodes.is_empty() {
        // Map the workload into a single unallocated pod
        return vec![workload_to_pod(workload, None, 0)];
    }

    nodes
        .iter()
        .enumerate()
        .map(|(index, node)| workload_to_pod(workload, Some(&node.name), index))
        .collect()
}

fn workload_to_pod(workload: &Workload, node: Option<&str>, index: usize) -> Pod {
    let meta = workload.meta();
    let status = workload.status.clone().unwrap_or_default();

    // Unallocated workloads do not get scheduled
    let scheduling_gates = match node {
        Some(_) => None,
        None => Some(vec![PodSchedulingGate {
            name: SG_WORKLOAD_UNALLOCATED.to_string(),
        }]),
    };

    let mut pod_labels = std::collections::BTreeMap::from([
        (
            LABEL_WORKLOAD_IDENTIFIER.to_string(),
            meta.identifier.clone(),
        ),
        (
            LABEL_WORKLOAD_KIND.to_string(),
            WorkloadKind::Untracked.as_str().to_string(),
        ),
    ]);

    // Project diagnostics metadata under the extra scope
    for (key, value) in &meta.extra {
        pod_labels.insert(format!("{SCOPE_EXTRA}/{key}"), value.clone());
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(workload, index)),
            namespace: Some(NAMESPACE_WORKLOAD.to_string()),
            labels: Some(pod_labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_PLACEHOLDER.to_string(),
                image: Some(IMAGE_PLACEHOLDER.to_string()),
                ..Default::default()
            }],
            node_name: node.map(String::from),
            tolerations: Some(vec![Toleration {
                key: Some(TAINT_NO_SCHEDULE.to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }]),
            scheduling_gates,
            // The pod controller always waits out the grace period; reducing
            // it from the default 30 seconds greatly speeds up pod deletion
            termination_grace_period_seconds: Some(1),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(workload_phase_to_pod_phase(status.phase()).to_string()),
            start_time: Some(Time(
                chrono::DateTime::from_timestamp(status.start_time, 0).unwrap_or_default(),
            )),
            ..Default::default()
        }),
    }
}

/// Deterministic pod name for a workload projection:
/// `<lower-id>-<lower-name>-<index>`, at most 63 characters, a valid
/// DNS-1123 label.
pub fn pod_name(workload: &Workload, index: usize) -> String {
    let meta = workload.meta();
    let prefix = format!("{}-", to_lower_rfc1123(&meta.identifier, None));
    let suffix = format!("-{index}");

    let budget = 63usize.saturating_sub(prefix.len() + suffix.len());
    format!(
        "{prefix}{}{suffix}",
        to_lower_rfc1123(&meta.name, Some(budget))
    )
    .trim_matches('-')
    .to_string()
}

/// Convert the input into a lowercase RFC 1123 compliant string without
/// periods: non-alphanumeric runs collapse to single dashes and the result
/// neither starts nor ends with a dash. If `max_len` is given, the output is
/// at most that many characters long.
fn to_lower_rfc1123(input: &str, max_len: Option<usize>) -> String {
    let mut result = String::new();

    for c in input.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c);
        } else {
            if result.ends_with('-') {
                continue; // Avoid repeated dashes
            }

            result.push('-');
        }

        if let Some(max_len) = max_len {
            if result.len() == max_len {
                break; // Length limit reached
            }
        }
    }

    // Must start with and end in an alphanumeric character
    result.trim_matches('-').to_string()
}

/// Map a workload phase onto the corresponding pod phase
pub fn workload_phase_to_pod_phase(phase: WorkloadPhase) -> &'static str {
    match phase {
        WorkloadPhase::Pending => pod_phase::PENDING,
        WorkloadPhase::Running => pod_phase::RUNNING,
        WorkloadPhase::Succeeded => pod_phase::SUCCEEDED,
        WorkloadPhase::Failed => pod_phase::FAILED,
        WorkloadPhase::Unknown => pod_phase::UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supernetes_proto::{NodeMeta, WorkloadMeta, WorkloadStatus};

    fn test_workload(name: &str, identifier: &str, nodes: &[&str]) -> Workload {
        Workload {
            meta: Some(WorkloadMeta {
                name: name.to_string(),
                identifier: identifier.to_string(),
                extra: [("job-state".to_string(), "RUNNING".to_string())]
                    .into_iter()
                    .collect(),
            }),
            spec: None,
            status: Some(WorkloadStatus {
                phase: WorkloadPhase::Running as i32,
                start_time: 1700000000,
                nodes: nodes
                    .iter()
                    .map(|name| NodeMeta {
                        name: name.to_string(),
                    })
                    .collect(),
                std_out: String::new(),
                std_err: String::new(),
            }),
        }
    }

    fn is_dns1123_label(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 63
            && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && name.starts_with(|c: char| c.is_ascii_alphanumeric())
            && name.ends_with(|c: char| c.is_ascii_alphanumeric())
    }

    #[test]
    fn test_allocated_workload_expands_per_node() {
        let workload = test_workload("hello", "7", &["n1", "n2"]);
        let pods = workload_to_pods(&workload);
        assert_eq!(pods.len(), 2);

        for (i, pod) in pods.iter().enumerate() {
            assert_eq!(
                pod.metadata.name.as_deref().unwrap(),
                format!("7-hello-{i}")
            );
            assert_eq!(pod.metadata.namespace.as_deref(), Some(NAMESPACE_WORKLOAD));
            let spec = pod.spec.as_ref().unwrap();
            assert_eq!(spec.node_name.as_deref(), Some(if i == 0 { "n1" } else { "n2" }));
            // Allocated pods carry no scheduling gate
            assert!(spec.scheduling_gates.is_none());
            assert_eq!(spec.termination_grace_period_seconds, Some(1));

            let pod_labels = pod.metadata.labels.as_ref().unwrap();
            assert_eq!(pod_labels.get(LABEL_WORKLOAD_KIND).unwrap(), "untracked");
            assert_eq!(pod_labels.get(LABEL_WORKLOAD_IDENTIFIER).unwrap(), "7");
            assert_eq!(
                pod_labels.get("supernetes-extra/job-state").unwrap(),
                "RUNNING"
            );

            let toleration = &spec.tolerations.as_ref().unwrap()[0];
            assert_eq!(toleration.key.as_deref(), Some(TAINT_NO_SCHEDULE));
            assert_eq!(toleration.effect.as_deref(), Some("NoSchedule"));

            assert_eq!(
                pod.status.as_ref().unwrap().phase.as_deref(),
                Some("Running")
            );
        }
    }

    #[test]
    fn test_unallocated_workload_gets_scheduling_gate() {
        let workload = test_workload("queued", "9", &[]);
        let pods = workload_to_pods(&workload);
        assert_eq!(pods.len(), 1);

        let spec = pods[0].spec.as_ref().unwrap();
        assert!(spec.node_name.is_none());
        let gates = spec.scheduling_gates.as_ref().unwrap();
        assert_eq!(gates[0].name, SG_WORKLOAD_UNALLOCATED);
    }

    #[test]
    fn test_pod_name_is_deterministic_and_valid() {
        let workload = test_workload("Hello World_x", "JOB42", &["n1"]);
        let name = pod_name(&workload, 0);
        assert_eq!(name, "job42-hello-world-x-0");
        assert_eq!(name, pod_name(&workload, 0));
        assert!(is_dns1123_label(&name));
    }

    #[test]
    fn test_pod_name_truncates_to_63() {
        let long_name = "a very long workload name that goes on and on and on and certainly \
                         exceeds the limit";
        let workload = test_workload(long_name, "12345678", &["n1"]);

        for index in [0, 7, 42] {
            let name = pod_name(&workload, index);
            assert!(name.len() <= 63, "{name:?} is too long");
            assert!(is_dns1123_label(&name), "{name:?} is not a label");
            assert!(name.starts_with("12345678-a-very-long"));
            assert!(name.ends_with(&format!("-{index}")));
        }
    }

    #[test]
    fn test_pod_name_collapses_dash_runs() {
        let workload = test_workload("weird---name__here", "1", &[]);
        let name = pod_name(&workload, 0);
        assert_eq!(name, "1-weird-name-here-0");
        assert!(!name.contains("--"));
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(workload_phase_to_pod_phase(WorkloadPhase::Pending), "Pending");
        assert_eq!(workload_phase_to_pod_phase(WorkloadPhase::Running), "Running");
        assert_eq!(
            workload_phase_to_pod_phase(WorkloadPhase::Succeeded),
            "Succeeded"
        );
        assert_eq!(workload_phase_to_pod_phase(WorkloadPhase::Failed), "Failed");
        assert_eq!(workload_phase_to_pod_phase(WorkloadPhase::Unknown), "Unknown");
    }
}
