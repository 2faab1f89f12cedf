//! Pod phase transitions
//!
//! `change_phase` reconstructs the pod conditions and container statuses
//! for a phase, carrying over the start time and restart count of
//! containers that already had a status.

use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Pod, PodCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Pod phase string constants
pub mod pod_phase {
    /// Pod accepted but not running
    pub const PENDING: &str = "Pending";
    /// Pod bound and at least one container running
    pub const RUNNING: &str = "Running";
    /// All containers terminated successfully
    pub const SUCCEEDED: &str = "Succeeded";
    /// At least one container terminated in failure
    pub const FAILED: &str = "Failed";
    /// Pod state could not be obtained
    pub const UNKNOWN: &str = "Unknown";
}

/// Install the given phase on the pod, rebuilding conditions and container
/// statuses.
pub fn change_phase(pod: &mut Pod, phase: &str) {
    let status = pod.status.get_or_insert_with(Default::default);
    status.phase = Some(phase.to_string());

    let condition = if phase == pod_phase::RUNNING {
        "True"
    } else {
        "False"
    };

    status.conditions = Some(vec![
        PodCondition {
            type_: "ContainersReady".to_string(),
            status: condition.to_string(),
            ..Default::default()
        },
        PodCondition {
            type_: "Initialized".to_string(),
            status: "True".to_string(), // No init containers
            ..Default::default()
        },
        PodCondition {
            type_: "Ready".to_string(),
            status: condition.to_string(),
            ..Default::default()
        },
        PodCondition {
            type_: "PodScheduled".to_string(),
            // Scheduling has succeeded if we've reached this point
            status: "True".to_string(),
            ..Default::default()
        },
    ]);

    // Carry over the start time and restart count of existing statuses
    let mut previous: std::collections::HashMap<String, (Option<Time>, i32)> = status
        .container_statuses
        .take()
        .unwrap_or_default()
        .into_iter()
        .map(|cs| {
            let started_at = cs
                .state
                .as_ref()
                .and_then(|state| state.running.as_ref())
                .and_then(|running| running.started_at.clone());
            (cs.name.clone(), (started_at, cs.restart_count))
        })
        .collect();

    let containers = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.clone())
        .unwrap_or_default();

    let now = Time(chrono::Utc::now());
    let mut statuses = Vec::with_capacity(containers.len());
    for container in &containers {
        let (started_at, restart_count) = previous.remove(&container.name).unwrap_or_default();

        let state = match phase {
            pod_phase::PENDING => ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("Pending".to_string()),
                    message: Some("Supernetes workload pending".to_string()),
                }),
                ..Default::default()
            },
            pod_phase::RUNNING => ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: Some(now.clone()),
                }),
                ..Default::default()
            },
            pod_phase::SUCCEEDED | pod_phase::FAILED => {
                let (exit_code, reason) = if phase == pod_phase::SUCCEEDED {
                    (0, "Completed")
                } else {
                    (1, "Error")
                };

                ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code,
                        reason: Some(reason.to_string()),
                        message: Some("Supernetes workload terminated".to_string()),
                        finished_at: Some(now.clone()),
                        started_at,
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            }
            _ => ContainerState::default(),
        };

        statuses.push(ContainerStatus {
            name: container.name.clone(),
            image: container.image.clone().unwrap_or_default(),
            ready: phase == pod_phase::RUNNING,
            restart_count,
            state: Some(state),
            ..Default::default()
        });
    }

    let status = pod.status.as_mut().unwrap();
    status.container_statuses = Some(statuses);
}
