//! Conversion from Slurm data into API types

use supernetes_proto::{
    Node, NodeMeta, NodeSpec, NodeStatus, Workload, WorkloadMeta, WorkloadStatus, WorkloadPhase,
};
use tracing::error;

use crate::cache;

use super::data::{Job, JobState, SlurmNode};

const MIB: u64 = 1024 * 1024;

/// Convert a Slurm node entry into the API representation.
pub fn node_to_api(node: &SlurmNode) -> Node {
    // Slurm reports memory in "MB", assumed to mean MiB
    let real_mem = node.real_memory * MIB;
    let free_mem = (node.free_mem.as_f64().max(0.0) * MIB as f64) as u64;
    let mut used_mem = real_mem.saturating_sub(free_mem);
    if free_mem > real_mem {
        // On some nodes the free memory can be larger than real memory, fall
        // back to allocated memory in that case. Slurm gives us no details on
        // what these values actually represent or how they're computed.
        used_mem = node.alloc_memory * MIB;
    }

    Node {
        meta: Some(NodeMeta {
            name: node.name.clone(),
        }),
        spec: Some(NodeSpec {
            cpu_count: node.cpus,
            mem_bytes: real_mem,
        }),
        status: Some(NodeStatus {
            // Fixed-point percent value, at least on the deployments observed
            cpu_load: (node.cpu_load.as_f64() / 100.0) as f32,
            // Not accurate: Slurm has no way to retrieve the precise memory
            // use on the node, let alone the working set
            ws_bytes: used_mem,
            partitions: node.partitions.clone(),
        }),
    }
}

/// Convert a Slurm job entry into an API workload, filtering its allocated
/// nodes through the given node predicate.
pub fn job_to_api(job: &Job, node_filter: impl Fn(&str) -> bool) -> Workload {
    let nodes = job
        .job_resources
        .allocated_nodes
        .iter()
        .filter(|node| node_filter(&node.nodename))
        .map(|node| NodeMeta {
            name: node.nodename.clone(),
        })
        .collect();

    Workload {
        meta: Some(WorkloadMeta {
            name: job.name.clone(),
            identifier: job.job_id.to_string(),
            extra: [("job-state".to_string(), job.job_state.as_str().to_string())]
                .into_iter()
                .collect(),
        }),
        spec: None,
        status: Some(WorkloadStatus {
            phase: job_state_phase(&job.job_state) as i32,
            start_time: job.start_time.as_i64(),
            nodes,
            std_out: read_io(job.job_id),
            std_err: String::new(), // stderr is merged into the output artifact
        }),
    }
}

fn read_io(job_id: u64) -> String {
    let path = match cache::job_output_path(&job_id.to_string()) {
        Ok(path) => path,
        Err(_) => return String::new(),
    };

    match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            error!(id = job_id, error = %e, "failed to read I/O file for job");
            String::new()
        }
    }
}

/// Map an `scontrol` job state code onto a workload phase.
///
/// State codes: <https://slurm.schedmd.com/squeue.html#SECTION_JOB-STATE-CODES>
pub fn job_state_phase(state: &JobState) -> WorkloadPhase {
    match state.as_str() {
        "BF" | "BOOT_FAIL" => WorkloadPhase::Failed,
        "CA" | "CANCELLED" => WorkloadPhase::Failed,
        "CD" | "COMPLETED" => WorkloadPhase::Succeeded,
        "CF" | "CONFIGURING" => WorkloadPhase::Pending,
        "CG" | "COMPLETING" => WorkloadPhase::Running,
        "DL" | "DEADLINE" => WorkloadPhase::Failed,
        "F" | "FAILED" => WorkloadPhase::Failed,
        "NF" | "NODE_FAIL" => WorkloadPhase::Failed,
        "OOM" | "OUT_OF_MEMORY" => WorkloadPhase::Failed,
        "PD" | "PENDING" => WorkloadPhase::Pending,
        "PR" | "PREEMPTED" => WorkloadPhase::Failed,
        "R" | "RUNNING" => WorkloadPhase::Running,
        "RD" | "RESV_DEL_HOLD" => WorkloadPhase::Pending,
        "RF" | "REQUEUE_FED" => WorkloadPhase::Pending,
        "RH" | "REQUEUE_HOLD" => WorkloadPhase::Pending,
        "RQ" | "REQUEUED" => WorkloadPhase::Pending,
        "RS" | "RESIZING" => WorkloadPhase::Pending,
        // It's not clear whether the job is still running here
        "RV" | "REVOKED" => WorkloadPhase::Unknown,
        "SI" | "SIGNALING" => WorkloadPhase::Pending,
        "SE" | "SPECIAL_EXIT" => WorkloadPhase::Succeeded,
        "SO" | "STAGE_OUT" => WorkloadPhase::Pending,
        "ST" | "STOPPED" => WorkloadPhase::Pending,
        "S" | "SUSPENDED" => WorkloadPhase::Pending,
        "TO" | "TIMEOUT" => WorkloadPhase::Failed,
        _ => WorkloadPhase::Unknown,
    }
}
