//! Protocol definitions for Supernetes controller-agent communication.
//!
//! This crate provides the gRPC service and message definitions spoken over
//! the reverse tunnel between the controller (Kubernetes side) and agents
//! (HPC side).
//!
//! # Architecture
//!
//! All connections are initiated **outbound** from the agent. The controller
//! listens for tunnel connections, but once the tunnel is established the
//! RPC roles invert: the agent serves [`node_api_server::NodeApi`] and
//! [`workload_api_server::WorkloadApi`], and the controller issues RPCs
//! through the tunnel as if it were a regular client. This keeps HPC
//! environments behind firewalls reachable without any inbound ports.
//!
//! # Services
//!
//! - **NodeApi**: server-streaming node inventory (`GetNodes`)
//! - **WorkloadApi**: workload lifecycle (`Create`/`Delete`/`List`) and
//!   bidirectional log streaming (`Logs`); `Update`/`Get`/`GetStatus` are
//!   reserved and return `Unimplemented`

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated protobuf types
pub mod supernetes {
    /// Version 1alpha1 of the Supernetes protocol
    pub mod v1alpha1 {
        tonic::include_proto!("supernetes.v1alpha1");
    }
}

pub use supernetes::v1alpha1::*;

impl Workload {
    /// Workload metadata, or a default when the field is unset on the wire.
    pub fn meta(&self) -> WorkloadMeta {
        self.meta.clone().unwrap_or_default()
    }
}

impl WorkloadPhase {
    /// Whether the phase is terminal (the workload can no longer progress).
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_phase_terminal() {
        assert!(WorkloadPhase::Succeeded.is_terminal());
        assert!(WorkloadPhase::Failed.is_terminal());
        assert!(!WorkloadPhase::Pending.is_terminal());
        assert!(!WorkloadPhase::Running.is_terminal());
        assert!(!WorkloadPhase::Unknown.is_terminal());
    }

    #[test]
    fn test_workload_meta_accessor() {
        let workload = Workload::default();
        assert_eq!(workload.meta(), WorkloadMeta::default());

        let workload = Workload {
            meta: Some(WorkloadMeta {
                name: "hello".into(),
                identifier: "7".into(),
                extra: Default::default(),
            }),
            ..Default::default()
        };
        assert_eq!(workload.meta().identifier, "7");
    }
}
