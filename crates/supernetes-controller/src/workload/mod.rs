//! Workload reconciliation: agent jobs projected into untracked pods

mod conversion;
mod inventory;
mod reconciler;

pub use conversion::{pod_name, workload_phase_to_pod_phase, workload_to_pods};
pub use inventory::{Inventory, ResourceRef};
pub use reconciler::{WorkloadReconciler, WorkloadReconcilerConfig};
