//! Kubelet serving certificates: issuance through the cluster's CSR
//! workflow and the auto-approver for the controller's own requests

mod approver;
mod manager;

pub use approver::CsrApprover;
pub use manager::{RotatingCertResolver, ServingCertManager};
