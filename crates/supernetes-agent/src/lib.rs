//! Supernetes agent
//!
//! Runs adjacent to an HPC scheduler (Slurm), opens a reverse tunnel to the
//! controller and serves the `NodeApi` and `WorkloadApi` RPC services over
//! it. Workload submissions become batch jobs, native scheduler jobs are
//! reflected back to the controller, and job output files are tailed and
//! streamed on demand.

pub mod agent;
pub mod cache;
pub mod dispatch;
pub mod runtime;
pub mod server;
pub mod slurm;
pub mod tail;
pub mod timestamp;
