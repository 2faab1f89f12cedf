//! Supernetes controller
//!
//! Kubernetes-side half of Supernetes: terminates reverse tunnels from
//! agents, reconciles the agents' view of the HPC scheduler into virtual
//! nodes and pods, and serves pod lifecycle operations for every virtual
//! node through a per-node instance bundle.

pub mod certificates;
pub mod endpoint;
pub mod environment;
pub mod node;
pub mod provider;
pub mod reconciler;
pub mod tracker;
pub mod util;
pub mod vk;
pub mod workload;
