//! NodeApi service implementation

use std::pin::Pin;

use futures::Stream;
use tonic::{Request, Response, Status};
use tracing::debug;

use supernetes_common::Filter;
use supernetes_proto::node_api_server::NodeApi;
use supernetes_proto::Node;

use crate::slurm::{self, SchedulerClient};

/// Serves the filtered node inventory to the controller
#[derive(Debug)]
pub struct NodeService {
    filter: Filter,
    scheduler: SchedulerClient,
}

impl NodeService {
    /// Create a node service with the given filter
    pub fn new(filter: Filter, scheduler: SchedulerClient) -> Self {
        Self { filter, scheduler }
    }
}

#[tonic::async_trait]
impl NodeApi for NodeService {
    type GetNodesStream = Pin<Box<dyn Stream<Item = Result<Node, Status>> + Send>>;

    async fn get_nodes(
        &self,
        _request: Request<()>,
    ) -> Result<Response<Self::GetNodesStream>, Status> {
        debug!("GetNodes invoked");

        let node_data = self.scheduler.nodes().await.map_err(|e| {
            debug!(error = %e, "failed to read node data from Slurm");
            Status::unavailable("failed to read node data from Slurm")
        })?;

        let all = node_data.nodes.len();
        let nodes: Vec<Result<Node, Status>> = node_data
            .nodes
            .iter()
            .filter(|node| self.filter.node(&node.name))
            .filter(|node| {
                node.partitions
                    .iter()
                    .any(|partition| self.filter.partition(partition))
            })
            .map(slurm::node_to_api)
            .map(Ok)
            .collect();

        debug!(all, filtered = nodes.len(), "sending node list");
        Ok(Response::new(Box::pin(tokio_stream::iter(nodes))))
    }
}
