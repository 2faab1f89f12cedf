//! WorkloadApi service implementation
//!
//! Workload deletion for Slurm just means cancelling the job, it's the best
//! approximation there is. Once a job disappears from scheduler tracking,
//! the controller's workload reconciliation removes the associated pods.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use prost_types::Timestamp;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, trace};

use supernetes_common::{Error, Filter};
use supernetes_proto::workload_api_server::WorkloadApi;
use supernetes_proto::{
    Workload, WorkloadLogChunk, WorkloadLogRequest, WorkloadMeta, WorkloadStatus,
};

use crate::runtime::Runtime;
use crate::slurm::{self, SchedulerClient};
use crate::{cache, tail, timestamp};

/// Serves workload lifecycle operations for the controller
pub struct WorkloadService {
    runtime: Arc<Runtime>,
    filter: Filter,
    scheduler: SchedulerClient,
}

impl WorkloadService {
    /// Create a workload service
    pub fn new(runtime: Arc<Runtime>, filter: Filter, scheduler: SchedulerClient) -> Self {
        Self {
            runtime,
            filter,
            scheduler,
        }
    }
}

/// Map internal failures onto typed RPC status codes
fn to_status(error: Error) -> Status {
    match &error {
        Error::Validation { .. } => Status::invalid_argument(error.to_string()),
        Error::NotFound { .. } => Status::not_found(error.to_string()),
        _ => Status::internal(error.to_string()),
    }
}

#[tonic::async_trait]
impl WorkloadApi for WorkloadService {
    async fn create(&self, request: Request<Workload>) -> Result<Response<WorkloadMeta>, Status> {
        let workload = request.into_inner();
        debug!(workload = ?workload.meta, "Create invoked");

        let job_id = self.runtime.run(&workload).await.map_err(to_status)?;

        debug!(id = %job_id, "job dispatched");

        // Fill in the tracking identifier
        let mut meta = workload.meta();
        meta.identifier = job_id;
        Ok(Response::new(meta))
    }

    async fn update(&self, request: Request<Workload>) -> Result<Response<()>, Status> {
        debug!(workload = ?request.get_ref().meta, "Update invoked");
        Err(Status::unimplemented("method Update not implemented"))
    }

    async fn delete(&self, request: Request<WorkloadMeta>) -> Result<Response<()>, Status> {
        let meta = request.into_inner();
        debug!(workload = ?meta, "Delete invoked");

        self.scheduler.cancel(&meta.identifier).await.map_err(|e| {
            error!(id = %meta.identifier, error = %e, "failed to cancel job");
            to_status(e)
        })?;

        Ok(Response::new(()))
    }

    async fn get(&self, request: Request<WorkloadMeta>) -> Result<Response<Workload>, Status> {
        debug!(workload = ?request.get_ref(), "Get invoked");
        Err(Status::unimplemented("method Get not implemented"))
    }

    async fn get_status(
        &self,
        request: Request<WorkloadMeta>,
    ) -> Result<Response<WorkloadStatus>, Status> {
        debug!(workload = ?request.get_ref(), "GetStatus invoked");
        Err(Status::unimplemented("method GetStatus not implemented"))
    }

    type ListStream = Pin<Box<dyn Stream<Item = Result<Workload, Status>> + Send>>;

    async fn list(&self, _request: Request<()>) -> Result<Response<Self::ListStream>, Status> {
        debug!("List invoked");

        let job_data = self.scheduler.jobs().await.map_err(|e| {
            debug!(error = %e, "failed to read job data from Slurm");
            Status::unavailable("failed to read job data from Slurm")
        })?;

        let all = job_data.jobs.len();
        let workloads: Vec<Result<Workload, Status>> = job_data
            .jobs
            .iter()
            .filter(|job| self.filter.partition(&job.partition))
            .map(|job| slurm::job_to_api(job, |name| self.filter.node(name)))
            .map(Ok)
            .collect();

        debug!(all, filtered = workloads.len(), "sending job list");
        Ok(Response::new(Box::pin(tokio_stream::iter(workloads))))
    }

    type LogsStream = ReceiverStream<Result<WorkloadLogChunk, Status>>;

    async fn logs(
        &self,
        request: Request<Streaming<WorkloadLogRequest>>,
    ) -> Result<Response<Self::LogsStream>, Status> {
        debug!("Logs invoked");
        let mut requests = request.into_inner();

        let request = requests
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing log request"))?;
        let meta = request.meta.unwrap_or_default();
        trace!(id = %meta.identifier, "received log request");

        if meta.identifier.is_empty() {
            error!(name = %meta.name, "log streaming failed: missing job identifier");
            return Err(Status::invalid_argument("missing job identifier"));
        }

        // Prevent escape from the I/O directory through a malicious
        // workload identifier
        let path = cache::job_output_path(&meta.identifier).map_err(|e| {
            error!(id = %meta.identifier, error = %e, "prevented filesystem escape");
            Status::invalid_argument("invalid job identifier")
        })?;

        let token = CancellationToken::new();
        let (line_tx, mut line_rx) = mpsc::channel::<Vec<u8>>(64);
        let (chunk_tx, chunk_rx) = mpsc::channel(64);

        // Follow the job output file
        let tail_token = token.clone();
        let tail_path = path.clone();
        let tail_n = request.tail.max(0) as usize;
        tokio::spawn(async move {
            if let Err(e) = tail::tail_file(tail_token, &tail_path, line_tx, tail_n, request.follow).await
            {
                error!(path = %tail_path.display(), error = %e, "tailing log failed");
            }
            // Dropping the sender ends the forwarding loop below
        });

        // Watch for the controller closing its sending side
        let watch_token = token.clone();
        tokio::spawn(async move {
            loop {
                match requests.message().await {
                    Ok(Some(_)) => continue, // Ignore further requests
                    _ => break,
                }
            }
            watch_token.cancel();
        });

        // Forward tailed lines as timestamped chunks
        let id = meta.identifier.clone();
        tokio::spawn(async move {
            let _guard = token.drop_guard(); // Stop the tailer when done
            while let Some(line) = line_rx.recv().await {
                let (stamp, content) = timestamp::split_line(&line);
                let chunk = WorkloadLogChunk {
                    timestamp: stamp.map(|t| Timestamp {
                        seconds: t.timestamp(),
                        nanos: t.timestamp_subsec_nanos() as i32,
                    }),
                    line: content.to_vec(),
                };

                if chunk_tx.send(Ok(chunk)).await.is_err() {
                    trace!(id = %id, "log receiver closed");
                    return;
                }
            }
            trace!(id = %id, "stopping log streaming");
        });

        Ok(Response::new(ReceiverStream::new(chunk_rx)))
    }
}
