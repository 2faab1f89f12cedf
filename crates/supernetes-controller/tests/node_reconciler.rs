//! Node reconciliation integration tests
//!
//! Drives the node reconciler against a mock `NodeApi` server. The
//! Kubernetes client points at a dead address: instance internals cannot
//! reach a cluster here, but the sweep bookkeeping (creation, retention,
//! retirement, atomicity) is fully observable.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

use supernetes_controller::environment::Environment;
use supernetes_controller::node::{NodeReconciler, NodeReconcilerConfig};
use supernetes_controller::reconciler::Reconcile;
use supernetes_controller::tracker::Tracker;
use supernetes_proto::node_api_client::NodeApiClient;
use supernetes_proto::node_api_server::{NodeApi, NodeApiServer};
use supernetes_proto::workload_api_client::WorkloadApiClient;
use supernetes_proto::{Node, NodeMeta, NodeSpec};

/// Mock NodeApi whose sweep contents are scripted per call
#[derive(Default)]
struct ScriptedNodes {
    sweeps: Mutex<Vec<Sweep>>,
}

enum Sweep {
    Nodes(Vec<String>),
    /// Yield some nodes, then fail the stream
    Partial(Vec<String>),
}

#[tonic::async_trait]
impl NodeApi for ScriptedNodes {
    type GetNodesStream = Pin<Box<dyn Stream<Item = Result<Node, Status>> + Send>>;

    async fn get_nodes(
        &self,
        _request: Request<()>,
    ) -> Result<Response<Self::GetNodesStream>, Status> {
        let sweep = {
            let mut sweeps = self.sweeps.lock();
            if sweeps.is_empty() {
                Sweep::Nodes(Vec::new())
            } else {
                sweeps.remove(0)
            }
        };

        let node = |name: &String| {
            Ok(Node {
                meta: Some(NodeMeta { name: name.clone() }),
                spec: Some(NodeSpec {
                    cpu_count: 4,
                    mem_bytes: 16 * 1024 * 1024 * 1024,
                }),
                status: None,
            })
        };

        let items: Vec<Result<Node, Status>> = match sweep {
            Sweep::Nodes(names) => names.iter().map(node).collect(),
            Sweep::Partial(names) => {
                let mut items: Vec<_> = names.iter().map(node).collect();
                items.push(Err(Status::unavailable("stream interrupted")));
                items
            }
        };

        Ok(Response::new(Box::pin(tokio_stream::iter(items))))
    }
}

async fn scripted_reconciler(sweeps: Vec<Sweep>) -> (Arc<NodeReconciler>, CancellationToken) {
    let script = ScriptedNodes {
        sweeps: Mutex::new(sweeps),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(NodeApiServer::new(script))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let channel = tonic::transport::Endpoint::try_from(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();

    // A cluster is not reachable in these tests; instance internals fail
    // and retry against this address without affecting sweep bookkeeping
    let kube_config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
    let kube_client = kube::Client::try_from(kube_config).unwrap();

    let reconciler = NodeReconciler::new(NodeReconcilerConfig {
        node_client: NodeApiClient::new(channel.clone()),
        workload_client: WorkloadApiClient::new(channel),
        tracker: Tracker::new(),
        kube_client,
        environment: Environment::default(),
        disable_kubelet_auth: false,
    })
    .await
    .unwrap();

    (reconciler, CancellationToken::new())
}

#[tokio::test]
async fn test_node_lifecycle_across_sweeps() {
    // Agent streams [n1] twice, then []: the instance appears on the first
    // sweep, survives the second and is retired by the third
    let (reconciler, token) = scripted_reconciler(vec![
        Sweep::Nodes(vec!["n1".into()]),
        Sweep::Nodes(vec!["n1".into()]),
        Sweep::Nodes(vec![]),
    ])
    .await;

    reconciler.reconcile(&token).await.unwrap();
    assert_eq!(reconciler.tracked_nodes().await, vec!["n1"]);

    reconciler.reconcile(&token).await.unwrap();
    assert_eq!(reconciler.tracked_nodes().await, vec!["n1"]);

    reconciler.reconcile(&token).await.unwrap();
    assert!(reconciler.tracked_nodes().await.is_empty());

    token.cancel();
}

#[tokio::test]
async fn test_sweep_tracks_multiple_and_retires_selectively() {
    let (reconciler, token) = scripted_reconciler(vec![
        Sweep::Nodes(vec!["n1".into(), "n2".into(), "n3".into()]),
        Sweep::Nodes(vec!["n2".into()]),
    ])
    .await;

    reconciler.reconcile(&token).await.unwrap();
    assert_eq!(reconciler.tracked_nodes().await, vec!["n1", "n2", "n3"]);

    reconciler.reconcile(&token).await.unwrap();
    assert_eq!(reconciler.tracked_nodes().await, vec!["n2"]);

    token.cancel();
}

#[tokio::test]
async fn test_duplicate_node_names_create_one_instance() {
    let (reconciler, token) = scripted_reconciler(vec![Sweep::Nodes(vec![
        "n1".into(),
        "n1".into(),
        "n1".into(),
    ])])
    .await;

    reconciler.reconcile(&token).await.unwrap();
    assert_eq!(reconciler.tracked_nodes().await, vec!["n1"]);

    token.cancel();
}

#[tokio::test]
async fn test_partial_sweep_commits_nothing() {
    let (reconciler, token) = scripted_reconciler(vec![
        Sweep::Nodes(vec!["n1".into(), "n2".into()]),
        Sweep::Partial(vec!["n3".into()]),
        Sweep::Nodes(vec!["n1".into()]),
    ])
    .await;

    reconciler.reconcile(&token).await.unwrap();
    assert_eq!(reconciler.tracked_nodes().await, vec!["n1", "n2"]);

    // The interrupted sweep fails without side effects: n3 is not created,
    // n1 and n2 are not retired
    assert!(reconciler.reconcile(&token).await.is_err());
    assert_eq!(reconciler.tracked_nodes().await, vec!["n1", "n2"]);

    // The next complete sweep self-heals
    reconciler.reconcile(&token).await.unwrap();
    assert_eq!(reconciler.tracked_nodes().await, vec!["n1"]);

    token.cancel();
}
