//! Reverse-tunnel endpoint integration tests
//!
//! Spins up a real endpoint on localhost and connects to it the way an
//! agent does: TLS client handshake, then serving the RPC services over the
//! established connection.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use supernetes_common::config::{ControllerConfig, MtlsConfig, ReconcileConfig};
use supernetes_controller::endpoint::{Callbacks, Endpoint};
use supernetes_proto::node_api_server::{NodeApi, NodeApiServer};
use supernetes_proto::{Node, NodeMeta, NodeSpec};

struct TestPki {
    ca_pem: String,
    server_cert_pem: String,
    server_key_pem: String,
    client_cert_pem: String,
    client_key_pem: String,
}

/// Generate a throwaway CA plus server and client certificates. The server
/// certificate carries the fixed SAN both sides agree on.
fn test_pki() -> TestPki {
    let mut ca_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String("Supernetes Test CA".to_string()),
    );
    ca_params.distinguished_name = dn;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];

    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let ca_pem = ca_cert.pem();
    let issuer = Issuer::from_params(&ca_params, ca_key);

    let mut server_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String("supernetes.internal".to_string()),
    );
    server_params.distinguished_name = dn;
    server_params.subject_alt_names = vec![SanType::DnsName(
        "supernetes.internal".to_string().try_into().unwrap(),
    )];
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let server_key = KeyPair::generate().unwrap();
    let server_cert = server_params.signed_by(&server_key, &issuer).unwrap();

    let mut client_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String("supernetes-agent".to_string()),
    );
    client_params.distinguished_name = dn;
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let client_key = KeyPair::generate().unwrap();
    let client_cert = client_params.signed_by(&client_key, &issuer).unwrap();

    TestPki {
        ca_pem,
        server_cert_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
        client_cert_pem: client_cert.pem(),
        client_key_pem: client_key.serialize_pem(),
    }
}

fn controller_config(pki: &TestPki) -> ControllerConfig {
    ControllerConfig {
        port: 0, // Kernel-assigned
        mtls_config: MtlsConfig {
            ca: pki.ca_pem.clone(),
            key: pki.server_key_pem.clone(),
            cert: pki.server_cert_pem.clone(),
        },
        reconcile: ReconcileConfig::default(),
    }
}

/// Stub NodeApi streaming a fixed node set
struct StubNodes {
    nodes: Vec<Node>,
}

#[tonic::async_trait]
impl NodeApi for StubNodes {
    type GetNodesStream = Pin<Box<dyn Stream<Item = Result<Node, Status>> + Send>>;

    async fn get_nodes(
        &self,
        _request: Request<()>,
    ) -> Result<Response<Self::GetNodesStream>, Status> {
        let nodes: Vec<Result<Node, Status>> = self.nodes.iter().cloned().map(Ok).collect();
        Ok(Response::new(Box::pin(tokio_stream::iter(nodes))))
    }
}

/// Agent-side tunnel connection wrapper
struct TunnelStream(tokio_rustls::client::TlsStream<TcpStream>);

impl Connected for TunnelStream {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Dial the endpoint and serve the stub services over the tunnel until the
/// token is cancelled or the tunnel dies. Returns the serving task.
async fn open_tunnel(
    addr: std::net::SocketAddr,
    pki: &TestPki,
    nodes: Vec<Node>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pki.ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }

    let certs = rustls_pemfile::certs(&mut pki.client_cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut pki.client_key_pem.as_bytes())
        .unwrap()
        .unwrap();

    let mut tls = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .unwrap();
    tls.alpn_protocols = vec![b"h2".to_vec()];

    let tcp = TcpStream::connect(addr).await.unwrap();
    let stream = TlsConnector::from(Arc::new(tls))
        .connect(ServerName::try_from("supernetes.internal").unwrap(), tcp)
        .await
        .unwrap();

    let incoming = tokio_stream::once(Ok::<_, std::io::Error>(TunnelStream(stream)));
    tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(NodeApiServer::new(StubNodes { nodes }))
            .serve_with_incoming_shutdown(incoming, token.cancelled())
            .await;
    })
}

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected counter to reach {expected}, stuck at {}",
            counter.load(Ordering::SeqCst)
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

#[tokio::test]
async fn test_rpc_through_reverse_tunnel() {
    install_crypto_provider();
    let pki = test_pki();
    let endpoint = Endpoint::serve(&controller_config(&pki)).await.unwrap();

    let token = CancellationToken::new();
    let node = Node {
        meta: Some(NodeMeta { name: "n1".into() }),
        spec: Some(NodeSpec {
            cpu_count: 4,
            mem_bytes: 16 * 1024 * 1024 * 1024,
        }),
        status: None,
    };
    let _tunnel = open_tunnel(endpoint.local_addr(), &pki, vec![node], token.clone()).await;

    // The controller issues an RPC over the tunnel as a plain client
    let mut stream = endpoint
        .node()
        .get_nodes(())
        .await
        .unwrap()
        .into_inner();

    let received = stream.message().await.unwrap().unwrap();
    assert_eq!(received.meta.unwrap().name, "n1");
    assert_eq!(received.spec.unwrap().cpu_count, 4);
    assert!(stream.message().await.unwrap().is_none());

    token.cancel();
    endpoint.close().await;
}

#[tokio::test]
async fn test_idle_connect_cycle_fires_callbacks_once_per_edge() {
    install_crypto_provider();
    let pki = test_pki();
    let endpoint = Endpoint::serve(&controller_config(&pki)).await.unwrap();

    let connected = Arc::new(AtomicUsize::new(0));
    let idle = Arc::new(AtomicUsize::new(0));
    let connected_cb = connected.clone();
    let idle_cb = idle.clone();
    endpoint.set_callbacks(Callbacks {
        on_connected: Arc::new(move || {
            connected_cb.fetch_add(1, Ordering::SeqCst);
        }),
        on_idle: Arc::new(move || {
            idle_cb.fetch_add(1, Ordering::SeqCst);
        }),
    });

    // Agent connects
    let first = CancellationToken::new();
    let _first_tunnel = open_tunnel(endpoint.local_addr(), &pki, vec![], first.clone()).await;
    wait_for(&connected, 1).await;
    assert_eq!(idle.load(Ordering::SeqCst), 0);

    // Exercise the channel so the tunnel is actually in use
    let mut stream = endpoint.node().get_nodes(()).await.unwrap().into_inner();
    assert!(stream.message().await.unwrap().is_none());

    // Agent disconnects, the endpoint becomes idle exactly once
    first.cancel();
    wait_for(&idle, 1).await;
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    // Reconnecting fires the connected callback again
    let second = CancellationToken::new();
    let _second_tunnel = open_tunnel(endpoint.local_addr(), &pki, vec![], second.clone()).await;
    wait_for(&connected, 2).await;
    assert_eq!(idle.load(Ordering::SeqCst), 1);

    // The channel binds to the fresh tunnel like the reconcilers would
    let mut stream = endpoint.node().get_nodes(()).await.unwrap().into_inner();
    assert!(stream.message().await.unwrap().is_none());

    second.cancel();
    wait_for(&idle, 2).await;
    endpoint.close().await;
}

#[tokio::test]
async fn test_close_severs_bound_tunnels() {
    install_crypto_provider();
    let pki = test_pki();
    let endpoint = Endpoint::serve(&controller_config(&pki)).await.unwrap();

    // The agent never shuts down on its own in this test
    let agent_token = CancellationToken::new();
    let tunnel = open_tunnel(endpoint.local_addr(), &pki, vec![], agent_token.clone()).await;

    // Bind the tunnel into the channel with a live RPC
    let mut stream = endpoint.node().get_nodes(()).await.unwrap().into_inner();
    assert!(stream.message().await.unwrap().is_none());

    // Closing must terminate the bound tunnel as well: the agent-side
    // server observes its connection dying and finishes
    endpoint.close().await;
    tokio::time::timeout(Duration::from_secs(5), tunnel)
        .await
        .expect("agent tunnel should be severed by close")
        .unwrap();

    // And the severed channel no longer serves RPCs
    let result = tokio::time::timeout(Duration::from_secs(2), endpoint.node().get_nodes(())).await;
    assert!(!matches!(result, Ok(Ok(_))));
}

#[tokio::test]
async fn test_unauthenticated_client_is_rejected() {
    install_crypto_provider();
    let pki = test_pki();
    let endpoint = Endpoint::serve(&controller_config(&pki)).await.unwrap();

    let connected = Arc::new(AtomicUsize::new(0));
    let connected_cb = connected.clone();
    endpoint.set_callbacks(Callbacks {
        on_connected: Arc::new(move || {
            connected_cb.fetch_add(1, Ordering::SeqCst);
        }),
        on_idle: Arc::new(|| {}),
    });

    // A client without a certificate must not complete the handshake
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pki.ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let tls = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_no_client_auth();

    let tcp = TcpStream::connect(endpoint.local_addr()).await.unwrap();
    let result = TlsConnector::from(Arc::new(tls))
        .connect(ServerName::try_from("supernetes.internal").unwrap(), tcp)
        .await;

    // The handshake either fails outright or the connection dies right
    // after; either way no tunnel is registered
    if let Ok(mut stream) = result {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1];
        let _ = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    endpoint.close().await;
}
