//! Agent runtime: the reverse tunnel to the controller
//!
//! The agent dials the controller over mTLS and then *serves* its RPC
//! services over the established connection. The TLS handshake runs in the
//! conventional direction (the controller authenticates the agent's client
//! certificate), but the HTTP/2 roles invert: this side becomes the gRPC
//! server. This keeps HPC environments reachable without inbound ports.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tracing::{info, warn};

use supernetes_common::config::AgentConfig;
use supernetes_common::{labels, net, Error, Result};
use supernetes_proto::node_api_server::NodeApiServer;
use supernetes_proto::workload_api_server::WorkloadApiServer;

use crate::runtime::Runtime;
use crate::server::{NodeService, WorkloadService};
use crate::slurm::SchedulerClient;

/// Default endpoint port when the configuration omits one
const DEFAULT_PORT: u16 = 40404;

/// Delay between reconnection attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Run the agent until the token is cancelled.
///
/// Opens the reverse tunnel to the configured controller endpoint and serves
/// the `NodeApi` and `WorkloadApi` services over it, reconnecting with a
/// fixed backoff whenever the tunnel drops.
pub async fn run(config: AgentConfig, token: CancellationToken) -> Result<()> {
    // Sanity check: this is required for Supernetes to track its own jobs
    if !config
        .slurm_config
        .filter
        .partition(&config.slurm_config.partition)
    {
        return Err(Error::config(
            "partition filter must match the default submit partition",
        ));
    }

    info!("starting Supernetes agent");

    let authority = net::authority(&config.endpoint, DEFAULT_PORT)?;
    let server_name = tls_server_name(&config.endpoint)?;
    let connector = TlsConnector::from(Arc::new(client_tls_config(&config)?));

    let scheduler = SchedulerClient::new();
    let runtime = Arc::new(Runtime::new(config.slurm_config.clone(), scheduler.clone())?);

    info!(endpoint = %authority, "connecting to endpoint");

    loop {
        let result = serve_tunnel(
            &authority,
            server_name.clone(),
            &connector,
            &config,
            runtime.clone(),
            scheduler.clone(),
            token.clone(),
        )
        .await;

        if token.is_cancelled() {
            info!("agent finished");
            return Ok(());
        }

        match result {
            Ok(()) => info!("tunnel closed, reconnecting"),
            Err(e) => warn!(error = %e, "tunnel failed, reconnecting"),
        }

        tokio::select! {
            _ = token.cancelled() => {
                info!("agent finished");
                return Ok(());
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn serve_tunnel(
    authority: &str,
    server_name: ServerName<'static>,
    connector: &TlsConnector,
    config: &AgentConfig,
    runtime: Arc<Runtime>,
    scheduler: SchedulerClient,
    token: CancellationToken,
) -> Result<()> {
    let tcp = TcpStream::connect(authority).await?;
    tcp.set_nodelay(true)?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::tls(format!("handshake failed: {e}")))?;

    info!("listening for requests from controller");

    let filter = config.slurm_config.filter.clone();
    let incoming = tokio_stream::once(Ok::<_, std::io::Error>(TunnelStream(tls)));

    Server::builder()
        .add_service(NodeApiServer::new(NodeService::new(
            filter.clone(),
            scheduler.clone(),
        )))
        .add_service(WorkloadApiServer::new(WorkloadService::new(
            runtime, filter, scheduler,
        )))
        .serve_with_incoming_shutdown(incoming, token.cancelled())
        .await?;

    Ok(())
}

/// The TLS server name used for certificate verification. DNS endpoints are
/// verified against their own hostname; IP endpoints fall back to the fixed
/// SAN every endpoint certificate carries.
fn tls_server_name(endpoint: &str) -> Result<ServerName<'static>> {
    let hostname = net::hostname(endpoint)?;
    if hostname.parse::<std::net::IpAddr>().is_ok() {
        return ServerName::try_from(labels::CERT_SAN)
            .map_err(|e| Error::tls(format!("invalid server name: {e}")));
    }

    ServerName::try_from(hostname).map_err(|e| Error::tls(format!("invalid server name: {e}")))
}

/// Build the rustls client configuration from the agent's mTLS material:
/// TLS 1.3 only, the shared CA as the only trust root, and the agent's
/// certificate presented as the mandatory client certificate.
fn client_tls_config(config: &AgentConfig) -> Result<ClientConfig> {
    let mtls = &config.mtls_config;

    let mut roots = RootCertStore::empty();
    for cert in parse_certs(mtls.ca.as_bytes())? {
        roots
            .add(cert)
            .map_err(|e| Error::tls(format!("failed to parse CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::tls("CA bundle contains no certificates"));
    }

    let certs = parse_certs(mtls.cert.as_bytes())?;
    let key = parse_key(mtls.key.as_bytes())?;

    let mut tls = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::tls(format!("failed to load client key pair: {e}")))?;
    tls.alpn_protocols = vec![b"h2".to_vec()];

    Ok(tls)
}

pub(crate) fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &*pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("failed to parse certificate: {e}")))
}

pub(crate) fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &*pem)
        .map_err(|e| Error::tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| Error::tls("no private key found"))
}

/// Established tunnel connection served by the tonic server
struct TunnelStream(TlsStream<TcpStream>);

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_server_name_prefers_hostname() {
        let name = tls_server_name("controller.example.com:40404").unwrap();
        assert!(matches!(name, ServerName::DnsName(_)));
    }

    #[test]
    fn test_tls_server_name_falls_back_to_fixed_san_for_ips() {
        let name = tls_server_name("10.0.0.1:40404").unwrap();
        let ServerName::DnsName(dns) = &name else {
            panic!("expected DNS name");
        };
        assert_eq!(dns.as_ref(), labels::CERT_SAN);
    }
}
