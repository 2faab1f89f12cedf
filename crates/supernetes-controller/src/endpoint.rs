//! Reverse-tunnel RPC endpoint
//!
//! The endpoint is the network surface that remote agents connect to. It
//! terminates mTLS in the conventional direction (agents present client
//! certificates signed by the shared CA), but the HTTP/2 roles invert on
//! the established connection: the agent serves `NodeApi` and `WorkloadApi`
//! and the controller issues RPCs over the tunnel through a regular client
//! channel.
//!
//! The channel is lazy: it picks up the most recent live tunnel the first
//! time an RPC needs a connection, and does the same again after the tunnel
//! drops. RPCs issued while no agent is connected wait for the next tunnel
//! (bounded by their own deadlines). Tunnel liveness is observed through
//! the channel, which binds the tunnel as soon as the connection callback
//! has started the reconciliation loops.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tracing::{debug, error, info};

use supernetes_common::config::{ControllerConfig, MtlsConfig};
use supernetes_common::{Error, Result};
use supernetes_proto::node_api_client::NodeApiClient;
use supernetes_proto::workload_api_client::WorkloadApiClient;

/// State transition hooks for the endpoint. Both are edge-triggered and
/// invoked exactly once per edge.
pub struct Callbacks {
    /// Invoked on each new reverse tunnel
    pub on_connected: Arc<dyn Fn() + Send + Sync>,
    /// Invoked when the last tunnel closes and the channel is no longer ready
    pub on_idle: Arc<dyn Fn() + Send + Sync>,
}

/// The network endpoint that remote agents connect to
pub struct Endpoint {
    node: NodeApiClient<Channel>,
    workload: WorkloadApiClient<Channel>,
    shared: Arc<Shared>,
    token: CancellationToken,
    local_addr: std::net::SocketAddr,
    acceptor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    /// Latest pending tunnel, handed to the channel connector on demand
    parked: parking_lot::Mutex<Option<TunnelIo>>,
    notify: Notify,
    /// Live tunnel count, parked and in use
    active: AtomicUsize,
    closing: AtomicBool,
    /// Cancelled to sever every live tunnel, including ones already bound
    /// into the channel
    tunnels: CancellationToken,
    callbacks: parking_lot::RwLock<Option<Callbacks>>,
}

impl Shared {
    fn fire_connected(&self) {
        if let Some(callbacks) = &*self.callbacks.read() {
            (callbacks.on_connected)();
        }
    }

    fn fire_idle(&self) {
        if let Some(callbacks) = &*self.callbacks.read() {
            (callbacks.on_idle)();
        }
    }
}

impl Endpoint {
    /// Create and serve an endpoint according to the given configuration.
    /// Binding errors are fatal and surface here; individual accept errors
    /// are logged and tolerated.
    pub async fn serve(config: &ControllerConfig) -> Result<Endpoint> {
        let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(&config.mtls_config)?));
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "endpoint listening");

        let shared = Arc::new(Shared {
            parked: parking_lot::Mutex::new(None),
            notify: Notify::new(),
            active: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            tunnels: CancellationToken::new(),
            callbacks: parking_lot::RwLock::new(None),
        });

        let token = CancellationToken::new();
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            acceptor,
            shared.clone(),
            token.clone(),
        ));

        // The tunnel connector ignores the URI, it only exists to satisfy
        // the channel's URI plumbing.
        let connector_shared = shared.clone();
        let channel = TonicEndpoint::from_static("http://supernetes.internal")
            .connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
                let shared = connector_shared.clone();
                async move {
                    loop {
                        if shared.closing.load(Ordering::SeqCst) {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::ConnectionAborted,
                                "endpoint closing",
                            ));
                        }

                        // Register for wakeups before checking to avoid
                        // missing a tunnel parked in between
                        let notified = shared.notify.notified();
                        if let Some(io) = shared.parked.lock().take() {
                            debug!("binding channel to reverse tunnel");
                            return Ok(TokioIo::new(io));
                        }

                        notified.await;
                    }
                }
            }));

        Ok(Endpoint {
            node: NodeApiClient::new(channel.clone()),
            workload: WorkloadApiClient::new(channel),
            shared,
            token,
            local_addr,
            acceptor: parking_lot::Mutex::new(Some(accept_handle)),
        })
    }

    /// The address the endpoint listens on
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Register the state transition hooks
    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.shared.callbacks.write() = Some(callbacks);
    }

    /// API client for node RPCs over the tunnel
    pub fn node(&self) -> NodeApiClient<Channel> {
        self.node.clone()
    }

    /// API client for workload RPCs over the tunnel
    pub fn workload(&self) -> WorkloadApiClient<Channel> {
        self.workload.clone()
    }

    /// Disconnect all agents and stop the endpoint
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst); // Reject new tunnels
        self.token.cancel();
        self.shared.parked.lock().take(); // Drop any pending tunnel
        self.shared.tunnels.cancel(); // Sever tunnels bound into the channel
        self.shared.notify.notify_waiters();

        let handle = self.acceptor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Wait for the severed tunnels to drain, bounded
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.shared.active.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        debug!("endpoint closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let (tcp, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accepting connection failed");
                continue;
            }
        };

        if shared.closing.load(Ordering::SeqCst) {
            debug!(peer = %peer, "rejecting connection to closing endpoint");
            continue; // Dropping the socket closes the new channel
        }

        let acceptor = acceptor.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(tcp).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "tls handshake failed");
                    return;
                }
            };

            if shared.closing.load(Ordering::SeqCst) {
                debug!(peer = %peer, "rejecting connection to closing endpoint");
                return;
            }

            debug!(peer = %peer, "reverse tunnel opened");
            shared.active.fetch_add(1, Ordering::SeqCst);
            shared.fire_connected();

            // Park the tunnel for the channel connector, replacing (and
            // thereby closing) any stale pending one
            let io = TunnelIo::new(tls, shared.clone());
            *shared.parked.lock() = Some(io);
            shared.notify.notify_waiters();
        });
    }
}

/// Server-side TLS for the tunnel listener: TLS 1.3 only, client
/// certificates required and verified against the shared CA.
fn server_tls_config(mtls: &MtlsConfig) -> Result<ServerConfig> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(mtls.ca.as_bytes())? {
        roots
            .add(cert)
            .map_err(|e| Error::tls(format!("failed to parse CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::tls("CA bundle contains no certificates"));
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::tls(format!("failed to build client verifier: {e}")))?;

    let certs = parse_certs(mtls.cert.as_bytes())?;
    let key = rustls_pemfile::private_key(&mut mtls.key.as_bytes())
        .map_err(|e| Error::tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| Error::tls("no private key found"))?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(format!("failed to load server key pair: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(config)
}

fn parse_certs(pem: &[u8]) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &*pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("failed to parse certificate: {e}")))
}

/// A live tunnel connection. Severed cooperatively when the endpoint
/// closes; dropping the last one fires the idle callback.
struct TunnelIo {
    io: TlsStream<TcpStream>,
    shared: Arc<Shared>,
    /// Resolves when the endpoint severs all tunnels
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
    /// Latched once `severed` has resolved; the future must not be polled
    /// again after completion
    severed_seen: bool,
}

impl TunnelIo {
    fn new(io: TlsStream<TcpStream>, shared: Arc<Shared>) -> Self {
        let severed = Box::pin(shared.tunnels.clone().cancelled_owned());
        Self {
            io,
            shared,
            severed,
            severed_seen: false,
        }
    }

    fn is_severed(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.severed_seen && self.severed.as_mut().poll(cx).is_ready() {
            self.severed_seen = true;
        }

        self.severed_seen
    }
}

impl Drop for TunnelIo {
    fn drop(&mut self) {
        debug!("reverse tunnel closed");
        if self.shared.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.fire_idle();
        }
    }
}

impl AsyncRead for TunnelIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.is_severed(cx) {
            return Poll::Ready(Ok(())); // EOF, the endpoint is closing
        }

        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.is_severed(cx) {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "endpoint closing",
            )));
        }

        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
