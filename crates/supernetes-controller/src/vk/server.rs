//! Kubelet HTTP façade
//!
//! Serves the kubelet API surface for one virtual node: log streaming, pod
//! listing, stats summary and resource metrics. Exec, attach and
//! port-forward are not supported and say so. The server listens on a
//! kernel-assigned port over TLS with a rotating serving certificate; the
//! chosen port is patched into the Node's daemon endpoints by the instance.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use chrono::{DateTime, Utc};
use kube::Client;
use rustls::server::WebPkiClientVerifier;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use supernetes_common::{Error, Result};

use crate::certificates::ServingCertManager;
use crate::provider::{ContainerLogOpts, PodProvider};
use crate::vk::Auth;

/// Kubelet HTTP façade for one virtual node
pub struct KubeletServer {
    kube_client: Client,
    provider: Arc<PodProvider>,
    auth: Arc<Auth>,
    disable_auth: bool,
    node_name: String,
    dns_names: Vec<String>,
    ip_addresses: Vec<std::net::IpAddr>,
}

#[derive(Clone)]
struct AppState {
    provider: Arc<PodProvider>,
    auth: Arc<Auth>,
    disable_auth: bool,
    node_name: String,
}

impl KubeletServer {
    /// Create a kubelet server for the given node
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kube_client: Client,
        provider: Arc<PodProvider>,
        auth: Arc<Auth>,
        disable_auth: bool,
        node_name: String,
        dns_names: Vec<String>,
        ip_addresses: Vec<std::net::IpAddr>,
    ) -> Self {
        Self {
            kube_client,
            provider,
            auth,
            disable_auth,
            node_name,
            dns_names,
            ip_addresses,
        }
    }

    /// Run the server until cancelled. `ready` fires with the bound port
    /// once the serving certificate is in place and the listener is up.
    pub async fn run(&self, token: CancellationToken, ready: oneshot::Sender<u16>) -> Result<()> {
        // Let the OS pick a free port
        let listener = std::net::TcpListener::bind("0.0.0.0:0")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        // Serving certificate tailored to this virtual node
        let cert_manager = ServingCertManager::new(
            self.kube_client.clone(),
            self.node_name.clone(),
            self.dns_names.clone(),
            self.ip_addresses.clone(),
        );
        cert_manager.obtain().await?;

        let tls = self.tls_config(&cert_manager)?;

        if self.disable_auth {
            // The OpenShift/OKD dashboard and `oc` CLI do not pass any
            // credentials when accessing the kubelet API, so allow anonymous
            // access to all resources in this mode
            debug!(node = %self.node_name, "kubelet HTTP server authentication disabled");
        }

        let state = AppState {
            provider: self.provider.clone(),
            auth: self.auth.clone(),
            disable_auth: self.disable_auth,
            node_name: self.node_name.clone(),
        };

        let app = Router::new()
            .route(
                "/containerLogs/{namespace}/{pod}/{container}",
                get(container_logs),
            )
            .route("/pods", get(pods))
            .route("/stats/summary", get(stats_summary))
            .route("/metrics/resource", get(metrics_resource))
            .route("/exec/{namespace}/{pod}/{container}", any(unsupported))
            .route("/attach/{namespace}/{pod}/{container}", any(unsupported))
            .route("/portForward/{namespace}/{pod}", any(unsupported))
            .route("/run/{namespace}/{pod}/{container}", any(unsupported))
            .with_state(state);

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            shutdown_handle.shutdown();
        });

        // Rotate the serving certificate alongside the server
        let rotation_token = CancellationToken::new();
        let _rotation_guard = rotation_token.clone().drop_guard();
        let rotation_server = cert_manager;
        tokio::spawn(async move { rotation_server.run(rotation_token).await });

        let _ = ready.send(port);

        axum_server::from_tcp_rustls(
            listener,
            axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls)),
        )
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::internal("kubelet-server", format!("server error: {e}")))?;

        Ok(())
    }

    /// TLS for the façade: client certificates are requested but optional
    /// (bearer tokens are the common path), certificates come from the
    /// rotating resolver.
    fn tls_config(&self, cert_manager: &ServingCertManager) -> Result<ServerConfig> {
        let verifier = WebPkiClientVerifier::builder(self.auth.client_ca_roots())
            .allow_unauthenticated()
            .build()
            .map_err(|e| Error::tls(format!("failed to build client verifier: {e}")))?;

        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(cert_manager.resolver());
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(config)
    }
}

/// Query parameters of the kubelet log endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LogQuery {
    follow: bool,
    tail_lines: Option<i64>,
    limit_bytes: Option<i64>,
    since_seconds: Option<i64>,
    since_time: Option<DateTime<Utc>>,
    timestamps: bool,
    previous: bool,
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    if state.disable_auth {
        return Ok(());
    }

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| StatusCode::UNAUTHORIZED.into_response())?;

    let user = match state.auth.authenticate(token).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err(StatusCode::UNAUTHORIZED.into_response()),
        Err(e) => {
            warn!(error = %e, "kubelet authentication failed");
            return Err(StatusCode::UNAUTHORIZED.into_response());
        }
    };

    match state.auth.authorize(&user, &state.node_name).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(StatusCode::FORBIDDEN.into_response()),
        Err(e) => {
            warn!(error = %e, "kubelet authorization failed");
            Err(StatusCode::FORBIDDEN.into_response())
        }
    }
}

async fn container_logs(
    State(state): State<AppState>,
    Path((namespace, pod, _container)): Path<(String, String, String)>,
    Query(query): Query<LogQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }

    let opts = ContainerLogOpts {
        follow: query.follow,
        tail: query.tail_lines.unwrap_or_default(),
        limit_bytes: query.limit_bytes.unwrap_or_default(),
        since_seconds: query.since_seconds.unwrap_or_default(),
        since_time: query.since_time,
        timestamps: query.timestamps,
        previous: query.previous,
    };

    match state.provider.container_logs(&namespace, &pod, opts).await {
        Ok(reader) => Body::from_stream(ReaderStream::new(reader)).into_response(),
        Err(e @ Error::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e) => {
            warn!(namespace, pod, error = %e, "log streaming failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn pods(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }

    let pods = state.provider.get_pods().await;
    let list = serde_json::json!({
        "apiVersion": "v1",
        "kind": "PodList",
        "items": pods,
    });

    axum::Json(list).into_response()
}

/// Minimal node stats for the summary endpoint
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsSummary {
    node: NodeStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeStats {
    node_name: String,
    start_time: DateTime<Utc>,
    cpu: CpuStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CpuStats {
    time: DateTime<Utc>,
    usage_nano_cores: u64,
    usage_core_nano_seconds: u64,
}

async fn stats_summary(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }

    let summary = StatsSummary {
        node: NodeStats {
            node_name: state.node_name.clone(),
            start_time: Utc::now() - chrono::Duration::hours(1),
            cpu: CpuStats {
                time: Utc::now(),
                usage_nano_cores: 1000,
                usage_core_nano_seconds: 1000000,
            },
        },
    };

    axum::Json(summary).into_response()
}

async fn metrics_resource(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.provider.metrics().render(),
    )
        .into_response()
}

async fn unsupported() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        "exec, attach and port-forward are not supported for Supernetes workloads",
    )
        .into_response()
}
