//! Webhook authentication for the kubelet HTTP façade
//!
//! Authentication delegates to the cluster: bearer tokens go through the
//! TokenReview API, authorization through a SubjectAccessReview against the
//! node's `nodes/proxy` subresource. TLS client-certificate verification
//! uses the API server CA published in the `kube-root-ca.crt` ConfigMap.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, UserInfo};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::Client;
use rustls::RootCertStore;
use tracing::{debug, trace};

use supernetes_common::labels::NAMESPACE_WORKLOAD;
use supernetes_common::{Error, Result};

/// How long to wait for the API server CA ConfigMap at startup
const CA_TIMEOUT: Duration = Duration::from_secs(60);

/// Webhook authenticator/authorizer shared by all kubelet façades
pub struct Auth {
    client: Client,
    client_ca_roots: Arc<RootCertStore>,
}

impl Auth {
    /// Start the authenticator: waits for the API server CA to become
    /// available (bounded by a one-minute timeout).
    pub async fn start(client: Client) -> Result<Arc<Auth>> {
        trace!("waiting for API server CA");
        let ca_bundle = tokio::time::timeout(CA_TIMEOUT, wait_for_ca(&client))
            .await
            .map_err(|_| Error::internal("auth", "timeout waiting for API server CA"))??;
        trace!("received API server CA");

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca_bundle.as_bytes()) {
            let cert =
                cert.map_err(|e| Error::tls(format!("couldn't parse API server CA: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::tls(format!("couldn't parse API server CA: {e}")))?;
        }

        if roots.is_empty() {
            return Err(Error::tls("API server CA bundle contains no certificates"));
        }

        Ok(Arc::new(Auth {
            client,
            client_ca_roots: Arc::new(roots),
        }))
    }

    /// CA pool for verifying kubelet clients (e.g. the API server itself)
    pub fn client_ca_roots(&self) -> Arc<RootCertStore> {
        self.client_ca_roots.clone()
    }

    /// Authenticate a bearer token through the TokenReview API
    pub async fn authenticate(&self, token: &str) -> Result<Option<UserInfo>> {
        let api: Api<TokenReview> = Api::all(self.client.clone());

        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = api.create(&PostParams::default(), &review).await?;
        let status = response.status.unwrap_or_default();

        if !status.authenticated.unwrap_or(false) {
            debug!(error = ?status.error, "token authentication failed");
            return Ok(None);
        }

        Ok(status.user)
    }

    /// Authorize the given user for `get` on the node's proxy subresource
    pub async fn authorize(&self, user: &UserInfo, node_name: &str) -> Result<bool> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());

        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: user.username.clone(),
                groups: user.groups.clone(),
                resource_attributes: Some(ResourceAttributes {
                    verb: Some("get".to_string()),
                    resource: Some("nodes".to_string()),
                    subresource: Some("proxy".to_string()),
                    name: Some(node_name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = api.create(&PostParams::default(), &review).await?;
        Ok(response
            .status
            .map(|status| status.allowed)
            .unwrap_or(false))
    }
}

async fn wait_for_ca(client: &Client) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), NAMESPACE_WORKLOAD);

    loop {
        if let Ok(config_map) = api.get("kube-root-ca.crt").await {
            if let Some(ca) = config_map
                .data
                .as_ref()
                .and_then(|data| data.get("ca.crt"))
            {
                return Ok(ca.clone());
            }
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
