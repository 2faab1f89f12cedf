//! Kubelet serving certificate manager
//!
//! Obtains a short-lived serving certificate for a virtual node through the
//! cluster's certificate signing workflow (`kubernetes.io/kubelet-serving`
//! signer) and rotates it automatically. The private key never leaves the
//! process; the kubelet façade picks certificates up through a dynamic
//! resolver.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Client;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, SanType};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::PrivateKeyDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use supernetes_common::{Error, Result};

/// How long to wait for the serving certificate to be issued
const ISSUE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Fraction of the certificate lifetime after which to rotate
const ROTATION_FRACTION: f64 = 0.7;

/// Serves the most recently issued certificate to the TLS stack
#[derive(Default)]
pub struct RotatingCertResolver {
    current: parking_lot::RwLock<Option<Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for RotatingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingCertResolver")
            .field("present", &self.current.read().is_some())
            .finish()
    }
}

impl ResolvesServerCert for RotatingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.read().clone()
    }
}

/// Manages the serving certificate of one virtual node
pub struct ServingCertManager {
    client: Client,
    node_name: String,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
    resolver: Arc<RotatingCertResolver>,
}

impl ServingCertManager {
    /// Create a manager for the given node and its addresses
    pub fn new(
        client: Client,
        node_name: String,
        dns_names: Vec<String>,
        ip_addresses: Vec<IpAddr>,
    ) -> Self {
        Self {
            client,
            node_name,
            dns_names,
            ip_addresses,
            resolver: Arc::new(RotatingCertResolver::default()),
        }
    }

    /// The resolver handing out the current certificate
    pub fn resolver(&self) -> Arc<RotatingCertResolver> {
        self.resolver.clone()
    }

    /// Obtain the initial certificate, bounded by the issuance timeout
    pub async fn obtain(&self) -> Result<()> {
        trace!(node = %self.node_name, "waiting for kubelet serving certificate");
        tokio::time::timeout(ISSUE_TIMEOUT, self.issue())
            .await
            .map_err(|_| {
                Error::internal(
                    "certificates",
                    "timeout waiting for kubelet serving certificate",
                )
            })??;
        trace!(node = %self.node_name, "received kubelet serving certificate");

        Ok(())
    }

    /// Rotate the certificate until cancelled
    pub async fn run(&self, token: CancellationToken) {
        loop {
            let renew_after = self
                .resolver
                .current
                .read()
                .as_ref()
                .and_then(|key| rotation_delay(key))
                .unwrap_or(Duration::from_secs(60));

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(renew_after) => {}
            }

            if let Err(e) = self.obtain().await {
                warn!(node = %self.node_name, error = %e, "serving certificate rotation failed");
            }
        }
    }

    /// Issue one certificate: submit a CSR and poll for the signed result
    async fn issue(&self) -> Result<()> {
        let (key_pair, csr_pem) = self.generate_csr()?;

        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let csr_name = format!("supernetes-{}", self.node_name);

        // CSR objects are immutable, drop any previous request first.
        // Approved CSRs are garbage-collected by the cluster eventually,
        // but rotation comes around faster than that.
        match api.delete(&csr_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(csr_name.clone()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(csr_pem.into_bytes()),
                signer_name: "kubernetes.io/kubelet-serving".to_string(),
                usages: Some(vec![
                    "digital signature".to_string(),
                    "key encipherment".to_string(),
                    "server auth".to_string(),
                ]),
                ..Default::default()
            },
            ..Default::default()
        };

        api.create(&PostParams::default(), &csr).await?;
        debug!(csr = %csr_name, "submitted kubelet serving CSR");

        // Poll for issuance; approval is the CSR approver's job
        let certificate = loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            let current = api.get(&csr_name).await?;
            if let Some(certificate) = current
                .status
                .as_ref()
                .and_then(|status| status.certificate.as_ref())
            {
                break certificate.0.clone();
            }
        };

        self.install(&key_pair, &certificate)?;
        Ok(())
    }

    fn generate_csr(&self) -> Result<(KeyPair, String)> {
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String(format!("system:node:{}", self.node_name)),
        );
        distinguished_name.push(
            DnType::OrganizationName,
            DnValue::Utf8String("system:nodes".to_string()),
        );

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name;
        for name in &self.dns_names {
            params.subject_alt_names.push(
                SanType::DnsName(
                    name.clone()
                        .try_into()
                        .map_err(|e| Error::tls(format!("invalid SAN {name:?}: {e}")))?,
                ),
            );
        }
        for ip in &self.ip_addresses {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }

        let key_pair =
            KeyPair::generate().map_err(|e| Error::tls(format!("key generation failed: {e}")))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::tls(format!("CSR generation failed: {e}")))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| Error::tls(format!("CSR serialization failed: {e}")))?;

        Ok((key_pair, csr_pem))
    }

    fn install(&self, key_pair: &KeyPair, certificate_pem: &[u8]) -> Result<()> {
        let certs = rustls_pemfile::certs(&mut &*certificate_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::tls(format!("failed to parse issued certificate: {e}")))?;
        if certs.is_empty() {
            return Err(Error::tls("issued certificate is empty"));
        }

        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| Error::tls(format!("failed to serialize private key: {e}")))?;
        let signing_key = any_supported_type(&key_der)
            .map_err(|e| Error::tls(format!("unsupported private key: {e}")))?;

        let certified = Arc::new(CertifiedKey::new(certs, signing_key));
        *self.resolver.current.write() = Some(certified);

        Ok(())
    }
}

/// Time until the certificate should rotate, based on its validity window
fn rotation_delay(key: &CertifiedKey) -> Option<Duration> {
    let cert = key.cert.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;

    let validity = parsed.validity();
    let not_before = validity.not_before.timestamp();
    let not_after = validity.not_after.timestamp();
    let lifetime = (not_after - not_before).max(0) as f64;

    let renew_at = not_before as f64 + lifetime * ROTATION_FRACTION;
    let now = chrono::Utc::now().timestamp() as f64;

    Some(Duration::from_secs_f64((renew_at - now).max(0.0)))
}
