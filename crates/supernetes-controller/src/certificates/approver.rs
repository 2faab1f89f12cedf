//! CSR auto-approver
//!
//! Kubelet-serving certificate approvers in the wild refuse
//! `system:node:...` CSRs requested by a service account, so the controller
//! approves its own: a CSR is approved iff its signer is the
//! kubelet-serving signer and its requester is the controller's service
//! account. Everything else is left alone.
//!
//! CSRs in any state are garbage-collected by the cluster, manual cleanup
//! is not necessary.

use futures::TryStreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use supernetes_common::{Error, Result};

use crate::environment::Environment;

const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";

/// Watches and auto-approves the controller's own kubelet-serving CSRs
pub struct CsrApprover {
    client: Client,
    service_account: String,
}

impl CsrApprover {
    /// Create an approver scoped to the controller's service account. Fails
    /// when the environment doesn't identify the service account.
    pub fn new(client: Client, environment: &Environment) -> Result<Self> {
        let namespace = environment
            .controller_namespace()
            .ok_or_else(|| Error::config("namespace unknown"))?;
        let name = environment
            .controller_service_account()
            .ok_or_else(|| Error::config("service account name unknown"))?;

        Ok(Self {
            client,
            service_account: format!("system:serviceaccount:{namespace}:{name}"),
        })
    }

    /// Run the approval loop until cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let mut events = std::pin::pin!(watcher::watcher(api.clone(), watcher::Config::default()));

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = events.try_next() => event,
            };

            match event {
                Ok(Some(Event::Apply(csr))) | Ok(Some(Event::InitApply(csr))) => {
                    if let Err(e) = self.process(&api, csr).await {
                        warn!(error = %e, "CSR approval failed");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(e) => debug!(error = %e, "CSR watch error"),
            }
        }
    }

    async fn process(
        &self,
        api: &Api<CertificateSigningRequest>,
        csr: CertificateSigningRequest,
    ) -> Result<()> {
        let name = csr.metadata.name.clone().unwrap_or_default();

        if csr.spec.signer_name != KUBELET_SERVING_SIGNER {
            trace!(csr = %name, "unknown signer, skipping");
            return Ok(());
        }

        if csr.spec.username.as_deref() != Some(self.service_account.as_str()) {
            trace!(csr = %name, "not requested by the controller service account, skipping");
            return Ok(());
        }

        if is_approved(&csr) {
            trace!(csr = %name, "CSR already approved, skipping");
            return Ok(());
        }

        let approval = serde_json::json!({
            "status": {
                "conditions": [{
                    "type": "Approved",
                    "status": "True",
                    "reason": "Approved by Supernetes controller",
                    "message": "Auto-approving Supernetes node kubelet serving certificate",
                    "lastUpdateTime": k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                        chrono::Utc::now()
                    ),
                }],
            }
        });

        api.patch_approval(&name, &PatchParams::default(), &Patch::Merge(&approval))
            .await?;

        debug!(csr = %name, "approved kubelet serving CSR");
        Ok(())
    }
}

fn is_approved(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| conditions.iter().any(|c| c.type_ == "Approved"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestCondition, CertificateSigningRequestStatus,
    };

    #[test]
    fn test_is_approved() {
        let mut csr = CertificateSigningRequest::default();
        assert!(!is_approved(&csr));

        csr.status = Some(CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: "Approved".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_approved(&csr));
    }
}
