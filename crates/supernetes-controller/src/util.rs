//! Kubernetes object helpers

use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::Serialize;
use tracing::debug;

use supernetes_common::{Error, Result};

/// Serialize an object with its `apiVersion` and `kind` filled in.
///
/// `k8s-openapi` types don't carry their type metadata when serialized, but
/// server-side apply requires it. This is the equivalent of stamping the GVK
/// onto the object before submission.
pub fn with_gvk<T>(object: &T) -> Result<serde_json::Value>
where
    T: k8s_openapi::Resource + Serialize,
{
    let mut value = serde_json::to_value(object)
        .map_err(|e| Error::serialization(format!("unable to serialize {}: {e}", T::KIND)))?;

    value["apiVersion"] = T::API_VERSION.into();
    value["kind"] = T::KIND.into();

    Ok(value)
}

/// Prevent kube-proxy pods from being deployed on virtual nodes
pub async fn disable_kube_proxy(client: &Client) -> Result<()> {
    debug!("patching kube-proxy DaemonSet to exclude type=virtual-kubelet");

    let api: Api<DaemonSet> = Api::namespaced(client.clone(), "kube-system");
    let patch = serde_json::json!({
        "spec": {"template": {"spec": {"affinity": {"nodeAffinity": {
            "requiredDuringSchedulingIgnoredDuringExecution": {"nodeSelectorTerms": [
                {"matchExpressions": [
                    {"key": "type", "operator": "NotIn", "values": ["virtual-kubelet"]}
                ]}
            ]}
        }}}}}
    });

    api.patch(
        "kube-proxy",
        &PatchParams::default(),
        &Patch::Strategic(&patch),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    #[test]
    fn test_with_gvk_stamps_type_metadata() {
        let pod = Pod::default();
        let value = with_gvk(&pod).unwrap();
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["kind"], "Pod");
    }
}
