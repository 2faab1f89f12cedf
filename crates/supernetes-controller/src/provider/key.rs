//! Pod indexing key

use std::fmt;

use k8s_openapi::api::core::v1::Pod;

/// Index for pod resources tracked by a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
}

impl PodKey {
    /// Build a key from explicit parts
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl From<&Pod> for PodKey {
    fn from(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PodKey::new("default", "web").to_string(), "default/web");
    }
}
