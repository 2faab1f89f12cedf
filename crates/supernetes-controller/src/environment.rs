//! Dynamic (environment) configuration of the controller
//!
//! Sourced from environment variables injected through the downward API.
//! Any missing value disables the dependent feature (kubelet HTTP façade,
//! CSR approver) without aborting the process.

use std::net::IpAddr;

use tracing::warn;

use supernetes_common::labels::{
    ENV_CONTROLLER_ADDRESS, ENV_CONTROLLER_NAMESPACE, ENV_CONTROLLER_SERVICEACCOUNT,
};

/// Dynamic controller configuration
#[derive(Debug, Clone, Default)]
pub struct Environment {
    namespace: Option<String>,
    service_account: Option<String>,
    address: Option<IpAddr>,
}

impl Environment {
    /// Acquire and parse the dynamic configuration from the environment
    pub fn load() -> Self {
        let namespace = load_string(ENV_CONTROLLER_NAMESPACE);
        if namespace.is_none() {
            warn!(var = ENV_CONTROLLER_NAMESPACE, "controller namespace unavailable");
        }

        let service_account = load_string(ENV_CONTROLLER_SERVICEACCOUNT);
        if service_account.is_none() {
            warn!(
                var = ENV_CONTROLLER_SERVICEACCOUNT,
                "controller service account name unavailable"
            );
        }

        // Takes in status.podIP, no guessing here
        let address = match load_string(ENV_CONTROLLER_ADDRESS) {
            Some(address) => match address.parse() {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!(error = %e, "controller address unparsable");
                    None
                }
            },
            None => {
                warn!(var = ENV_CONTROLLER_ADDRESS, "controller address unavailable");
                None
            }
        };

        Self {
            namespace,
            service_account,
            address,
        }
    }

    /// Construct an environment directly, for tests and tooling
    pub fn new(
        namespace: Option<String>,
        service_account: Option<String>,
        address: Option<IpAddr>,
    ) -> Self {
        Self {
            namespace,
            service_account,
            address,
        }
    }

    /// The controller namespace, if known
    pub fn controller_namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The controller service account name, if known
    pub fn controller_service_account(&self) -> Option<&str> {
        self.service_account.as_deref()
    }

    /// The IP address of the controller, if known
    pub fn controller_address(&self) -> Option<IpAddr> {
        self.address
    }
}

fn load_string(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let env = Environment::new(
            Some("supernetes".into()),
            Some("controller".into()),
            Some("10.1.2.3".parse().unwrap()),
        );
        assert_eq!(env.controller_namespace(), Some("supernetes"));
        assert_eq!(env.controller_service_account(), Some("controller"));
        assert_eq!(env.controller_address(), Some("10.1.2.3".parse().unwrap()));

        let env = Environment::default();
        assert_eq!(env.controller_namespace(), None);
        assert_eq!(env.controller_address(), None);
    }
}
