//! Endpoint address parsing helpers

use crate::{Error, Result};

/// Parse the hostname from an RFC-3986-compliant endpoint. Accepts both full
/// URLs and bare `host:port` authorities.
pub fn hostname(endpoint: &str) -> Result<String> {
    if let Ok(url) = url::Url::parse(endpoint) {
        if let Some(host) = url.host_str() {
            return Ok(host.trim_matches(['[', ']']).to_string());
        }
    }

    // Bare authorities parse as scheme-less paths, retry with a dummy base
    let url = url::Url::parse(&format!("dns://{endpoint}"))
        .map_err(|e| Error::config(format!("invalid endpoint {endpoint:?}: {e}")))?;

    url.host_str()
        .map(|host| host.trim_matches(['[', ']']).to_string())
        .ok_or_else(|| Error::config(format!("unable to parse hostname from {endpoint:?}")))
}

/// Parse `host:port` for dialing from an endpoint string, defaulting the port
/// when absent.
pub fn authority(endpoint: &str, default_port: u16) -> Result<String> {
    let host = hostname(endpoint)?;
    let port = url::Url::parse(endpoint)
        .ok()
        .and_then(|url| url.port())
        .or_else(|| {
            url::Url::parse(&format!("dns://{endpoint}"))
                .ok()
                .and_then(|url| url.port())
        })
        .unwrap_or(default_port);

    if host.contains(':') {
        return Ok(format!("[{host}]:{port}")); // IPv6 literal
    }

    Ok(format!("{host}:{port}"))
}
