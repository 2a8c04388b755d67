//! Client identity resolution
//!
//! Quota is keyed by the client's IP address. Behind a reverse proxy the
//! peer address is the proxy itself, so forwarded headers can be trusted
//! instead when configured.

use hyper::HeaderMap;
use std::net::{IpAddr, SocketAddr};

fn first_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
}

/// Identity under which the request is counted
pub fn resolve_identity(headers: &HeaderMap, peer: SocketAddr, trust_forwarded: bool) -> String {
    let forwarded = if trust_forwarded {
        first_forwarded_ip(headers).or_else(|| real_ip(headers))
    } else {
        None
    };
    forwarded.unwrap_or_else(|| peer.ip()).to_string()
}
