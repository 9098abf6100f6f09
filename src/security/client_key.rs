//! Client identification for rate limiting.
//!
//! Clients are keyed by a salted SHA-256 of their address so raw IPs never
//! reach the bucket store.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Resolve the client address.
///
/// Preference: `X-Real-IP`, then the first `X-Forwarded-For` hop, then the
/// peer address of the connection. Unparseable header values are skipped.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let real_ip = headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());

    let forwarded = || {
        headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
    };

    real_ip.or_else(forwarded).or(peer.map(|addr| addr.ip()))
}

/// Hex SHA-256 of `salt || ip`.
pub fn hash_client_key(ip: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(ip.as_bytes());
    hex::encode(hasher.finalize())
}

/// Admin endpoints accept either a raw address or an already hashed key.
pub fn normalize_key(raw: &str, salt: &str) -> String {
    match raw.trim().parse::<IpAddr>() {
        Ok(ip) => hash_client_key(&ip.to_string(), salt),
        Err(_) => raw.trim().to_string(),
    }
}
