//! # Hashed IP
//!
//! Secondary throttling signal only, never an identity.
//!
//! - Client address is the first hop of `X-Forwarded-For`, else the socket peer
//! - IPv4 is truncated to its /24, IPv6 to its /64, so a whole subnet hashes the same
//! - `hmac(HMAC_IP_KEY, "{network}/{prefix}")` in hex, the raw address is never stored
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::http::HeaderMap;
use thiserror::Error;

use crate::secrets::Secrets;

pub const FORWARDED_FOR: &str = "x-forwarded-for";

const V4_PREFIX: u8 = 24;
const V6_PREFIX: u8 = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IpError {
    #[error("No client address available")]
    Missing,

    #[error("Invalid client address: {0}")]
    Invalid(String),
}

pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Result<IpAddr, IpError> {
    let forwarded = match headers.get(FORWARDED_FOR) {
        Some(value) => value
            .to_str()
            .map_err(|_| {
                IpError::Invalid(String::from_utf8_lossy(value.as_bytes()).into_owned())
            })?
            .split(',')
            .next()
            .map(str::trim)
            .filter(|hop| !hop.is_empty()),
        None => None,
    };

    match (forwarded, peer) {
        (Some(hop), _) => parse_hop(hop),
        (None, Some(ip)) => Ok(ip),
        (None, None) => Err(IpError::Missing),
    }
}

/// Network address and prefix length the client address is hashed under.
pub fn truncate(ip: IpAddr) -> (IpAddr, u8) {
    match ip {
        IpAddr::V4(v4) => (IpAddr::V4(truncate_v4(v4)), V4_PREFIX),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => (IpAddr::V4(truncate_v4(v4)), V4_PREFIX),
            None => (IpAddr::V6(truncate_v6(v6)), V6_PREFIX),
        },
    }
}

pub fn hashed_ip(secrets: &Secrets, ip: IpAddr) -> String {
    let (network, prefix) = truncate(ip);

    secrets.hash_network(&format!("{network}/{prefix}"))
}

pub fn hashed_client_ip(
    secrets: &Secrets,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
) -> Result<String, IpError> {
    client_ip(headers, peer).map(|ip| hashed_ip(secrets, ip))
}

fn parse_hop(hop: &str) -> Result<IpAddr, IpError> {
    hop.parse::<IpAddr>()
        .or_else(|_| hop.parse::<SocketAddr>().map(|addr| addr.ip()))
        .map_err(|_| IpError::Invalid(hop.to_string()))
}

fn truncate_v4(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & (u32::MAX << (32 - V4_PREFIX)))
}

fn truncate_v6(ip: Ipv6Addr) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(ip) & (u128::MAX << (128 - V6_PREFIX)))
}
