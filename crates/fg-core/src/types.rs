use crate::error::CoreError;
use serde::Serialize;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrType {
    Ipv4,
    Ipv6,
    Domain,
}

/// Destination descriptor handed to adapter dials.
#[derive(Clone, Debug)]
pub struct Metadata {
    pub host: String,
    pub port: u16,
    pub addr_type: AddrType,
    pub network: Network,
}

impl Metadata {
    pub fn new(network: Network) -> Self {
        Self {
            host: String::new(),
            port: 0,
            addr_type: AddrType::Domain,
            network,
        }
    }

    /// Replaces the destination with a `host:port` string, inferring the
    /// address type from the host. IPv6 hosts use the `[addr]:port` form.
    pub fn set_remote_address(&mut self, addr: &str) -> Result<(), CoreError> {
        let (host, port) = split_host_port(addr)?;
        self.addr_type = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => AddrType::Ipv4,
            Ok(IpAddr::V6(_)) => AddrType::Ipv6,
            Err(_) => AddrType::Domain,
        };
        self.host = host;
        self.port = port;
        Ok(())
    }

    pub fn remote_address(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), CoreError> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| CoreError::InvalidUrl(addr.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| CoreError::InvalidUrl(addr.to_string()))?;
        return Ok((host.to_string(), port));
    }
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| CoreError::InvalidUrl(addr.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| CoreError::InvalidUrl(addr.to_string()))?;
    if host.is_empty() {
        return Err(CoreError::InvalidUrl(addr.to_string()));
    }
    Ok((host.to_string(), port))
}
