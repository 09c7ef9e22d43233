//! Capability surface consumed from the protocol layer.
//!
//! The core never implements tunnels itself: it measures, ranks and picks
//! between opaque adapters handed in from outside. Only the trivial
//! direct-TCP adapter lives here.

pub mod direct;

use crate::types::Metadata;
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream returned by an adapter dial.
pub trait AdapterStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AdapterStream for T {}

pub type BoxedStream = Box<dyn AdapterStream>;

/// Datagram transport returned by `listen_udp`.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, buf: &[u8], addr: &str) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, String)>;
}

pub type BoxedDatagram = Box<dyn DatagramTransport>;

/// Protocol discriminator carried by every adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolTag {
    Direct,
    Http,
    Socks5,
    Shadowsocks,
    Trojan,
    Vmess,
    Vless,
    UrlTest,
}

impl ProtocolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Direct => "Direct",
            ProtocolTag::Http => "Http",
            ProtocolTag::Socks5 => "Socks5",
            ProtocolTag::Shadowsocks => "Shadowsocks",
            ProtocolTag::Trojan => "Trojan",
            ProtocolTag::Vmess => "Vmess",
            ProtocolTag::Vless => "Vless",
            ProtocolTag::UrlTest => "URLTest",
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dial-plane knobs an adapter exposes for serialization.
#[derive(Clone, Debug, Default)]
pub struct ProxyInfo {
    pub xudp: bool,
    pub tfo: bool,
    pub mptcp: bool,
    pub smux: bool,
    pub interface: String,
    pub dialer_proxy: String,
    pub routing_mark: u32,
}

/// An upstream an endpoint can tunnel through. Implemented by the protocol
/// layer; the core treats it as an immutable capability handle.
#[async_trait]
pub trait EndpointAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn protocol(&self) -> ProtocolTag;

    /// Opens a tunnel connection to the destination in `metadata`.
    async fn dial(&self, metadata: &Metadata) -> io::Result<BoxedStream>;

    /// Opens a datagram session for the destination in `metadata`.
    async fn listen_udp(&self, metadata: &Metadata) -> io::Result<BoxedDatagram>;

    fn supports_udp(&self) -> bool {
        false
    }

    fn supports_uot(&self) -> bool {
        false
    }

    /// Streams of adapters that finish their protocol handshake lazily
    /// surface dial failures only at the first write; groups wrap those in a
    /// first-write callback to keep failure accounting accurate.
    fn handshake_on_first_write(&self) -> bool {
        false
    }

    fn proxy_info(&self) -> ProxyInfo {
        ProxyInfo::default()
    }

    fn as_json(&self) -> serde_json::Value {
        json!({ "type": self.protocol().as_str() })
    }
}

/// Builds adapters from decoded subscription entries. Implemented by the
/// protocol layer and injected into fetched providers.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, raw: &fg_subscribe::RawOutbound) -> anyhow::Result<Arc<dyn EndpointAdapter>>;
}
