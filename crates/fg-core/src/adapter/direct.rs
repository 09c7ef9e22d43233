//! Plain TCP/UDP adapter that dials the destination itself: the zero member
//! of the adapter family, and the workhorse of the probe tests.

use super::{BoxedDatagram, BoxedStream, DatagramTransport, EndpointAdapter, ProtocolTag};
use crate::types::Metadata;
use async_trait::async_trait;
use std::io;
use tokio::net::{TcpStream, UdpSocket};

#[derive(Debug)]
pub struct DirectAdapter {
    name: String,
}

impl DirectAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl EndpointAdapter for DirectAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> ProtocolTag {
        ProtocolTag::Direct
    }

    async fn dial(&self, metadata: &Metadata) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((metadata.host.as_str(), metadata.port)).await?;
        Ok(Box::new(stream))
    }

    async fn listen_udp(&self, _metadata: &Metadata) -> io::Result<BoxedDatagram> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        Ok(Box::new(DirectDatagram(socket)))
    }

    fn supports_udp(&self) -> bool {
        true
    }
}

struct DirectDatagram(UdpSocket);

#[async_trait]
impl DatagramTransport for DirectDatagram {
    async fn send_to(&self, buf: &[u8], addr: &str) -> io::Result<usize> {
        self.0.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, String)> {
        let (n, from) = self.0.recv_from(buf).await?;
        Ok((n, from.to_string()))
    }
}
