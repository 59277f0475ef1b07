//! Capability traits tying connectors and handlers together.
//!
//! A `Stream` is a connected byte pipe (TCP-like); a `Datagram` is a
//! connectionless packet pipe (UDP-like). `Connector` produces one of
//! these given a target `Endpoint`; `Handler` consumes one produced by
//! a `Listener` accepting an inbound client.

use crate::common::{Endpoint, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected, ordered byte stream: TCP or a Shadowsocks tunnel over TCP.
pub trait Stream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// A connectionless packet pipe, addressed per-packet.
#[async_trait]
pub trait Datagram: Send + Sync {
    /// Receive one packet, returning its payload and the peer it came from.
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
    /// Send one packet to `target`.
    async fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> Result<usize>;
}

pub type BoxDatagram = Box<dyn Datagram>;

/// Dials an `Endpoint` and returns a connected transport. Connectors
/// compose: a route connector picks a downstream connector by host, a
/// Shadowsocks connector wraps a direct connector's stream in a cipher.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &Endpoint) -> Result<BoxStream>;

    async fn bind_udp(&self) -> Result<BoxDatagram> {
        Err(crate::Error::unsupported("connector does not support UDP"))
    }
}

pub type BoxConnector = Box<dyn Connector>;

/// Services one accepted inbound connection (TCP) or packet flow (UDP).
/// `connector` is the already-resolved next hop the handler should dial
/// into once it has parsed its own framing off `stream`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle_stream(&self, stream: BoxStream, connector: &dyn Connector) -> Result<()>;

    async fn handle_datagram(
        &self,
        _datagram: BoxDatagram,
        _connector: &dyn Connector,
    ) -> Result<()> {
        Ok(())
    }
}

pub type BoxHandler = Box<dyn Handler>;
