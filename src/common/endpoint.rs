//! Target endpoint type and TCP socket configuration helpers.

use crate::{Error, Result};
use socket2::SockRef;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Relay bytes in both directions between two transports until either
/// side closes, using the adaptive-weighted copy loop in [`super::buffer`].
pub async fn copy_bidirectional<A, B>(mut a: A, mut b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    super::buffer::greedy_copy_bidirectional(&mut a, &mut b).await
}

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream, no_delay: bool) {
    if no_delay {
        let _ = stream.set_nodelay(true);
    }
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// A dial target: a resolved IPv4/IPv6 address+port, or an unresolved
/// hostname+port that the connector is responsible for resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Host(String, u16),
}

impl Endpoint {
    /// Parse `ADDR:PORT`, where `ADDR` may be a bracketed IPv6 literal,
    /// a bare IPv4 literal, or a hostname.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::address(format!("missing port in '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::address(format!("invalid port in '{}'", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(v4) = Ipv4Addr::from_str(host) {
            return Ok(Endpoint::V4(v4, port));
        }
        if let Ok(v6) = Ipv6Addr::from_str(host) {
            return Ok(Endpoint::V6(v6, port));
        }
        Ok(Endpoint::Host(host.to_string(), port))
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::V4(_, p) => *p,
            Endpoint::V6(_, p) => *p,
            Endpoint::Host(_, p) => *p,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Endpoint::V4(a, _) => a.to_string(),
            Endpoint::V6(a, _) => a.to_string(),
            Endpoint::Host(h, _) => h.clone(),
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::V4(a, p) => Some(SocketAddr::new(IpAddr::V4(*a), *p)),
            Endpoint::V6(a, p) => Some(SocketAddr::new(IpAddr::V6(*a), *p)),
            Endpoint::Host(_, _) => None,
        }
    }

    /// SOCKS5/Shadowsocks address-record wire length: atyp + body + port.
    pub fn wire_len(&self) -> usize {
        match self {
            Endpoint::V4(_, _) => 1 + 4 + 2,
            Endpoint::V6(_, _) => 1 + 16 + 2,
            Endpoint::Host(h, _) => 1 + 1 + h.len() + 2,
        }
    }

    /// Read an address record: `atyp(u8) || body || port(u16)`, the same
    /// shape SOCKS5 and the Shadowsocks address record both use.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;
        match atyp[0] {
            0x01 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(Endpoint::V4(
                    Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
                    port,
                ))
            }
            0x04 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(Endpoint::V6(Ipv6Addr::from(ip), port))
            }
            0x03 => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let host = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| Error::parse(format!("invalid host: {}", e)))?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok(Endpoint::Host(host, port))
            }
            t => Err(Error::protocol(format!("unknown address type: {}", t))),
        }
    }

    /// Parse an address record out of an already-buffered slice (as
    /// opposed to streaming it off a socket via [`Self::read_from`]),
    /// returning the value and how many bytes of `buf` it consumed.
    /// Used where the record has already been decrypted into memory,
    /// e.g. the Shadowsocks address record inside a decrypted chunk.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize)> {
        let atyp = *buf
            .first()
            .ok_or_else(|| Error::protocol("empty address record"))?;
        match atyp {
            0x01 => {
                if buf.len() < 7 {
                    return Err(Error::protocol("truncated ipv4 address record"));
                }
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((
                    Endpoint::V4(Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]), port),
                    7,
                ))
            }
            0x04 => {
                if buf.len() < 19 {
                    return Err(Error::protocol("truncated ipv6 address record"));
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Endpoint::V6(Ipv6Addr::from(ip), port), 19))
            }
            0x03 => {
                if buf.len() < 2 {
                    return Err(Error::protocol("truncated host address record"));
                }
                let len = buf[1] as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(Error::protocol("truncated host address record"));
                }
                let host = String::from_utf8(buf[2..2 + len].to_vec())
                    .map_err(|e| Error::parse(format!("invalid host: {}", e)))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Endpoint::Host(host, port), 4 + len))
            }
            t => Err(Error::protocol(format!("unknown address type: {}", t))),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(self.wire_len());
        self.encode_into(&mut buf)?;
        writer.write_all(&buf).await?;
        Ok(())
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Endpoint::V4(a, p) => {
                buf.push(0x01);
                buf.extend_from_slice(&a.octets());
                buf.extend_from_slice(&p.to_be_bytes());
            }
            Endpoint::V6(a, p) => {
                buf.push(0x04);
                buf.extend_from_slice(&a.octets());
                buf.extend_from_slice(&p.to_be_bytes());
            }
            Endpoint::Host(h, p) => {
                let bytes = h.as_bytes();
                if bytes.len() > 255 {
                    return Err(Error::address("host name too long"));
                }
                buf.push(0x03);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
                buf.extend_from_slice(&p.to_be_bytes());
            }
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4(a, p) => write!(f, "{}:{}", a, p),
            Endpoint::V6(a, p) => write!(f, "[{}]:{}", a, p),
            Endpoint::Host(h, p) => write!(f, "{}:{}", h, p),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Endpoint::V4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Endpoint::V6(*v6.ip(), v6.port()),
        }
    }
}
