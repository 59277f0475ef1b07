//! SOCKS5 wire types (RFC 1928): the no-auth greeting, the CONNECT
//! request, and the reply. BIND and UDP ASSOCIATE are parsed only far
//! enough to be rejected with `REP_COMMAND_NOT_SUPPORTED` — this
//! engine's SOCKS5 handler is CONNECT-only.

use super::{Endpoint, Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(Error::protocol(format!("unknown SOCKS5 command: {}", value))),
        }
    }
}

/// The client's method-selection greeting: which auth methods it offers.
pub struct Greeting {
    methods: Vec<u8>,
}

impl Greeting {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!("unsupported SOCKS version: {}", head[0])));
        }
        let mut methods = vec![0u8; head[1] as usize];
        reader.read_exact(&mut methods).await?;
        Ok(Self { methods })
    }

    pub fn offers_no_auth(&self) -> bool {
        self.methods.contains(&AUTH_NO_AUTH)
    }

    /// Reply to the greeting, selecting `AUTH_NO_AUTH` or refusing with
    /// `AUTH_NO_ACCEPTABLE`.
    pub async fn reply<W: AsyncWrite + Unpin>(accept: bool, writer: &mut W) -> Result<()> {
        let method = if accept { AUTH_NO_AUTH } else { AUTH_NO_ACCEPTABLE };
        writer.write_all(&[SOCKS5_VERSION, method]).await?;
        Ok(())
    }
}

/// A parsed SOCKS5 request: the command and the target address record.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub target: Endpoint,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!("unsupported SOCKS version: {}", header[0])));
        }
        let command = Command::try_from(header[1])?;
        // header[2] is the reserved byte.
        let target = Endpoint::read_from(reader).await?;
        Ok(Self { command, target })
    }
}

/// A SOCKS5 reply. Per this engine's Open Question decision, the
/// success reply's bound-address field is always the fixed IPv4-form
/// `0.0.0.0:0` rather than echoing the real upstream address — callers
/// that need the dialed address already have it from the request.
pub struct Reply {
    code: u8,
}

impl Reply {
    pub fn success() -> Self {
        Self { code: REP_SUCCEEDED }
    }

    pub fn failure(code: u8) -> Self {
        Self { code }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = [
            SOCKS5_VERSION,
            self.code,
            0x00, // reserved
            0x01, // ATYP_IPV4
            0, 0, 0, 0, // 0.0.0.0
            0, 0, // port 0
        ];
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// Map a connect failure to the SOCKS5 reply code a client expects.
pub fn reply_code_for(err: &Error) -> u8 {
    match err {
        Error::Connection(_) => REP_HOST_UNREACHABLE,
        Error::Timeout(_) => REP_NETWORK_UNREACHABLE,
        Error::Unsupported(_) => REP_COMMAND_NOT_SUPPORTED,
        _ => REP_GENERAL_FAILURE,
    }
}
