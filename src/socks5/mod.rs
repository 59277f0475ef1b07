//! SOCKS5 (RFC 1928 subset): a server-side [`Socks5Handler`] that
//! accepts the no-auth greeting and a CONNECT request, and a
//! client-side [`Socks5Connector`] that speaks the same handshake
//! against an upstream SOCKS5 proxy before handing back a plain byte
//! stream — SOCKS5 carries no per-message framing, so once the
//! handshake completes the underlying connection is forwarded as-is.

use crate::common::socks::{reply_code_for, Command, Greeting, Reply, Request};
use crate::common::{copy_bidirectional, Endpoint, Error, Result};
use crate::registry::Registry;
use crate::stream::{BoxDatagram, BoxStream, Connector, Handler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub(crate) fn register(registry: &mut Registry) {
    registry.register_handler(
        "socks5",
        Arc::new(|_extra, _registry| Ok(Arc::new(Socks5Handler) as Arc<dyn Handler>)),
    );
    registry.register_connector(
        "socks5",
        Arc::new(|extra, registry| {
            let cfg: Socks5ConnectorConfig = serde_yaml::from_value(extra.clone())
                .map_err(|e| Error::config(format!("invalid socks5 connector config: {}", e)))?;
            Socks5Connector::build(cfg, registry).map(|c| Arc::new(c) as Arc<dyn Connector>)
        }),
    );
}

/// Accepts an inbound SOCKS5 client and dials the requested target
/// through whatever connector the listener attached.
pub struct Socks5Handler;

#[async_trait]
impl Handler for Socks5Handler {
    async fn handle_stream(&self, mut stream: BoxStream, connector: &dyn Connector) -> Result<()> {
        let greeting = Greeting::read_from(&mut stream).await?;
        if !greeting.offers_no_auth() {
            Greeting::reply(false, &mut stream).await?;
            return Err(Error::protocol("client did not offer no-auth"));
        }
        Greeting::reply(true, &mut stream).await?;

        let request = Request::read_from(&mut stream).await?;
        if request.command != Command::Connect {
            Reply::failure(crate::common::socks::REP_COMMAND_NOT_SUPPORTED)
                .write_to(&mut stream)
                .await?;
            return Err(Error::unsupported("only CONNECT is implemented"));
        }

        let upstream = match connector.connect(&request.target).await {
            Ok(s) => s,
            Err(e) => {
                Reply::failure(reply_code_for(&e)).write_to(&mut stream).await?;
                return Err(e);
            }
        };
        Reply::success().write_to(&mut stream).await?;

        copy_bidirectional(stream, upstream).await?;
        Ok(())
    }

    async fn handle_datagram(&self, _datagram: BoxDatagram, _connector: &dyn Connector) -> Result<()> {
        Err(Error::unsupported("socks5 handler does not support UDP"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct Socks5ConnectorConfig {
    server: String,
    #[serde(default)]
    connector: Option<String>,
}

/// Dials an upstream SOCKS5 proxy and asks it to CONNECT to the real
/// target, returning the proxy connection itself once the handshake
/// succeeds.
pub struct Socks5Connector {
    server: Endpoint,
    downstream: Arc<dyn Connector>,
}

impl Socks5Connector {
    fn build(cfg: Socks5ConnectorConfig, registry: &Registry) -> Result<Self> {
        let server = Endpoint::parse(&cfg.server)?;
        let downstream = registry.connector(cfg.connector.as_deref().unwrap_or(""))?;
        Ok(Self { server, downstream })
    }
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(&self, target: &Endpoint) -> Result<BoxStream> {
        let mut upstream = self.downstream.connect(&self.server).await?;

        upstream
            .write_all(&[crate::common::socks::SOCKS5_VERSION, 1, crate::common::socks::AUTH_NO_AUTH])
            .await?;
        let mut method_reply = [0u8; 2];
        upstream.read_exact(&mut method_reply).await?;
        if method_reply[0] != crate::common::socks::SOCKS5_VERSION
            || method_reply[1] != crate::common::socks::AUTH_NO_AUTH
        {
            return Err(Error::protocol("upstream SOCKS5 proxy rejected no-auth"));
        }

        let mut request = vec![crate::common::socks::SOCKS5_VERSION, crate::common::socks::CMD_CONNECT, 0x00];
        target.encode_into(&mut request)?;
        upstream.write_all(&request).await?;

        let mut reply_head = [0u8; 3];
        upstream.read_exact(&mut reply_head).await?;
        if reply_head[0] != crate::common::socks::SOCKS5_VERSION {
            return Err(Error::protocol("invalid SOCKS5 reply version"));
        }
        // Bound-address field, discarded: the server already connected
        // to the address we asked for.
        let _bound = Endpoint::read_from(&mut upstream).await?;
        if reply_head[1] != crate::common::socks::REP_SUCCEEDED {
            return Err(Error::connection(format!(
                "upstream SOCKS5 proxy refused CONNECT: code {}",
                reply_head[1]
            )));
        }

        Ok(upstream)
    }

    async fn bind_udp(&self) -> Result<BoxDatagram> {
        Err(Error::unsupported("socks5 connector does not support UDP"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_handler_rejects_bind_command() {
        let (client, server) = duplex(4096);
        let handler = Socks5Handler;
        let connector = crate::system::SystemConnector;

        let server_task = tokio::spawn(async move { handler.handle_stream(Box::new(server), &connector).await });

        let mut client = client;
        client
            .write_all(&[crate::common::socks::SOCKS5_VERSION, 1, crate::common::socks::AUTH_NO_AUTH])
            .await
            .unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply[1], crate::common::socks::AUTH_NO_AUTH);

        client
            .write_all(&[crate::common::socks::SOCKS5_VERSION, crate::common::socks::CMD_BIND, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], crate::common::socks::REP_COMMAND_NOT_SUPPORTED);

        let res = server_task.await.unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_connector_relays_through_upstream_proxy() {
        let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo_listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = echo_listener.accept().await {
                let mut buf = [0u8; 64];
                if let Ok(n) = sock.read(&mut buf).await {
                    let _ = sock.write_all(&buf[..n]).await;
                }
            }
        });

        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = proxy_listener.accept().await.unwrap();
            let handler = Socks5Handler;
            let connector = crate::system::SystemConnector;
            let _ = handler.handle_stream(Box::new(sock), &connector).await;
        });

        let mut cfg = Config::default();
        cfg.connectors.insert(
            "up".to_string(),
            crate::config::NamedComponent {
                kind: "socks5".to_string(),
                extra: serde_yaml::to_value(Socks5ConnectorConfig {
                    server: proxy_addr.to_string(),
                    connector: None,
                })
                .unwrap(),
            },
        );
        let registry = Registry::new(cfg);
        let connector = registry.connector("up").unwrap();

        let mut stream = connector.connect(&Endpoint::from(echo_addr)).await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
