//! Plain test protocols: echo, null, random, zero.
//!
//! These don't dial anywhere — the `connector` argument every `Handler`
//! receives is ignored — they exist to exercise a listener and its
//! transport plumbing without a real proxy behind it.

use crate::common::Result;
use crate::registry::Registry;
use crate::stream::{BoxDatagram, BoxStream, Connector, Handler};
use async_trait::async_trait;
use rand::RngCore;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const BUF_SIZE: usize = 16 * 1024;

pub(crate) fn register(registry: &mut Registry) {
    registry.register_handler("echo", Arc::new(|_e, _r| Ok(Arc::new(EchoHandler) as Arc<dyn Handler>)));
    registry.register_handler("null", Arc::new(|_e, _r| Ok(Arc::new(NullHandler) as Arc<dyn Handler>)));
    registry.register_handler(
        "random",
        Arc::new(|_e, _r| Ok(Arc::new(RandomHandler) as Arc<dyn Handler>)),
    );
    registry.register_handler("zero", Arc::new(|_e, _r| Ok(Arc::new(ZeroHandler) as Arc<dyn Handler>)));
}

pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle_stream(&self, mut stream: BoxStream, _connector: &dyn Connector) -> Result<()> {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..n]).await?;
        }
    }

    async fn handle_datagram(&self, mut datagram: BoxDatagram, _connector: &dyn Connector) -> Result<()> {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let (n, peer) = datagram.recv_from(&mut buf).await?;
            datagram.send_to(&buf[..n], peer).await?;
        }
    }
}

pub struct NullHandler;

#[async_trait]
impl Handler for NullHandler {
    async fn handle_stream(&self, mut stream: BoxStream, _connector: &dyn Connector) -> Result<()> {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    async fn handle_datagram(&self, mut datagram: BoxDatagram, _connector: &dyn Connector) -> Result<()> {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            datagram.recv_from(&mut buf).await?;
        }
    }
}

pub struct RandomHandler;

#[async_trait]
impl Handler for RandomHandler {
    async fn handle_stream(&self, stream: BoxStream, _connector: &dyn Connector) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let read_loop = async move {
            let mut buf = vec![0u8; BUF_SIZE];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<(), crate::Error>(());
                }
            }
        };
        let write_loop = async move {
            let mut buf = vec![0u8; BUF_SIZE];
            loop {
                rand::thread_rng().fill_bytes(&mut buf);
                writer.write_all(&buf).await?;
            }
        };
        tokio::select! {
            r = read_loop => r,
            w = write_loop => w,
        }
    }
}

pub struct ZeroHandler;

#[async_trait]
impl Handler for ZeroHandler {
    async fn handle_stream(&self, stream: BoxStream, _connector: &dyn Connector) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let read_loop = async move {
            let mut buf = vec![0u8; BUF_SIZE];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<(), crate::Error>(());
                }
            }
        };
        let write_loop = async move {
            let buf = vec![0u8; BUF_SIZE];
            loop {
                writer.write_all(&buf).await?;
            }
        };
        tokio::select! {
            r = read_loop => r,
            w = write_loop => w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (client, server) = duplex(64);
        let handler = EchoHandler;
        let connector = crate::system::SystemConnector;
        let server_task = tokio::spawn(async move {
            handler.handle_stream(Box::new(server), &connector).await
        });

        let mut client = client;
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(client);
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn test_null_discards() {
        let (mut client, server) = duplex(64);
        let handler = NullHandler;
        let connector = crate::system::SystemConnector;
        let task = tokio::spawn(async move { handler.handle_stream(Box::new(server), &connector).await });
        client.write_all(b"ignored").await.unwrap();
        drop(client);
        let res = task.await.unwrap();
        assert!(res.is_ok());
    }
}
