//! The system connector and listener: the one connector that actually
//! touches a socket. Everything else in the tree eventually dials
//! through this, directly or by delegating through a chain of other
//! connectors.

use crate::common::{configure_tcp_stream, Endpoint, Error, Result};
use crate::registry::Registry;
use crate::stream::{BoxDatagram, BoxStream, Connector, Datagram, Handler};
use crate::timer::TimerList;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(500);
/// A connection with no successful read or write for this long is
/// closed automatically.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub(crate) fn register(registry: &mut Registry) {
    registry.register_connector(
        "system",
        Arc::new(|_extra, _registry| Ok(Arc::new(SystemConnector) as Arc<dyn Connector>)),
    );
}

/// Dials the network directly: resolves hostnames via the system
/// resolver and connects/binds a raw socket.
pub struct SystemConnector;

impl SystemConnector {
    async fn resolve(target: &Endpoint) -> Result<SocketAddr> {
        if let Some(addr) = target.to_socket_addr() {
            return Ok(addr);
        }
        let query = format!("{}:{}", target.host(), target.port());
        let mut addrs = tokio::net::lookup_host(&query)
            .await
            .map_err(|e| Error::connection(format!("resolving {}: {}", query, e)))?;
        addrs
            .next()
            .ok_or_else(|| Error::connection(format!("no addresses for {}", query)))
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn connect(&self, target: &Endpoint) -> Result<BoxStream> {
        let addr = Self::resolve(target).await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::connection(format!("connecting to {}: {}", addr, e)))?;
        configure_tcp_stream(&stream, true);
        Ok(Box::new(stream))
    }

    async fn bind_udp(&self) -> Result<BoxDatagram> {
        let sock = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Box::new(SystemDatagram { sock }))
    }
}

/// A bound UDP socket presented through the `Datagram` capability.
pub struct SystemDatagram {
    sock: UdpSocket,
}

#[async_trait]
impl Datagram for SystemDatagram {
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.sock.recv_from(buf).await?)
    }

    async fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(self.sock.send_to(buf, target).await?)
    }
}

/// Accepts inbound TCP connections (and owns one UDP socket on the
/// same bind address, handed to the configured handler's datagram path
/// even when that handler never uses it) and dispatches each to the
/// configured handler/connector pair.
pub struct Listener {
    bind: SocketAddr,
    handler: Arc<dyn Handler>,
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
}

impl Listener {
    pub fn new(bind: SocketAddr, handler: Arc<dyn Handler>, connector: Arc<dyn Connector>) -> Self {
        Self {
            bind,
            handler,
            connector,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub async fn run(self) -> Result<()> {
        let tcp = TcpListener::bind(self.bind)
            .await
            .map_err(|e| Error::connection(format!("binding {}: {}", self.bind, e)))?;
        let udp = UdpSocket::bind(self.bind).await.ok();

        let handler = self.handler.clone();
        let connector = self.connector.clone();
        if let Some(udp) = udp {
            tokio::spawn(run_udp(udp, handler, connector));
        }

        let handles: Arc<Mutex<HashMap<u64, AbortHandle>>> = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(idle_reaper(TimerList::new(self.idle_timeout), cmd_rx, handles.clone()));
        let next_id = AtomicU64::new(0);

        loop {
            match tcp.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    configure_tcp_stream(&stream, true);
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let _ = cmd_tx.send(TimerCmd::Touch(id));

                    let handler = self.handler.clone();
                    let connector = self.connector.clone();
                    let cmd_tx = cmd_tx.clone();
                    let handles_for_cleanup = handles.clone();
                    let tracked: BoxStream = Box::new(IdleTrackedStream {
                        inner: stream,
                        id,
                        cmd_tx: cmd_tx.clone(),
                    });
                    let join = tokio::spawn(async move {
                        if let Err(e) = handler.handle_stream(tracked, connector.as_ref()).await {
                            warn!(%peer, error = %e, "connection handler failed");
                        }
                        handles_for_cleanup.lock().remove(&id);
                        let _ = cmd_tx.send(TimerCmd::Remove(id));
                    });
                    handles.lock().insert(id, join.abort_handle());
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, backing off");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            }
        }
    }
}

enum TimerCmd<K> {
    Touch(K),
    Remove(K),
}

/// Owns the single process-wide idle-timer wheel for one listener: a
/// connection with no successful read or write for `idle_timeout`
/// closes automatically (its task is aborted, which drops the socket).
async fn idle_reaper(
    mut timers: TimerList<u64>,
    mut cmds: mpsc::UnboundedReceiver<TimerCmd<u64>>,
    handles: Arc<Mutex<HashMap<u64, AbortHandle>>>,
) {
    loop {
        if timers.is_empty() {
            match cmds.recv().await {
                Some(TimerCmd::Touch(id)) => timers.touch(id),
                Some(TimerCmd::Remove(id)) => timers.remove(&id),
                None => return,
            }
            continue;
        }
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(TimerCmd::Touch(id)) => timers.touch(id),
                Some(TimerCmd::Remove(id)) => timers.remove(&id),
                None => return,
            },
            expired = timers.next_expired() => {
                if let Some(id) = expired {
                    if let Some(handle) = handles.lock().remove(&id) {
                        debug!(id, "connection idle, aborting");
                        handle.abort();
                    }
                }
            }
        }
    }
}

/// Wraps an accepted socket so every successful read or write touches
/// the shared idle timer, resetting its deadline.
struct IdleTrackedStream<S> {
    inner: S,
    id: u64,
    cmd_tx: mpsc::UnboundedSender<TimerCmd<u64>>,
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTrackedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before {
                let _ = this.cmd_tx.send(TimerCmd::Touch(this.id));
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTrackedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                let _ = this.cmd_tx.send(TimerCmd::Touch(this.id));
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

async fn run_udp(sock: UdpSocket, handler: Arc<dyn Handler>, connector: Arc<dyn Connector>) {
    let datagram: BoxDatagram = Box::new(SystemDatagram { sock });
    if let Err(e) = handler.handle_datagram(datagram, connector.as_ref()).await {
        warn!(error = %e, "udp handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let connector = SystemConnector;
        let target = Endpoint::from(addr);
        let stream = connector.connect(&target).await;
        assert!(stream.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_udp() {
        let connector = SystemConnector;
        let datagram = connector.bind_udp().await;
        assert!(datagram.is_ok());
    }

    #[tokio::test]
    async fn test_idle_connection_closes_after_timeout() {
        use crate::misc::EchoHandler;
        use tokio::io::AsyncReadExt;

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        drop(tcp);
        let listener = Listener::new(addr, Arc::new(EchoHandler), Arc::new(SystemConnector))
            .with_idle_timeout(Duration::from_millis(50));
        tokio::spawn(listener.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        // No activity for longer than the idle timeout: the server side
        // should close, surfacing as EOF (or an error) on our read.
        let result = tokio::time::timeout(Duration::from_millis(500), client.read(&mut buf)).await;
        match result {
            Ok(Ok(n)) => assert_eq!(n, 0),
            Ok(Err(_)) => {}
            Err(_) => panic!("idle connection was not closed within the timeout"),
        }
    }
}
