//! Pluggable asynchronous TCP/UDP proxy engine.
//!
//! A small capability-trait core ([`stream::Connector`], [`stream::Handler`])
//! is wired together by a [`registry::Registry`] built from a [`Config`]:
//! listeners accept connections and hand them to a named handler, handlers
//! dial onward through a named connector, and connectors compose (a
//! Shadowsocks or SOCKS5 connector can sit in front of another connector,
//! including a [`route`] connector that picks downstream by host).
//!
//! # Architecture
//!
//! ```text
//! +-----------+     +-----------+     +------------+
//! |  system   | --> |  route /  | --> | shadowsocks |
//! | Listener  |     | handlers  |     | / socks5    |
//! +-----------+     +-----------+     +------------+
//!                          |
//!                   +------v------+
//!                   |  connectors |
//!                   |  (system,   |
//!                   |  route, ss, |
//!                   |  socks5)    |
//!                   +-------------+
//! ```

pub mod common;
pub mod config;
pub mod misc;
pub mod registry;
pub mod route;
pub mod shadowsocks;
pub mod socks5;
pub mod stream;
pub mod system;
pub mod timer;

pub use common::error::{Error, Result};
pub use config::Config;

use registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds a [`Registry`] from a loaded [`Config`] and runs one
/// [`system::Listener`] per configured listener entry until interrupted.
pub struct Engine {
    registry: Arc<Registry>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(Registry::new(config)),
        }
    }

    /// Binds every configured listener and runs until `ctrl_c`, then
    /// aborts all listener tasks. A single bad listener address or an
    /// unresolvable handler/connector name aborts startup entirely —
    /// there's no good way to run "some" of a config.
    pub async fn run(&self) -> Result<()> {
        let listeners = self.registry.config().listeners.clone();
        let mut handles = Vec::with_capacity(listeners.len());

        for l in listeners {
            let bind: SocketAddr = l
                .bind
                .parse()
                .map_err(|e| Error::config(format!("invalid listener bind address '{}': {}", l.bind, e)))?;
            let handler = self.registry.handler(&l.handler)?;
            let connector = self.registry.connector(l.connector.as_deref().unwrap_or(""))?;

            info!(%bind, handler = %l.handler, "starting listener");
            let listener = system::Listener::new(bind, handler, connector);
            handles.push(tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    warn!(%bind, error = %e, "listener exited");
                }
            }));
        }

        tokio::signal::ctrl_c().await?;
        info!("received shutdown signal, stopping listeners");
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_builds_from_minimal_config() {
        let cfg = Config::parse(
            r#"
listeners:
  - bind: "127.0.0.1:0"
    handler: echo
"#,
        )
        .unwrap();
        let engine = Engine::new(cfg);
        assert!(engine.registry().handler("echo").is_ok());
    }

    #[test]
    fn test_run_rejects_unparseable_bind_address() {
        // Config::validate only checks handler/connector names, not that
        // `bind` parses as a socket address, so a malformed one surfaces
        // here instead.
        let cfg = Config::parse(
            r#"
listeners:
  - bind: "not-an-address"
    handler: echo
"#,
        )
        .unwrap();
        let engine = Engine::new(cfg);
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async { engine.run().await });
        assert!(result.is_err());
    }
}
