//! Proxy registry: resolves named handlers and connectors from config.
//!
//! Each component `type` (e.g. `"system"`, `"route"`, `"shadowsocks"`)
//! has a builder registered once at startup; resolving a named instance
//! looks up its config entry, finds the builder for its `type`, and
//! caches the built instance so repeated references (a route rule and
//! a listener both naming the same connector) share one object.

use crate::common::{Error, Result};
use crate::config::{Config, NamedComponent};
use crate::stream::{BoxConnector, BoxHandler};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type ConnectorBuilder =
    Arc<dyn Fn(&serde_yaml::Value, &Registry) -> Result<Arc<dyn crate::stream::Connector>> + Send + Sync>;
pub type HandlerBuilder =
    Arc<dyn Fn(&serde_yaml::Value, &Registry) -> Result<Arc<dyn crate::stream::Handler>> + Send + Sync>;

/// Resolves named handlers/connectors out of a loaded [`Config`],
/// building each at most once.
pub struct Registry {
    config: Config,
    connector_builders: HashMap<String, ConnectorBuilder>,
    handler_builders: HashMap<String, HandlerBuilder>,
    connector_cache: Mutex<HashMap<String, Arc<dyn crate::stream::Connector>>>,
    handler_cache: Mutex<HashMap<String, Arc<dyn crate::stream::Handler>>>,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        let mut reg = Self {
            config,
            connector_builders: HashMap::new(),
            handler_builders: HashMap::new(),
            connector_cache: Mutex::new(HashMap::new()),
            handler_cache: Mutex::new(HashMap::new()),
        };
        crate::system::register(&mut reg);
        crate::misc::register(&mut reg);
        crate::route::register(&mut reg);
        crate::shadowsocks::register(&mut reg);
        crate::socks5::register(&mut reg);
        reg
    }

    /// Register a connector builder for `type_name`. Panics on a
    /// duplicate registration — this only runs once at startup over a
    /// fixed, known set of built-in types, so a collision is a
    /// programming error, not a runtime condition to recover from.
    pub fn register_connector(&mut self, type_name: &str, builder: ConnectorBuilder) {
        if self
            .connector_builders
            .insert(type_name.to_string(), builder)
            .is_some()
        {
            panic!("duplicate connector type registered: {}", type_name);
        }
    }

    pub fn register_handler(&mut self, type_name: &str, builder: HandlerBuilder) {
        if self
            .handler_builders
            .insert(type_name.to_string(), builder)
            .is_some()
        {
            panic!("duplicate handler type registered: {}", type_name);
        }
    }

    /// Resolve a named connector, building and caching it on first use.
    /// The empty name `""` always resolves to the default `system`
    /// direct-dial connector, even if absent from the config's
    /// `connectors` table.
    pub fn connector(&self, name: &str) -> Result<Arc<dyn crate::stream::Connector>> {
        if let Some(cached) = self.connector_cache.lock().get(name) {
            return Ok(cached.clone());
        }
        let (kind, extra) = if name.is_empty() {
            ("system".to_string(), serde_yaml::Value::Null)
        } else if let Some(c) = self.config.connectors.get(name) {
            (c.kind.clone(), c.extra.clone())
        } else if name == "system" {
            ("system".to_string(), serde_yaml::Value::Null)
        } else {
            return Err(Error::config(format!("unknown connector '{}'", name)));
        };
        let builder = self
            .connector_builders
            .get(&kind)
            .ok_or_else(|| Error::config(format!("unknown connector type '{}'", kind)))?
            .clone();
        let instance = builder(&extra, self)?;
        self.connector_cache
            .lock()
            .insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Resolve a named handler, or a built-in by name (`"echo"`,
    /// `"null"`, `"random"`, `"zero"`, `"socks5"`) when it has no
    /// config entry of its own.
    pub fn handler(&self, name: &str) -> Result<Arc<dyn crate::stream::Handler>> {
        if let Some(cached) = self.handler_cache.lock().get(name) {
            return Ok(cached.clone());
        }
        let (kind, extra) = if let Some(h) = self.config.handlers.get(name) {
            (h.kind.clone(), h.extra.clone())
        } else {
            (name.to_string(), serde_yaml::Value::Null)
        };
        let builder = self
            .handler_builders
            .get(&kind)
            .ok_or_else(|| Error::config(format!("unknown handler type '{}'", kind)))?
            .clone();
        let instance = builder(&extra, self)?;
        self.handler_cache
            .lock()
            .insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

pub(crate) fn component_extra<'a>(component: &'a NamedComponent) -> &'a serde_yaml::Value {
    &component.extra
}

#[allow(dead_code)]
pub(crate) type BoxedConnector = BoxConnector;
#[allow(dead_code)]
pub(crate) type BoxedHandler = BoxHandler;
