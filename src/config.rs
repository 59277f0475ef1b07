//! Configuration schema.
//!
//! A config file is a flat `listeners` / `handlers` / `connectors` tree.
//! Handlers and connectors are named instances of a `type`; the
//! type-specific fields live in an untyped YAML mapping (`extra`) that
//! each builder in [`crate::registry`] decodes for itself, the same
//! "parse the envelope, let the leaf decode its own body" split the
//! teacher uses for its outbound proxy table.

use crate::common::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// One `listeners[]` entry: where to accept connections, and which
/// named handler and connector service them.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub bind: String,
    pub handler: String,
    #[serde(default)]
    pub connector: Option<String>,
}

/// A named `handlers[]` or `connectors[]` entry: a `type` discriminator
/// plus whatever fields that type needs, kept as raw YAML until the
/// matching builder is invoked.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedComponent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: serde_yaml::Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub handlers: HashMap<String, NamedComponent>,
    #[serde(default)]
    pub connectors: HashMap<String, NamedComponent>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("reading {}: {}", path.as_ref().display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(Error::config("config has no listeners"));
        }
        for l in &self.listeners {
            if l.handler != "direct"
                && l.handler != "socks5"
                && !self.handlers.contains_key(&l.handler)
                && !is_builtin_handler(&l.handler)
            {
                return Err(Error::config(format!(
                    "listener {} references unknown handler '{}'",
                    l.bind, l.handler
                )));
            }
            if let Some(c) = &l.connector {
                if !self.connectors.contains_key(c) && c != "system" {
                    return Err(Error::config(format!(
                        "listener {} references unknown connector '{}'",
                        l.bind, c
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_builtin_handler(name: &str) -> bool {
    matches!(name, "echo" | "null" | "random" | "zero" | "socks5")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let yaml = r#"
listeners:
  - bind: "127.0.0.1:1080"
    handler: socks5
    connector: system
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.listeners.len(), 1);
        assert_eq!(cfg.listeners[0].handler, "socks5");
    }

    #[test]
    fn test_parse_named_components() {
        let yaml = r#"
listeners:
  - bind: "0.0.0.0:8388"
    handler: ss-server
connectors:
  ss-client:
    type: shadowsocks
    server: "1.2.3.4:8388"
    method: "2022-blake3-aes-256-gcm"
    password: "base64key=="
handlers:
  ss-server:
    type: shadowsocks
    method: "2022-blake3-aes-256-gcm"
    password: "base64key=="
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.connectors.get("ss-client").unwrap().kind, "shadowsocks");
    }

    #[test]
    fn test_rejects_empty_listeners() {
        let err = Config::parse("listeners: []").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_handler() {
        let yaml = r#"
listeners:
  - bind: "127.0.0.1:1080"
    handler: nonexistent
"#;
        assert!(Config::parse(yaml).is_err());
    }
}
