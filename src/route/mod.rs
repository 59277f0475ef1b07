pub mod host_matcher;

use crate::common::{Endpoint, Error, Result};
use crate::registry::Registry;
use crate::stream::{BoxDatagram, BoxStream, Connector};
use async_trait::async_trait;
use host_matcher::{HostMatcher, HostRule};
use serde::Deserialize;
use std::sync::Arc;

pub(crate) fn register(registry: &mut Registry) {
    registry.register_connector(
        "route",
        Arc::new(|extra, reg| {
            let cfg: RouteConfig = serde_yaml::from_value(extra.clone())
                .map_err(|e| Error::config(format!("invalid route connector config: {}", e)))?;
            RouteConnector::build(cfg, reg).map(|c| Arc::new(c) as Arc<dyn Connector>)
        }),
    );
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RouteRuleConfig {
    #[serde(default)]
    host: Vec<String>,
    #[serde(rename = "host-suffix", default)]
    host_suffix: Vec<String>,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    connector: Option<String>,
    #[serde(default)]
    drop: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RouteConfig {
    rule: Vec<RouteRuleConfig>,
}

/// Picks a downstream connector by matching the target host against an
/// ordered list of rules, falling back to the rule marked `default`
/// (if any). IPv4 and IPv6 literal targets always go to the default;
/// host-based rules only ever apply to hostname targets, matching how
/// the route table is meant to select between, say, a direct dialer
/// for LAN addresses and a tunnel for everything named.
pub struct RouteConnector {
    matcher: HostMatcher,
    /// Pattern index (as returned by `matcher.matches`) to owning rule
    /// index — a rule can contribute more than one pattern (several
    /// `host`/`host-suffix` entries), so matches need mapping back.
    pattern_owners: Vec<usize>,
    rule_targets: Vec<RuleTarget>,
    default_target: Option<RuleTarget>,
}

#[derive(Clone)]
enum RuleTarget {
    Drop,
    Connector(Arc<dyn Connector>),
}

impl RouteConnector {
    fn build(cfg: RouteConfig, registry: &Registry) -> Result<Self> {
        let mut patterns = Vec::new();
        let mut pattern_owners = Vec::new();
        let mut rule_targets = Vec::with_capacity(cfg.rule.len());
        let mut default_target = None;

        for (idx, rule) in cfg.rule.iter().enumerate() {
            if rule.drop && rule.connector.is_some() {
                return Err(Error::config("route rule cannot set both 'drop' and 'connector'"));
            }
            let target = if rule.drop {
                RuleTarget::Drop
            } else {
                let name = rule
                    .connector
                    .as_deref()
                    .ok_or_else(|| Error::config("route rule needs a 'connector' unless 'drop' is set"))?;
                RuleTarget::Connector(registry.connector(name)?)
            };

            for host in &rule.host {
                patterns.push(HostRule::Exact(host.clone()));
                pattern_owners.push(idx);
            }
            for suffix in &rule.host_suffix {
                patterns.push(HostRule::Suffix(suffix.clone()));
                pattern_owners.push(idx);
            }

            if rule.default && default_target.is_none() {
                default_target = Some(target.clone());
            }
            rule_targets.push(target);
        }

        let matcher = HostMatcher::new(&patterns)
            .map_err(|e| Error::config(format!("invalid route rule pattern: {}", e)))?;

        Ok(Self {
            matcher,
            pattern_owners,
            rule_targets,
            default_target,
        })
    }

    fn resolve(&self, target: &Endpoint) -> Result<Option<&RuleTarget>> {
        let host = match target {
            Endpoint::V4(_, _) | Endpoint::V6(_, _) => return Ok(self.default_target.as_ref()),
            Endpoint::Host(h, _) => h,
        };
        match self.matcher.matches(host) {
            Some(pattern_idx) => Ok(Some(&self.rule_targets[self.pattern_owners[pattern_idx]])),
            None => Ok(self.default_target.as_ref()),
        }
    }
}

#[async_trait]
impl Connector for RouteConnector {
    async fn connect(&self, target: &Endpoint) -> Result<BoxStream> {
        match self.resolve(target)? {
            Some(RuleTarget::Connector(connector)) => connector.connect(target).await,
            Some(RuleTarget::Drop) => Err(Error::connection(format!("{} dropped by route rule", target))),
            None => Err(Error::connection(format!("{} has no matching route and no default", target))),
        }
    }

    async fn bind_udp(&self) -> Result<BoxDatagram> {
        Err(Error::unsupported("route connector does not support UDP"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> RouteConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parses_host_and_suffix_lists() {
        let cfg = parse(
            r#"
rule:
  - host: ["example.com", "example.org"]
    host-suffix: ["cdn.net"]
    connector: direct
"#,
        );
        assert_eq!(cfg.rule[0].host.len(), 2);
        assert_eq!(cfg.rule[0].host_suffix, vec!["cdn.net".to_string()]);
    }

    #[test]
    fn test_rejects_drop_with_connector() {
        let registry = Registry::new(crate::config::Config::default());
        let cfg = parse(
            r#"
rule:
  - host: ["example.com"]
    drop: true
    connector: direct
"#,
        );
        assert!(RouteConnector::build(cfg, &registry).is_err());
    }

    #[test]
    fn test_first_default_rule_wins() {
        let mut config = crate::config::Config::default();
        config.connectors.insert(
            "a".to_string(),
            crate::config::NamedComponent {
                kind: "system".to_string(),
                extra: serde_yaml::Value::Null,
            },
        );
        let registry = Registry::new(config);
        let cfg = parse(
            r#"
rule:
  - host: ["example.com"]
    default: true
    connector: a
  - drop: true
    default: true
"#,
        );
        let connector = RouteConnector::build(cfg, &registry).unwrap();
        assert!(matches!(connector.default_target, Some(RuleTarget::Connector(_))));
    }
}
