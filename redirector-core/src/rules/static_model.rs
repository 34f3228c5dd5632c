//! A declarative rule model.
//!
//! Rules are checked in order; a rule matches when every condition equals the
//! context value of the same key. Without a match, the distribution rule
//! splits traffic by percentage and whatever is left goes to the default.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Decision, DistributionEntry, ReturnKind, RuleModel, Server, ServerGroup, UrlRuleModel};
use crate::context::Context;
use crate::domain::route::UrlParams;
use crate::error::{RedirectorError, Result};

/// What a path rule returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    /// One server.
    Server(Server),
    /// A group of servers.
    Group(ServerGroup),
}

/// A named rule matched on context equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    /// Rule name, reported in results and tracking parameters.
    pub name: String,
    /// Context key/value pairs that must all match.
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    /// What the rule returns.
    pub target: RuleTarget,
}

impl PathRule {
    fn matches(&self, context: &Context) -> bool {
        self.conditions
            .iter()
            .all(|(key, expected)| context.get(key) == Some(expected.as_str()))
    }
}

/// Rules, distribution and default server held in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticRuleModel {
    /// Path rules in evaluation order.
    #[serde(default)]
    pub rules: Vec<PathRule>,
    /// Distribution shares.
    #[serde(default)]
    pub distribution: Vec<DistributionEntry>,
    /// The default server.
    #[serde(default)]
    pub default_server: Option<Server>,
    /// URL parameter overrides keyed by the same kind of conditions.
    #[serde(default)]
    pub url_rules: Vec<UrlRule>,
}

/// URL parameters applied when every condition matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRule {
    /// Context key/value pairs that must all match.
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    /// Parameters to apply.
    pub params: UrlParams,
}

impl StaticRuleModel {
    /// Parse a JSON rule document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let model: Self =
            serde_json::from_str(raw).map_err(|e| RedirectorError::Config(e.to_string()))?;
        let total: f64 = model.distribution.iter().map(|d| d.percent).sum();
        if model.distribution.iter().any(|d| !(0.0..=100.0).contains(&d.percent)) || total > 100.0 {
            return Err(RedirectorError::Config(format!(
                "distribution percentages must be within 0..=100, total {total}"
            )));
        }
        Ok(model)
    }

    fn pick_distribution(&self) -> Option<&DistributionEntry> {
        if self.distribution.is_empty() {
            return None;
        }
        let roll: f64 = rand::thread_rng().gen_range(0.0..100.0);
        let mut cumulative = 0.0;
        self.distribution.iter().find(|entry| {
            cumulative += entry.percent;
            roll < cumulative
        })
    }
}

impl RuleModel for StaticRuleModel {
    fn evaluate(&self, context: &Context) -> Option<Decision> {
        if let Some(rule) = self.rules.iter().find(|r| r.matches(context)) {
            let rule_name = rule.name.clone();
            return Some(match &rule.target {
                RuleTarget::Server(server) => Decision::Server {
                    server: server.clone(),
                    kind: ReturnKind::Path,
                    rule_name,
                },
                RuleTarget::Group(group) => Decision::Group {
                    group: group.clone(),
                    rule_name,
                },
            });
        }

        if let Some(entry) = self.pick_distribution() {
            return Some(Decision::Server {
                server: entry.server.clone(),
                kind: ReturnKind::Distribution,
                rule_name: entry.server.name.clone(),
            });
        }

        self.default_server.as_ref().map(|server| Decision::Server {
            server: server.clone(),
            kind: ReturnKind::Default,
            rule_name: server.name.clone(),
        })
    }

    fn is_available(&self) -> bool {
        self.default_server.is_some()
    }

    fn default_server(&self) -> Option<&Server> {
        self.default_server.as_ref()
    }

    fn distribution(&self) -> &[DistributionEntry] {
        &self.distribution
    }
}

impl UrlRuleModel for StaticRuleModel {
    fn evaluate(&self, context: &Context) -> UrlParams {
        self.url_rules
            .iter()
            .find(|rule| {
                rule.conditions
                    .iter()
                    .all(|(key, expected)| context.get(key) == Some(expected.as_str()))
            })
            .map(|rule| rule.params.clone())
            .unwrap_or_default()
    }

    fn is_available(&self) -> bool {
        !self.url_rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> StaticRuleModel {
        StaticRuleModel::from_json(
            r#"{
                "rules": [
                    {"name": "stbRule", "conditions": {"deviceType": "stb"},
                     "target": {"server": {"name": "stb", "path": "Zone1"}}},
                    {"name": "groupRule", "conditions": {"deviceType": "tv"},
                     "target": {"group": {"servers": [{"name": "a", "path": "Zone1"}]}}}
                ],
                "default_server": {"name": "default", "path": "Zone2"},
                "url_rules": [{"conditions": {"deviceType": "stb"}, "params": {"port": 10001}}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_path_rule_match() {
        let ctx = Context::new().with("deviceType", "stb");
        match RuleModel::evaluate(&model(), &ctx).unwrap() {
            Decision::Server { server, kind, rule_name } => {
                assert_eq!(server.path, "Zone1");
                assert_eq!(kind, ReturnKind::Path);
                assert_eq!(rule_name, "stbRule");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_group_rule_match() {
        let ctx = Context::new().with("deviceType", "tv");
        assert!(matches!(
            RuleModel::evaluate(&model(), &ctx),
            Some(Decision::Group { .. })
        ));
    }

    #[test]
    fn test_default_when_nothing_matches() {
        match RuleModel::evaluate(&model(), &Context::new()).unwrap() {
            Decision::Server { kind, server, .. } => {
                assert_eq!(kind, ReturnKind::Default);
                assert!(server.is_default());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_full_distribution_always_wins() {
        let mut model = model();
        model.distribution = vec![DistributionEntry {
            server: Server::new("dist", "Zone3"),
            percent: 100.0,
        }];
        for _ in 0..20 {
            match RuleModel::evaluate(&model, &Context::new()).unwrap() {
                Decision::Server { kind, .. } => assert_eq!(kind, ReturnKind::Distribution),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_url_rules() {
        let ctx = Context::new().with("deviceType", "stb");
        assert_eq!(UrlRuleModel::evaluate(&model(), &ctx).port, Some(10001));
        assert_eq!(UrlRuleModel::evaluate(&model(), &Context::new()), UrlParams::default());
    }

    #[test]
    fn test_over_allocated_distribution_rejected() {
        let err = StaticRuleModel::from_json(
            r#"{"distribution": [
                {"server": {"name": "a", "path": "Z1"}, "percent": 60},
                {"server": {"name": "b", "path": "Z2"}, "percent": 50}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RedirectorError::Config(_)));
    }

    #[test]
    fn test_unavailable_without_default() {
        assert!(!RuleModel::is_available(&StaticRuleModel::default()));
    }
}
