//! The redirect engine.
//!
//! Composes a [`RuleModel`] with a [`Balancer`]: the model picks a server, the
//! balancer picks a host under that server's path, and the URL template is
//! filled in. A non-default server that resolves to no host falls back to the
//! default server exactly once.

pub mod template;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RedirectorConfig;
use crate::context::Context;
use crate::domain::route::{IpProtocolVersion, ResolvedUrlParams, RouteResult, UrlParams};
use crate::error::Result;
use crate::load_balancer::{Balancer, LookupMode};
use crate::manager::ServiceProviderManager;
use crate::provider::FilterMode;
use crate::rules::{
    Decision, ReturnKind, RuleModel, Server, ServerGroup, UrlRuleModel, DEFAULT_SERVER_NAME,
};
use crate::session::SessionLog;

enum Resolution {
    Resolved(RouteResult),
    /// No candidate host; eligible for fallback.
    NoHosts,
    /// Bad URL parameters; the request fails outright.
    Rejected,
}

/// Records steps for a test-mode session and does nothing otherwise.
struct Trace<'a> {
    sessions: &'a SessionLog,
    session: Option<&'a str>,
}

impl Trace<'_> {
    fn note(&self, message: impl FnOnce() -> String) {
        if let Some(session) = self.session {
            self.sessions.record(session, message());
        }
    }
}

/// Routes requests for one application.
pub struct RedirectorEngine {
    model: Arc<dyn RuleModel>,
    url_model: Option<Arc<dyn UrlRuleModel>>,
    balancer: Balancer,
    url_defaults: UrlParams,
    min_hosts: usize,
    sessions: Arc<SessionLog>,
}

impl RedirectorEngine {
    /// Create an engine for `app` over `manager`.
    pub fn new(
        app: impl Into<String>,
        manager: Arc<ServiceProviderManager>,
        model: Arc<dyn RuleModel>,
        config: &RedirectorConfig,
    ) -> Self {
        Self {
            model,
            url_model: None,
            balancer: Balancer::new(manager, app, config.whitelist.clone(), config.selection),
            url_defaults: config.url_defaults.clone(),
            min_hosts: config.min_hosts,
            sessions: Arc::new(SessionLog::new()),
        }
    }

    /// Use `url_model` for URL parameters.
    pub fn with_url_model(mut self, url_model: Arc<dyn UrlRuleModel>) -> Self {
        self.url_model = Some(url_model);
        self
    }

    /// Record test-mode sessions into `sessions`.
    pub fn with_session_log(mut self, sessions: Arc<SessionLog>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Application this engine routes.
    pub fn app(&self) -> &str {
        self.balancer.app()
    }

    /// The balancer, e.g. for whitelist updates.
    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    /// The session log test-mode requests write to.
    pub fn sessions(&self) -> &Arc<SessionLog> {
        &self.sessions
    }

    /// Route one request. `None` when nothing resolves.
    pub fn redirect(&self, context: &Context) -> Option<RouteResult> {
        let trace = self.trace(context);
        if !self.model.is_available() {
            warn!(app = %self.app(), "rule model unavailable");
            trace.note(|| "rule model unavailable".to_string());
            return None;
        }

        let result = match self.model.evaluate(context) {
            Some(Decision::Server {
                server,
                kind,
                rule_name,
            }) => {
                trace.note(|| {
                    format!(
                        "matched {kind:?} rule {rule_name}: server {} path {:?}",
                        server.name, server.path
                    )
                });
                self.resolve_with_fallback(&server, kind, &rule_name, context, &trace)
            }
            Some(Decision::Group { group, rule_name }) => {
                trace.note(|| {
                    format!("matched group rule {rule_name} with {} servers", group.servers.len())
                });
                match self.first_in_group(&group, &rule_name, context, &trace) {
                    Some(route) => Some(route),
                    None => self.fallback_to_default(context, &trace),
                }
            }
            None => {
                trace.note(|| "no rule matched".to_string());
                None
            }
        };

        match &result {
            Some(route) => {
                debug!(app = %self.app(), rule = %route.rule_name, url = %route.url, fallback = route.fallback, "redirect");
                trace.note(|| format!("redirect to {}", route.url));
            }
            None => {
                debug!(app = %self.app(), "no route");
                trace.note(|| "no route".to_string());
            }
        }
        result
    }

    /// Resolve each server of `group` independently, dropping the ones that
    /// do not resolve. Surviving servers carry their final URL.
    pub fn redirect_server_group(&self, group: &ServerGroup, context: &Context) -> ServerGroup {
        let trace = self.trace(context);
        let servers = self
            .resolve_group(group, context, &trace)
            .into_iter()
            .map(|(server, route)| Server {
                url: route.url,
                query: BTreeMap::new(),
                ..server.clone()
            })
            .collect();
        ServerGroup {
            servers,
            enable_private: group.enable_private,
        }
    }

    /// Distinct whitelisted hosts behind the default server.
    pub fn get_count_of_hosts_for_default_server(&self) -> usize {
        self.model
            .default_server()
            .map(|server| self.host_count(server, FilterMode::WhitelistOnly))
            .unwrap_or(0)
    }

    /// Distinct hosts behind every distribution server, summed.
    pub fn get_count_of_hosts_for_distribution(&self) -> usize {
        self.model
            .distribution()
            .iter()
            .map(|entry| self.host_count(&entry.server, entry.server.filter_mode()))
            .sum()
    }

    /// How far the default server's host density falls short of the
    /// distribution's, as a whole percentage. Never negative.
    pub fn get_percent_deviation_count_of_hosts_for_distribution(&self) -> u32 {
        let shares: Vec<(f64, usize)> = self
            .model
            .distribution()
            .iter()
            .map(|entry| (entry.percent, self.host_count(&entry.server, entry.server.filter_mode())))
            .collect();
        percent_deviation(&shares, self.get_count_of_hosts_for_default_server())
    }

    /// Whether `server` currently resolves to at least the configured minimum
    /// number of hosts. Literal URLs always pass.
    pub fn validate_server(&self, server: &Server) -> bool {
        server.is_advanced() || self.host_count(server, server.filter_mode()) >= self.min_hosts
    }

    fn trace<'a>(&'a self, context: &'a Context) -> Trace<'a> {
        Trace {
            sessions: &self.sessions,
            session: context.diagnostic_session(),
        }
    }

    fn host_count(&self, server: &Server, filter: FilterMode) -> usize {
        if server.is_advanced() {
            return 0;
        }
        self.balancer
            .get_count_of_hosts_for_path(&server.path, LookupMode::live(filter))
    }

    fn resolve_with_fallback(
        &self,
        server: &Server,
        kind: ReturnKind,
        rule_name: &str,
        context: &Context,
        trace: &Trace<'_>,
    ) -> Option<RouteResult> {
        match self.resolve(server, kind, rule_name, server.filter_mode(), context, trace) {
            Resolution::Resolved(route) => Some(route),
            Resolution::Rejected => None,
            Resolution::NoHosts
                if kind.allows_fallback() && !server.is_default() && rule_name != DEFAULT_SERVER_NAME =>
            {
                self.fallback_to_default(context, trace)
            }
            Resolution::NoHosts => None,
        }
    }

    fn fallback_to_default(&self, context: &Context, trace: &Trace<'_>) -> Option<RouteResult> {
        let Some(default) = self.model.default_server() else {
            trace.note(|| "no default server to fall back to".to_string());
            return None;
        };
        trace.note(|| format!("falling back to default server path {:?}", default.path));
        match self.resolve(
            default,
            ReturnKind::Default,
            &default.name,
            FilterMode::WhitelistOnly,
            context,
            trace,
        ) {
            Resolution::Resolved(mut route) => {
                route.fallback = true;
                Some(route)
            }
            Resolution::NoHosts | Resolution::Rejected => None,
        }
    }

    /// Resolve group members in order, stopping at the first that resolves.
    fn first_in_group(
        &self,
        group: &ServerGroup,
        rule_name: &str,
        context: &Context,
        trace: &Trace<'_>,
    ) -> Option<RouteResult> {
        group
            .servers
            .iter()
            .find_map(|server| self.resolve_member(server, rule_name, context, trace))
    }

    fn resolve_group<'g>(
        &self,
        group: &'g ServerGroup,
        context: &Context,
        trace: &Trace<'_>,
    ) -> Vec<(&'g Server, RouteResult)> {
        group
            .servers
            .iter()
            .filter_map(|server| {
                self.resolve_member(server, &server.name, context, trace)
                    .map(|route| (server, route))
            })
            .collect()
    }

    fn resolve_member(
        &self,
        server: &Server,
        rule_name: &str,
        context: &Context,
        trace: &Trace<'_>,
    ) -> Option<RouteResult> {
        match self.resolve(server, ReturnKind::Path, rule_name, server.filter_mode(), context, trace) {
            Resolution::Resolved(route) => Some(route),
            Resolution::NoHosts | Resolution::Rejected => {
                trace.note(|| format!("group server {} pruned", server.name));
                None
            }
        }
    }

    fn resolve(
        &self,
        server: &Server,
        kind: ReturnKind,
        rule_name: &str,
        filter: FilterMode,
        context: &Context,
        trace: &Trace<'_>,
    ) -> Resolution {
        let instance = if server.is_advanced() {
            None
        } else {
            match self.balancer.get_service_instance(server, LookupMode::live(filter)) {
                Some(instance) => {
                    trace.note(|| {
                        format!("balancer selected {} in {}", instance.host.ipv4, instance.stack)
                    });
                    Some(instance)
                }
                None => {
                    trace.note(|| format!("no {filter:?} hosts for path {:?}", server.path));
                    return Resolution::NoHosts;
                }
            }
        };

        let params = if server.needs_substitution() {
            match self.url_params(context) {
                Ok(params) => Some(params),
                Err(e) => {
                    warn!(server = %server.name, error = %e, "url parameters rejected");
                    trace.note(|| format!("url parameters rejected: {e}"));
                    return Resolution::Rejected;
                }
            }
        } else {
            None
        };

        let (rendered, ip_version) = match (&instance, &params) {
            (Some(instance), Some(params)) => template::render(&server.url, &instance.host, params),
            (None, Some(params)) => (template::render_literal(&server.url, params), IpProtocolVersion::V4),
            _ => (server.url.clone(), IpProtocolVersion::V4),
        };

        let mut query: Vec<(&str, &str)> = server
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if kind.is_tracked() {
            query.push((template::RULE_QUERY_PARAM, rule_name));
        }
        let url = template::append_query(&rendered, query);
        if let Err(e) = template::ensure_valid(&url) {
            warn!(server = %server.name, error = %e, "built url rejected");
            trace.note(|| format!("built url rejected: {e}"));
            return Resolution::Rejected;
        }

        Resolution::Resolved(RouteResult {
            url,
            rule_name: rule_name.to_string(),
            flavor: instance.as_ref().map(|i| i.stack.flavor().to_string()),
            stack: instance.as_ref().map(|i| i.stack.clone()),
            ip_version,
            host: instance.map(|i| i.host),
            fallback: false,
        })
    }

    fn url_params(&self, context: &Context) -> Result<ResolvedUrlParams> {
        let requested = match &self.url_model {
            Some(model) if model.is_available() => model.evaluate(context),
            _ => UrlParams::default(),
        };
        requested.or(&self.url_defaults).validate()
    }
}

/// Percentage by which the default server's per-percent host density falls
/// short of the distribution's.
///
/// `shares` holds `(percent, hosts)` per distribution server. Any zero
/// denominator yields 0, and so does a default server at least as dense as
/// the distribution.
pub fn percent_deviation(shares: &[(f64, usize)], default_hosts: usize) -> u32 {
    let total_percent: f64 = shares
        .iter()
        .map(|(percent, _)| percent.max(0.0))
        .filter(|p| p.is_finite())
        .sum();
    if total_percent <= 0.0 {
        return 0;
    }
    let default_percent = 100.0 - total_percent;
    if default_percent <= 0.0 {
        return 0;
    }

    let distribution_hosts: usize = shares.iter().map(|(_, hosts)| hosts).sum();
    let expected = distribution_hosts as f64 / total_percent;
    if expected <= 0.0 {
        return 0;
    }
    let actual = default_hosts as f64 / default_percent;

    let deviation = ((expected - actual) / expected * 100.0).round();
    if deviation.is_finite() && deviation > 0.0 {
        deviation as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SESSION_ID, TEST_INFO};
    use crate::domain::host::{HostInstance, StackSeed};
    use crate::domain::stack::StackPath;
    use crate::provider::Whitelist;
    use crate::rules::{DistributionEntry, StaticRuleModel};
    use proptest::prelude::*;

    fn seed(path: &str, hosts: Vec<HostInstance>) -> StackSeed {
        StackSeed::new(StackPath::parse(path).unwrap(), hosts)
    }

    fn manager() -> Arc<ServiceProviderManager> {
        ServiceProviderManager::fixed(vec![
            seed(
                "/DC1/R1/Zone1/app",
                vec![HostInstance::new("10.0.0.1", 1), HostInstance::new("10.0.0.2", 1)],
            ),
            seed("/DC2/R1/Zone1/app", vec![HostInstance::new("10.0.1.1", 1)]),
            seed(
                "/DC1/R1/Zone2/app",
                vec![HostInstance::new("10.0.2.1", 1).with_ipv6("fe80::2")],
            ),
            seed("/DC2/R1/Zone3/app", vec![HostInstance::new("10.0.3.1", 1)]),
        ])
    }

    fn model() -> StaticRuleModel {
        StaticRuleModel::from_json(
            r#"{
                "rules": [
                    {"name": "stbRule", "conditions": {"deviceType": "stb"},
                     "target": {"server": {"name": "stb", "path": "Zone1", "query": {"src": "x1"}}}},
                    {"name": "emptyRule", "conditions": {"deviceType": "empty"},
                     "target": {"server": {"name": "empty", "path": "Zone9"}}},
                    {"name": "nwRule", "conditions": {"deviceType": "nw"},
                     "target": {"server": {"name": "nw", "path": "Zone1", "non_whitelisted": true}}},
                    {"name": "stackRule", "conditions": {"deviceType": "stack"},
                     "target": {"server": {"name": "stack", "path": "/DC1/R1/Zone2"}}},
                    {"name": "literalRule", "conditions": {"deviceType": "literal"},
                     "target": {"server": {"name": "literal", "url": "http://static.example.com/app"}}},
                    {"name": "groupRule", "conditions": {"deviceType": "tv"},
                     "target": {"group": {"servers": [
                        {"name": "g1", "path": "Zone9"},
                        {"name": "g2", "path": "Zone2"},
                        {"name": "g3", "path": "Zone1"}
                     ]}}}
                ],
                "default_server": {"name": "default", "path": "Zone2"}
            }"#,
        )
        .unwrap()
    }

    fn config() -> RedirectorConfig {
        RedirectorConfig {
            whitelist: Whitelist::new(["/DC1"]),
            ..RedirectorConfig::default()
        }
    }

    fn engine_with(model: StaticRuleModel) -> RedirectorEngine {
        RedirectorEngine::new("app", manager(), Arc::new(model), &config())
    }

    fn engine() -> RedirectorEngine {
        engine_with(model())
    }

    fn device(kind: &str) -> Context {
        Context::new().with("deviceType", kind)
    }

    #[test]
    fn test_path_rule_resolves_whitelisted_host() {
        let route = engine().redirect(&device("stb")).unwrap();
        assert!(
            route.url == "http://10.0.0.1:80/?src=x1&rule=stbRule"
                || route.url == "http://10.0.0.2:80/?src=x1&rule=stbRule",
            "{}",
            route.url
        );
        assert_eq!(route.rule_name, "stbRule");
        assert_eq!(route.flavor.as_deref(), Some("Zone1"));
        assert_eq!(route.stack.unwrap().datacenter(), "DC1");
        assert!(!route.fallback);
    }

    #[test]
    fn test_default_rule_is_not_tracked() {
        let route = engine().redirect(&Context::new()).unwrap();
        assert_eq!(route.url, "http://10.0.2.1:80/");
        assert_eq!(route.rule_name, "default");
        assert!(!route.fallback);
    }

    #[test]
    fn test_unresolvable_rule_falls_back_to_default() {
        let route = engine().redirect(&device("empty")).unwrap();
        assert_eq!(route.url, "http://10.0.2.1:80/");
        assert_eq!(route.rule_name, "default");
        assert!(route.fallback);
    }

    #[test]
    fn test_default_never_falls_back_further() {
        let mut model = model();
        model.default_server = Some(Server::new("default", "Zone9"));
        let engine = engine_with(model);
        assert!(engine.redirect(&Context::new()).is_none());
        assert!(engine.redirect(&device("empty")).is_none());
    }

    #[test]
    fn test_rule_named_default_never_falls_back() {
        let model = StaticRuleModel::from_json(
            r#"{
                "rules": [{"name": "default", "target": {"server": {"name": "x", "path": "Zone9"}}}],
                "default_server": {"name": "default", "path": "Zone2"}
            }"#,
        )
        .unwrap();
        assert!(engine_with(model).redirect(&Context::new()).is_none());
    }

    #[test]
    fn test_distribution_falls_back() {
        let mut model = model();
        model.distribution = vec![DistributionEntry {
            server: Server::new("dist", "Zone9"),
            percent: 100.0,
        }];
        let route = engine_with(model).redirect(&Context::new()).unwrap();
        assert!(route.fallback);
        assert_eq!(route.rule_name, "default");
    }

    #[test]
    fn test_non_whitelisted_server() {
        let route = engine().redirect(&device("nw")).unwrap();
        assert_eq!(route.url, "http://10.0.1.1:80/?rule=nwRule");
    }

    #[test]
    fn test_stack_path_server() {
        let route = engine().redirect(&device("stack")).unwrap();
        assert_eq!(route.url, "http://10.0.2.1:80/?rule=stackRule");
    }

    #[test]
    fn test_literal_server_passes_through() {
        let route = engine().redirect(&device("literal")).unwrap();
        assert_eq!(route.url, "http://static.example.com/app?rule=literalRule");
        assert!(route.host.is_none());
    }

    #[test]
    fn test_ipv6_from_url_model() {
        let mut model = model();
        model.url_rules = vec![crate::rules::static_model::UrlRule {
            conditions: [("ipv6".to_string(), "yes".to_string())].into_iter().collect(),
            params: UrlParams {
                protocol: Some("xre".into()),
                port: Some(10001),
                urn: None,
                ip_protocol_version: Some(6),
            },
        }];
        let model = Arc::new(model);
        let engine = RedirectorEngine::new("app", manager(), model.clone(), &config())
            .with_url_model(model);
        let route = engine.redirect(&Context::new().with("ipv6", "yes")).unwrap();
        assert_eq!(route.url, "xre://[fe80::2]:10001/");
        assert_eq!(route.ip_version, IpProtocolVersion::V6);
    }

    #[test]
    fn test_invalid_url_params_fail_without_fallback() {
        let mut model = model();
        model.url_rules = vec![crate::rules::static_model::UrlRule {
            conditions: [("deviceType".to_string(), "stb".to_string())].into_iter().collect(),
            params: UrlParams {
                protocol: Some("bad protocol".into()),
                ..UrlParams::default()
            },
        }];
        let model = Arc::new(model);
        let engine = RedirectorEngine::new("app", manager(), model.clone(), &config())
            .with_url_model(model);
        assert!(engine.redirect(&device("stb")).is_none());
    }

    #[test]
    fn test_group_rule_uses_first_resolvable_server() {
        let route = engine().redirect(&device("tv")).unwrap();
        assert_eq!(route.url, "http://10.0.2.1:80/?rule=groupRule");
        assert_eq!(route.rule_name, "groupRule");
    }

    #[test]
    fn test_group_rule_rotates_first_member_hosts() {
        let model = StaticRuleModel::from_json(
            r#"{
                "rules": [{"name": "pair", "target": {"group": {"servers": [
                    {"name": "z1", "path": "Zone1"},
                    {"name": "z2", "path": "Zone2"}
                ]}}}],
                "default_server": {"name": "default", "path": "Zone2"}
            }"#,
        )
        .unwrap();
        let engine = engine_with(model);
        let hosts: std::collections::HashSet<_> = (0..20)
            .map(|_| engine.redirect(&Context::new()).unwrap().host.unwrap().ipv4)
            .collect();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains("10.0.0.1") && hosts.contains("10.0.0.2"));
    }

    #[test]
    fn test_alternating_rules_rotate_each_pool() {
        let engine = engine();
        let mut hosts = std::collections::HashSet::new();
        for _ in 0..20 {
            hosts.insert(engine.redirect(&device("stb")).unwrap().host.unwrap().ipv4);
            engine.redirect(&Context::new()).unwrap();
        }
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn test_redirect_server_group_prunes() {
        let group = ServerGroup {
            servers: vec![
                Server::new("g1", "Zone9"),
                Server::new("g2", "Zone2"),
                Server::advanced("g3", "http://static.example.com/"),
            ],
            enable_private: true,
        };
        let resolved = engine().redirect_server_group(&group, &Context::new());
        let names: Vec<_> = resolved.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["g2", "g3"]);
        assert_eq!(resolved.servers[0].url, "http://10.0.2.1:80/?rule=g2");
        assert!(resolved.enable_private);
    }

    #[test]
    fn test_unavailable_model_routes_nothing() {
        let engine = engine_with(StaticRuleModel::default());
        assert!(engine.redirect(&device("stb")).is_none());
    }

    #[test]
    fn test_session_log_only_in_test_mode() {
        let engine = engine();
        engine.redirect(&device("empty").with(SESSION_ID, "s1"));
        assert!(engine.sessions().poll("s1").is_empty());

        engine.redirect(&device("empty").with(SESSION_ID, "s1").with(TEST_INFO, "true"));
        let messages: Vec<_> = engine
            .sessions()
            .poll("s1")
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(messages.iter().any(|m| m.contains("emptyRule")));
        assert!(messages.iter().any(|m| m.contains("falling back")));
        assert!(messages.last().unwrap().starts_with("redirect to"));
    }

    #[test]
    fn test_capacity_queries() {
        let mut model = model();
        model.distribution = vec![
            DistributionEntry {
                server: Server::new("d1", "Zone1"),
                percent: 20.0,
            },
            DistributionEntry {
                server: Server::new("d2", "Zone3").non_whitelisted(),
                percent: 30.0,
            },
        ];
        let engine = engine_with(model);
        assert_eq!(engine.get_count_of_hosts_for_default_server(), 1);
        assert_eq!(engine.get_count_of_hosts_for_distribution(), 3);
        // expected 3/50, actual 1/50
        assert_eq!(engine.get_percent_deviation_count_of_hosts_for_distribution(), 67);
    }

    #[test]
    fn test_validate_server_threshold() {
        let engine = engine();
        assert!(engine.validate_server(&Server::new("ok", "Zone1")));
        assert!(!engine.validate_server(&Server::new("missing", "Zone9")));
        assert!(engine.validate_server(&Server::advanced("literal", "http://example.com/")));
    }

    #[test]
    fn test_percent_deviation_edges() {
        assert_eq!(percent_deviation(&[], 5), 0);
        assert_eq!(percent_deviation(&[(0.0, 4)], 5), 0);
        assert_eq!(percent_deviation(&[(100.0, 4)], 0), 0);
        assert_eq!(percent_deviation(&[(50.0, 0)], 5), 0);
        assert_eq!(percent_deviation(&[(50.0, 10)], 0), 100);
        assert_eq!(percent_deviation(&[(50.0, 10)], 20), 0);
    }

    proptest! {
        #[test]
        fn prop_deviation_never_negative_and_bounded(
            shares in prop::collection::vec((0.0f64..60.0, 0usize..50), 0..4),
            default_hosts in 0usize..100,
        ) {
            let deviation = percent_deviation(&shares, default_hosts);
            prop_assert!(deviation <= 100);
        }
    }
}
