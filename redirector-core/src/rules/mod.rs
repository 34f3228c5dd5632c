//! Rule model boundary.
//!
//! Rule compilation lives outside the core. The engine only sees an opaque
//! [`RuleModel`] that turns a request [`Context`] into a [`Decision`], plus an
//! optional [`UrlRuleModel`] that supplies URL parameters.

pub mod static_model;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::domain::route::UrlParams;
use crate::provider::FilterMode;

pub use static_model::{PathRule, RuleTarget, StaticRuleModel, UrlRule};

/// Name reserved for the default server.
pub const DEFAULT_SERVER_NAME: &str = "default";

/// Placeholder for the selected host's address.
pub const HOST_PLACEHOLDER: &str = "{host}";

/// Template used when a server does not supply one.
pub const DEFAULT_URL_TEMPLATE: &str = "{protocol}://{host}:{port}/{urn}";

fn default_url_template() -> String {
    DEFAULT_URL_TEMPLATE.to_string()
}

/// A named routing target.
///
/// Either a templated URL resolved against hosts under `path`, or an advanced
/// literal URL with no host placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Server name, reported as the matched rule.
    pub name: String,
    /// URL template or literal URL.
    #[serde(default = "default_url_template")]
    pub url: String,
    /// Flavor name, or a `/dc/region/zone` stack path.
    #[serde(default)]
    pub path: String,
    /// Route to stacks outside the whitelist instead of inside it.
    #[serde(default)]
    pub non_whitelisted: bool,
    /// Extra query parameters appended to the final URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
}

impl Server {
    /// A templated server resolved against `path`.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: default_url_template(),
            path: path.into(),
            non_whitelisted: false,
            query: BTreeMap::new(),
        }
    }

    /// A server with a literal URL.
    pub fn advanced(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            path: String::new(),
            non_whitelisted: false,
            query: BTreeMap::new(),
        }
    }

    /// Mark the server as targeting non-whitelisted stacks.
    pub fn non_whitelisted(mut self) -> Self {
        self.non_whitelisted = true;
        self
    }

    /// Whether the URL is literal and needs no host.
    pub fn is_advanced(&self) -> bool {
        !self.url.contains(HOST_PLACEHOLDER)
    }

    /// Whether the URL has placeholders to substitute.
    pub fn needs_substitution(&self) -> bool {
        self.url.contains('{')
    }

    /// Whether this is the default server.
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_SERVER_NAME
    }

    /// Filter used when resolving this server's hosts.
    pub fn filter_mode(&self) -> FilterMode {
        if self.non_whitelisted {
            FilterMode::NonWhitelist
        } else {
            FilterMode::WhitelistOnly
        }
    }
}

/// Several candidate servers returned by one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    /// Candidates, resolved independently.
    pub servers: Vec<Server>,
    /// Whether clients may use private addresses for this group.
    #[serde(default)]
    pub enable_private: bool,
}

/// The kind of rule that produced a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    /// A flavor rule matched on request parameters.
    Path,
    /// A percentage distribution rule.
    Distribution,
    /// The default server.
    Default,
}

impl ReturnKind {
    /// Whether an unresolvable result may retry against the default server.
    pub fn allows_fallback(self) -> bool {
        self != Self::Default
    }

    /// Whether the rule name is appended to the URL for tracking.
    pub fn is_tracked(self) -> bool {
        self == Self::Path
    }
}

/// Terminal outcome of evaluating a rule model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A single server.
    Server {
        /// The matched server.
        server: Server,
        /// Kind of rule that matched.
        kind: ReturnKind,
        /// Name of the matched rule.
        rule_name: String,
    },
    /// Several servers, each resolved independently.
    Group {
        /// The candidates.
        group: ServerGroup,
        /// Name of the matched rule.
        rule_name: String,
    },
}

/// One weighted share of a distribution rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionEntry {
    /// Target server.
    pub server: Server,
    /// Share of traffic, in percent.
    pub percent: f64,
}

/// Evaluates flavor rules against a request context.
pub trait RuleModel: Send + Sync {
    /// Match `context`. `None` when no rule, distribution or default applies.
    fn evaluate(&self, context: &Context) -> Option<Decision>;

    /// Whether the model is ready to evaluate.
    fn is_available(&self) -> bool;

    /// The terminal fallback server.
    fn default_server(&self) -> Option<&Server>;

    /// Servers of the distribution rule with their percentages.
    fn distribution(&self) -> &[DistributionEntry];
}

/// Supplies URL parameters for a request context.
pub trait UrlRuleModel: Send + Sync {
    /// Parameters for `context`. Unset fields fall back to configured defaults.
    fn evaluate(&self, context: &Context) -> UrlParams;

    /// Whether the model is ready to evaluate.
    fn is_available(&self) -> bool {
        true
    }
}
