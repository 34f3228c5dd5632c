//! Whitelist filtering.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::route::ServiceInstance;

/// Which stacks a lookup may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Every stack.
    NoFilter,
    /// Only whitelisted stacks.
    WhitelistOnly,
    /// Only stacks that are not whitelisted.
    NonWhitelist,
}

impl FilterMode {
    /// Whether a stack with the given whitelist status passes this filter.
    pub fn admits(self, whitelisted: bool) -> bool {
        match self {
            Self::NoFilter => true,
            Self::WhitelistOnly => whitelisted,
            Self::NonWhitelist => !whitelisted,
        }
    }
}

/// Stack-path prefixes approved for production traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Whitelist {
    prefixes: BTreeSet<String>,
}

impl Whitelist {
    /// Build a whitelist from prefixes such as `/DC1/R1`.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| {
                    let p: String = p.into();
                    format!("/{}", p.trim_matches('/'))
                })
                .filter(|p| p.len() > 1)
                .collect(),
        }
    }

    /// Whether `stack_only` (a `/dc/region/zone` path) falls under any prefix.
    ///
    /// Prefixes match on whole segments: `/DC1/R1` covers `/DC1/R1/Zone1`
    /// but not `/DC1/R10/Zone1`.
    pub fn matches(&self, stack_only: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            stack_only == prefix
                || (stack_only.starts_with(prefix.as_str())
                    && stack_only.as_bytes().get(prefix.len()) == Some(&b'/'))
        })
    }

    /// The configured prefixes.
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }

    /// Whether the whitelist is empty.
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl From<Vec<String>> for Whitelist {
    fn from(prefixes: Vec<String>) -> Self {
        Self::new(prefixes)
    }
}

impl From<Whitelist> for Vec<String> {
    fn from(whitelist: Whitelist) -> Self {
        whitelist.prefixes.into_iter().collect()
    }
}

/// Keep the instances whose owning stack passes `mode`.
pub fn filter_instances<F>(
    instances: Vec<ServiceInstance>,
    mode: FilterMode,
    is_whitelisted: F,
) -> Vec<ServiceInstance>
where
    F: Fn(&str) -> bool,
{
    if mode == FilterMode::NoFilter {
        return instances;
    }
    instances
        .into_iter()
        .filter(|instance| mode.admits(is_whitelisted(&instance.stack.stack_only())))
        .collect()
}
