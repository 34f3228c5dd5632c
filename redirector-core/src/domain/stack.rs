//! Stack path models.
//!
//! A stack is a `/datacenter/region/zone` location. Appending an application
//! name yields a [`StackPath`], the unit that owns a set of hosts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RedirectorError, Result};

/// Identifies one deployment unit: `/datacenter/region/zone/app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StackPath {
    datacenter: String,
    region: String,
    zone: String,
    app: String,
}

impl StackPath {
    /// Build a stack path from its four segments.
    ///
    /// Empty segments and segments containing `/` are rejected.
    pub fn new(
        datacenter: impl Into<String>,
        region: impl Into<String>,
        zone: impl Into<String>,
        app: impl Into<String>,
    ) -> Result<Self> {
        let path = Self {
            datacenter: datacenter.into(),
            region: region.into(),
            zone: zone.into(),
            app: app.into(),
        };

        let valid = [&path.datacenter, &path.region, &path.zone, &path.app]
            .iter()
            .all(|s| !s.is_empty() && !s.contains('/'));
        if !valid {
            return Err(RedirectorError::InvalidStackPath(path.to_string()));
        }
        Ok(path)
    }

    /// Parse a `/dc/region/zone/app` string.
    pub fn parse(raw: &str) -> Result<Self> {
        let segments: Vec<&str> = raw.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            [dc, region, zone, app] => Self::new(*dc, *region, *zone, *app),
            _ => Err(RedirectorError::InvalidStackPath(raw.to_string())),
        }
    }

    /// Resolve a stack-only prefix (`/dc/region/zone`) for the given app.
    pub fn from_stack_and_app(stack: &str, app: &str) -> Result<Self> {
        let segments: Vec<&str> = stack.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            [dc, region, zone] => Self::new(*dc, *region, *zone, app),
            _ => Err(RedirectorError::InvalidStackPath(stack.to_string())),
        }
    }

    /// The datacenter segment.
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// The region segment.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The zone segment.
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// The application name.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// The flavor this stack serves. Flavors are named by the zone segment.
    pub fn flavor(&self) -> &str {
        &self.zone
    }

    /// The `/dc/region/zone` prefix without the application.
    pub fn stack_only(&self) -> String {
        format!("/{}/{}/{}", self.datacenter, self.region, self.zone)
    }

    /// The `(flavor, app)` grouping key of this stack.
    pub fn flavor_key(&self) -> FlavorKey {
        FlavorKey::new(self.flavor(), self.app())
    }
}

impl fmt::Display for StackPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            self.datacenter, self.region, self.zone, self.app
        )
    }
}

impl FromStr for StackPath {
    type Err = RedirectorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StackPath {
    type Error = RedirectorError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<StackPath> for String {
    fn from(value: StackPath) -> Self {
        value.to_string()
    }
}

/// Grouping key for aggregate providers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlavorKey {
    /// Flavor (zone) name.
    pub flavor: String,
    /// Application name.
    pub app: String,
}

impl FlavorKey {
    /// Create a key from its parts.
    pub fn new(flavor: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            flavor: flavor.into(),
            app: app.into(),
        }
    }
}

impl fmt::Display for FlavorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.flavor, self.app)
    }
}
