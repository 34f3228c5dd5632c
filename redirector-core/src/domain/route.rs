//! Routing results and URL parameters.

use serde::{Deserialize, Serialize};

use crate::domain::host::HostInstance;
use crate::domain::stack::StackPath;
use crate::error::{RedirectorError, Result};

/// IP protocol family used to address the selected host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocolVersion {
    /// Address the host by its IPv4 address.
    #[serde(rename = "4")]
    V4,
    /// Address the host by its IPv6 address.
    #[serde(rename = "6")]
    V6,
}

impl IpProtocolVersion {
    /// Map a numeric version to the enum.
    pub fn from_number(version: u8) -> Option<Self> {
        match version {
            4 => Some(Self::V4),
            6 => Some(Self::V6),
            _ => None,
        }
    }

    /// The numeric form of the version.
    pub fn number(self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
        }
    }
}

/// Parameters substituted into a server's URL template.
///
/// Every field is optional so partial results from a URL rule model can be
/// layered over configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlParams {
    /// URL scheme, e.g. `http` or `xre`.
    pub protocol: Option<String>,
    /// TCP port.
    pub port: Option<u16>,
    /// Path component appended after the authority.
    pub urn: Option<String>,
    /// Preferred IP version, `4` or `6`.
    pub ip_protocol_version: Option<u8>,
}

impl UrlParams {
    /// Fill every unset field from `defaults`.
    pub fn or(self, defaults: &UrlParams) -> UrlParams {
        UrlParams {
            protocol: self.protocol.or_else(|| defaults.protocol.clone()),
            port: self.port.or(defaults.port),
            urn: self.urn.or_else(|| defaults.urn.clone()),
            ip_protocol_version: self.ip_protocol_version.or(defaults.ip_protocol_version),
        }
    }

    /// Check that the parameters can build a URL.
    pub fn validate(&self) -> Result<ResolvedUrlParams> {
        let protocol = match self.protocol.as_deref() {
            Some(p) if !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) => {
                p.to_string()
            }
            other => {
                return Err(RedirectorError::InvalidUrlParams(format!(
                    "bad protocol {other:?}"
                )))
            }
        };
        let port = match self.port {
            Some(p) if p > 0 => p,
            other => {
                return Err(RedirectorError::InvalidUrlParams(format!("bad port {other:?}")))
            }
        };
        let version = self.ip_protocol_version.unwrap_or(4);
        let ip_version = IpProtocolVersion::from_number(version).ok_or_else(|| {
            RedirectorError::InvalidUrlParams(format!("bad ip protocol version {version}"))
        })?;

        Ok(ResolvedUrlParams {
            protocol,
            port,
            urn: self.urn.clone().unwrap_or_default(),
            ip_version,
        })
    }
}

/// URL parameters that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrlParams {
    /// URL scheme.
    pub protocol: String,
    /// TCP port.
    pub port: u16,
    /// Path component.
    pub urn: String,
    /// Preferred IP version.
    pub ip_version: IpProtocolVersion,
}

/// A host picked by the balancer, tagged with the stack that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInstance {
    /// Owning stack.
    pub stack: StackPath,
    /// The selected host.
    pub host: HostInstance,
}

impl ServiceInstance {
    /// Tag a host with its stack.
    pub fn new(stack: StackPath, host: HostInstance) -> Self {
        Self { stack, host }
    }
}

/// The outcome of one routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteResult {
    /// Ready-to-use URL.
    pub url: String,
    /// Name of the rule whose server produced the URL.
    pub rule_name: String,
    /// Stack of the selected host. `None` for literal URLs.
    pub stack: Option<StackPath>,
    /// Flavor of the selected host. `None` for literal URLs.
    pub flavor: Option<String>,
    /// IP version used to address the host.
    pub ip_version: IpProtocolVersion,
    /// The selected host, when one was selected.
    pub host: Option<HostInstance>,
    /// Whether the result came from the default-server fallback.
    pub fallback: bool,
}
