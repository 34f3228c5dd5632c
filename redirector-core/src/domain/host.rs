//! Host instance models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::stack::StackPath;
use crate::error::{RedirectorError, Result};

/// Represents a single running process registered under a stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostInstance {
    /// IPv4 address of the host.
    pub ipv4: String,
    /// IPv6 address of the host, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    /// Relative traffic weight. Zero means the host receives no traffic.
    pub weight: u32,
    /// Free-form parameters published with the host (protocol, port, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl HostInstance {
    /// Create a host with no IPv6 address and no parameters.
    pub fn new(ipv4: impl Into<String>, weight: u32) -> Self {
        Self {
            ipv4: ipv4.into(),
            ipv6: None,
            weight,
            parameters: BTreeMap::new(),
        }
    }

    /// Attach an IPv6 address.
    pub fn with_ipv6(mut self, ipv6: impl Into<String>) -> Self {
        self.ipv6 = Some(ipv6.into());
        self
    }

    /// Whether this host may be placed into an instance pool.
    pub fn is_routable(&self) -> bool {
        self.weight > 0
    }

    /// Decode a host from the JSON payload stored at `path`.
    ///
    /// Payloads without a weight take `default_weight`. An empty payload is
    /// treated as a bare registration whose address is the node name.
    pub fn decode(path: &str, node_name: &str, payload: &[u8], default_weight: u32) -> Result<Self> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::new(node_name, default_weight));
        }

        let raw: HostPayload =
            serde_json::from_slice(payload).map_err(|source| RedirectorError::Decode {
                path: path.to_string(),
                source,
            })?;

        Ok(Self {
            ipv4: raw.ipv4.unwrap_or_else(|| node_name.to_string()),
            ipv6: raw.ipv6.filter(|ip| !ip.is_empty()),
            weight: raw.weight.unwrap_or(default_weight),
            parameters: raw.parameters,
        })
    }

    /// Encode this host as a store payload.
    pub fn encode(&self) -> Vec<u8> {
        // Serializing a plain struct of strings and integers cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Wire shape of a host node's data.
#[derive(Debug, Deserialize)]
struct HostPayload {
    #[serde(default)]
    ipv4: Option<String>,
    #[serde(default)]
    ipv6: Option<String>,
    #[serde(default)]
    weight: Option<u32>,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

/// One stack's hosts, the unit used by backup and static seeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSeed {
    /// The stack the hosts belong to.
    pub path: StackPath,
    /// Hosts registered under the stack.
    pub hosts: Vec<HostInstance>,
}

impl StackSeed {
    /// Pair a stack path with its hosts.
    pub fn new(path: StackPath, hosts: Vec<HostInstance>) -> Self {
        Self { path, hosts }
    }
}
