//! Domain models shared by every layer of the redirector.

pub mod host;
pub mod route;
pub mod stack;

pub use host::{HostInstance, StackSeed};
pub use route::{IpProtocolVersion, ResolvedUrlParams, RouteResult, ServiceInstance, UrlParams};
pub use stack::{FlavorKey, StackPath};
