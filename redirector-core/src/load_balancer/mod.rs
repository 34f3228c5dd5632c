//! Instance selection.
//!
//! [`selector`] holds the pick strategies; [`balancer`] resolves a server path
//! to candidate instances through the provider manager and applies them.

pub mod balancer;
pub mod selector;

pub use balancer::{Balancer, LookupMode};
pub use selector::{SelectionStrategy, Selector};
