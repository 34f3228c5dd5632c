//! Redirector core.
//!
//! This crate contains the topology cache, provider managers, balancer and
//! redirect engine that turn a client's request context into a URL pointing
//! at one live host of the right application stack.
//!
//! Data flows bottom-up: a [`store::CoordinationStore`] publishes stacks and
//! hosts, the [`topology::TopologyCache`] mirrors them, a
//! [`manager::ServiceProviderManager`] turns stacks into providers, and the
//! [`engine::RedirectorEngine`] resolves rule decisions against them.

pub mod config;
pub mod context;
pub mod domain;
pub mod engine;
pub mod error;
pub mod load_balancer;
pub mod manager;
pub mod provider;
pub mod rules;
pub mod session;
pub mod store;
pub mod topology;

pub use config::RedirectorConfig;
pub use context::Context;
pub use engine::RedirectorEngine;
pub use error::{RedirectorError, Result, StoreError};
