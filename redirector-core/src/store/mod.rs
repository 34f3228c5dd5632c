//! Coordination store boundary.
//!
//! The core only needs hierarchical paths, byte payloads and change
//! notifications. Any client that can provide those (ZooKeeper, etcd, the
//! in-memory store in [`memory`]) plugs in through [`CoordinationStore`].

pub mod memory;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::StoreError;

pub use memory::InMemoryStore;

/// Connection state of a store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The session is healthy.
    Connected,
    /// The session is lost or suspended.
    Disconnected,
}

/// Notifications delivered by a subtree watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The initial population of the watched subtree is complete.
    Initialized,
    /// A node was created.
    NodeAdded(String),
    /// A node's data changed.
    NodeUpdated(String),
    /// A node was deleted.
    NodeRemoved(String),
    /// The connection was lost or suspended.
    ConnectionLost,
    /// The connection came back.
    ConnectionRestored,
}

impl StoreEvent {
    /// Path touched by a node event.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::NodeAdded(p) | Self::NodeUpdated(p) | Self::NodeRemoved(p) => Some(p),
            _ => None,
        }
    }

    /// Connection events never count as topology changes.
    pub fn is_connection_event(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::ConnectionRestored)
    }
}

/// Read, write and watch primitives of a hierarchical coordination store.
///
/// Calls are synchronous; the core issues them only from background refresh
/// work or from the live-fallback host lookup.
pub trait CoordinationStore: Send + Sync {
    /// Names (not full paths) of the children of `path`.
    fn children_of(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Data stored at `path`.
    fn data_of(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Whether `path` exists.
    fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Create or overwrite the data at `path`.
    fn set_data(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Deliver every change under `path` to `sink`.
    ///
    /// Implementations send [`StoreEvent::Initialized`] once the subtree's
    /// first population is visible to readers.
    fn watch_subtree(&self, path: &str, sink: UnboundedSender<StoreEvent>) -> Result<(), StoreError>;

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}
