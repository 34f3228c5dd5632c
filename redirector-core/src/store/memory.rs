//! In-memory coordination store.
//!
//! Keeps a flat ordered map of absolute paths and fans change notifications
//! out to subtree watchers. Supports simulated disconnects: while disconnected,
//! reads fail with [`StoreError::ConnectionLoss`] and watchers miss every
//! change until the connection is restored.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedSender;

use super::{join_path, ConnectionState, CoordinationStore, StoreEvent};
use crate::error::StoreError;

struct Watcher {
    prefix: String,
    sink: UnboundedSender<StoreEvent>,
    initialized: bool,
}

/// A hierarchical store held entirely in memory.
pub struct InMemoryStore {
    nodes: RwLock<BTreeMap<String, Vec<u8>>>,
    watchers: Mutex<Vec<Watcher>>,
    connected: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty, connected store.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Create a node (and any missing ancestors) holding `data`.
    ///
    /// Overwrites the data of an existing node.
    pub fn create(&self, path: &str, data: &[u8]) {
        let path = normalize(path);
        let mut events = Vec::new();
        {
            let mut nodes = self.nodes.write();
            for ancestor in ancestors(&path) {
                if !nodes.contains_key(&ancestor) {
                    nodes.insert(ancestor.clone(), Vec::new());
                    events.push(StoreEvent::NodeAdded(ancestor));
                }
            }
            match nodes.insert(path.clone(), data.to_vec()) {
                Some(_) => events.push(StoreEvent::NodeUpdated(path)),
                None => events.push(StoreEvent::NodeAdded(path)),
            }
        }
        self.notify(events);
    }

    /// Delete a node and everything beneath it.
    pub fn delete(&self, path: &str) {
        let path = normalize(path);
        let removed: Vec<String> = {
            let mut nodes = self.nodes.write();
            let doomed: Vec<String> = nodes
                .keys()
                .filter(|k| is_under(&path, k))
                .cloned()
                .collect();
            for key in &doomed {
                nodes.remove(key);
            }
            doomed
        };
        // Deepest nodes first, the way a recursive delete reports them.
        let events = removed.into_iter().rev().map(StoreEvent::NodeRemoved).collect();
        self.notify(events);
    }

    /// Simulate losing the session.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.broadcast(StoreEvent::ConnectionLost);
        }
    }

    /// Simulate the session coming back.
    ///
    /// Watchers registered while disconnected receive their
    /// [`StoreEvent::Initialized`] now.
    pub fn reconnect(&self) {
        if self.connected.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut watchers = self.watchers.lock();
        watchers.retain_mut(|w| {
            let mut alive = w.sink.send(StoreEvent::ConnectionRestored).is_ok();
            if alive && !w.initialized {
                alive = w.sink.send(StoreEvent::Initialized).is_ok();
                w.initialized = true;
            }
            alive
        });
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::ConnectionLoss)
        }
    }

    fn broadcast(&self, event: StoreEvent) {
        self.watchers.lock().retain(|w| w.sink.send(event.clone()).is_ok());
    }

    fn notify(&self, events: Vec<StoreEvent>) {
        // Changes made while disconnected are invisible to watchers.
        if events.is_empty() || !self.is_connected() {
            return;
        }
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| {
            events
                .iter()
                .filter(|e| e.path().is_some_and(|p| is_under(&w.prefix, p)))
                .all(|e| w.sink.send(e.clone()).is_ok())
        });
    }
}

impl CoordinationStore for InMemoryStore {
    fn children_of(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_connected()?;
        let path = normalize(path);
        let nodes = self.nodes.read();
        if path != "/" && !nodes.contains_key(&path) {
            return Err(StoreError::NoNode(path));
        }

        let prefix = join_path(&path, "");
        let children = nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    fn data_of(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.ensure_connected()?;
        let path = normalize(path);
        self.nodes
            .read()
            .get(&path)
            .cloned()
            .ok_or(StoreError::NoNode(path))
    }

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let path = normalize(path);
        Ok(path == "/" || self.nodes.read().contains_key(&path))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.create(path, data);
        Ok(())
    }

    fn watch_subtree(&self, path: &str, sink: UnboundedSender<StoreEvent>) -> Result<(), StoreError> {
        let initialized = self.is_connected();
        if initialized && sink.send(StoreEvent::Initialized).is_err() {
            return Err(StoreError::Backend("watch sink closed".into()));
        }
        self.watchers.lock().push(Watcher {
            prefix: normalize(path),
            sink,
            initialized,
        });
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if let Some((_, parents)) = segments.split_last() {
        for segment in parents {
            current.push('/');
            current.push_str(segment);
            out.push(current.clone());
        }
    }
    out
}

fn is_under(prefix: &str, path: &str) -> bool {
    prefix == "/"
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}
