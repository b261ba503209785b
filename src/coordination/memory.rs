//! In-process coordination ensemble
//!
//! A single shared node tree with per-session watch delivery. Sessions own
//! their ephemeral nodes; closing or expiring a session deletes them and
//! fires the corresponding watches on every other session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{CoordinationClient, CreateMode, EventType, WatchedEvent};
use crate::error::{BspError, Result};

const ROOT: &str = "/";

struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<u64>) -> Self {
        Self {
            data,
            owner,
            next_sequence: 0,
        }
    }
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, mpsc::UnboundedSender<WatchedEvent>>,
    next_session: u64,
    /// Data and existence watches, keyed by node path
    node_watches: HashMap<String, HashSet<u64>>,
    /// Child-list watches, keyed by parent path
    child_watches: HashMap<String, HashSet<u64>>,
}

fn parent_of(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn validate_path(path: &str) -> Result<()> {
    let valid = path == ROOT
        || (path.starts_with('/') && !path.ends_with('/') && !path.contains("//"));
    if valid {
        Ok(())
    } else {
        Err(BspError::ProtocolViolation {
            reason: format!("invalid coordination path '{}'", path),
        })
    }
}

fn child_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", path)
    }
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_string(), Node::new(Vec::new(), None));
        Self {
            nodes,
            sessions: HashMap::new(),
            next_session: 1,
            node_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn check_session(&self, session: u64) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(BspError::SessionClosed { session })
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.as_str() != ROOT)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn deliver(&self, watchers: Option<HashSet<u64>>, event: WatchedEvent) {
        for session in watchers.into_iter().flatten() {
            if let Some(sender) = self.sessions.get(&session) {
                let _ = sender.send(event.clone());
            }
        }
    }

    fn fire_node(&mut self, path: &str, event_type: EventType) {
        let watchers = self.node_watches.remove(path);
        self.deliver(
            watchers,
            WatchedEvent {
                path: path.to_string(),
                event_type,
            },
        );
    }

    fn fire_children(&mut self, parent: &str) {
        let watchers = self.child_watches.remove(parent);
        self.deliver(
            watchers,
            WatchedEvent {
                path: parent.to_string(),
                event_type: EventType::NodeChildrenChanged,
            },
        );
    }

    fn insert(&mut self, path: &str, data: Vec<u8>, owner: Option<u64>) {
        self.nodes.insert(path.to_string(), Node::new(data, owner));
        self.fire_node(path, EventType::NodeCreated);
        if let Some(parent) = parent_of(path) {
            self.fire_children(parent);
        }
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.fire_node(path, EventType::NodeDeleted);
        let child_watchers = self.child_watches.remove(path);
        self.deliver(
            child_watchers,
            WatchedEvent {
                path: path.to_string(),
                event_type: EventType::NodeDeleted,
            },
        );
        if let Some(parent) = parent_of(path) {
            self.fire_children(parent);
        }
    }

    fn ensure_ancestors(&mut self, path: &str) {
        let ancestors: Vec<String> = path
            .match_indices('/')
            .skip(1)
            .map(|(idx, _)| path[..idx].to_string())
            .collect();
        for ancestor in ancestors {
            if !self.nodes.contains_key(&ancestor) {
                self.insert(&ancestor, Vec::new(), None);
            }
        }
    }

    fn create(
        &mut self,
        session: u64,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<String> {
        self.check_session(session)?;
        validate_path(path)?;
        let parent = match parent_of(path) {
            Some(parent) => parent.to_string(),
            None => {
                return Err(BspError::NodeExists {
                    path: path.to_string(),
                })
            }
        };

        if !self.nodes.contains_key(&parent) {
            if create_parents {
                self.ensure_ancestors(path);
            } else {
                return Err(BspError::NoNode { path: parent });
            }
        }

        let actual = if mode.is_sequential() {
            let parent_node = self
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| BspError::NoNode { path: parent.clone() })?;
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{}{:010}", path, sequence)
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&actual) {
            return Err(BspError::NodeExists { path: actual });
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.insert(&actual, data, owner);
        Ok(actual)
    }

    fn delete(&mut self, session: u64, path: &str, recursive: bool) -> Result<()> {
        self.check_session(session)?;
        validate_path(path)?;
        if path == ROOT || !self.nodes.contains_key(path) {
            return Err(BspError::NoNode {
                path: path.to_string(),
            });
        }
        let descendants = self.descendants(path);
        if !descendants.is_empty() && !recursive {
            return Err(BspError::NotEmpty {
                path: path.to_string(),
            });
        }
        // Every descendant sorts after its ancestors, so reverse order is deepest first
        for descendant in descendants.iter().rev() {
            self.remove(descendant);
        }
        self.remove(path);
        Ok(())
    }

    fn close_session(&mut self, session: u64) -> usize {
        if self.sessions.remove(&session).is_none() {
            return 0;
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.remove(path);
        }
        for watchers in self.node_watches.values_mut() {
            watchers.remove(&session);
        }
        for watchers in self.child_watches.values_mut() {
            watchers.remove(&session);
        }
        owned.len()
    }
}

/// Shared in-process node tree
#[derive(Clone)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Open a new session; watch events for it arrive on the returned receiver
    pub fn connect(&self) -> (MemorySession, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut tree = self.tree.lock();
        let session_id = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(session_id, sender);
        debug!("Opened coordination session {}", session_id);
        (
            MemorySession {
                tree: self.tree.clone(),
                session_id,
            },
            receiver,
        )
    }

    /// Expire a session as if its heartbeat had lapsed
    pub fn expire(&self, session_id: u64) {
        let removed = self.tree.lock().close_session(session_id);
        info!(
            "Expired coordination session {} ({} ephemeral nodes removed)",
            session_id, removed
        );
    }

    /// Number of nodes in the tree, root included
    pub fn node_count(&self) -> usize {
        self.tree.lock().nodes.len()
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session against a [`MemoryEnsemble`]
pub struct MemorySession {
    tree: Arc<Mutex<Tree>>,
    session_id: u64,
}

impl MemorySession {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Close the session, deleting its ephemeral nodes
    pub fn close(&self) {
        let removed = self.tree.lock().close_session(self.session_id);
        debug!(
            "Closed coordination session {} ({} ephemeral nodes removed)",
            self.session_id, removed
        );
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<String> {
        self.tree
            .lock()
            .create(self.session_id, path, data, mode, create_parents)
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool> {
        let mut tree = self.tree.lock();
        tree.check_session(self.session_id)?;
        if watch {
            tree.node_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        Ok(tree.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>> {
        let mut tree = self.tree.lock();
        tree.check_session(self.session_id)?;
        let data = match tree.nodes.get(path) {
            Some(node) => node.data.clone(),
            None => {
                return Err(BspError::NoNode {
                    path: path.to_string(),
                })
            }
        };
        if watch {
            tree.node_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        Ok(data)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut tree = self.tree.lock();
        tree.check_session(self.session_id)?;
        match tree.nodes.get_mut(path) {
            Some(node) => node.data = data,
            None => {
                return Err(BspError::NoNode {
                    path: path.to_string(),
                })
            }
        }
        tree.fire_node(path, EventType::NodeDataChanged);
        Ok(())
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let mut tree = self.tree.lock();
        tree.check_session(self.session_id)?;
        if !tree.nodes.contains_key(path) {
            return Err(BspError::NoNode {
                path: path.to_string(),
            });
        }
        if watch {
            tree.child_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        Ok(tree.children(path))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.tree.lock().delete(self.session_id, path, recursive)
    }
}
