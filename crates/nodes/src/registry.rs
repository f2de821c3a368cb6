//! Node type registry.
//!
//! Maps `node_type` strings to shared [`ExecutableNode`] implementations.
//! Lookups are pure; an unknown type is reported back to the caller, which
//! decides how to surface it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{ExecutableNode, HttpNode};

/// Registry of node implementations keyed by node type.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn ExecutableNode>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in node type registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(HttpNode::NODE_TYPE, Arc::new(HttpNode::new()));
        registry
    }

    /// Register (or replace) the implementation for `node_type`.
    pub fn register(&mut self, node_type: impl Into<String>, node: Arc<dyn ExecutableNode>) {
        self.nodes.insert(node_type.into(), node);
    }

    /// Look up the implementation for `node_type`.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn ExecutableNode>> {
        self.nodes.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.nodes.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}
