//! `nodes` crate: the `ExecutableNode` trait, the node registry and the
//! built-in node implementations.
//!
//! Every node type must implement [`ExecutableNode`] and be registered in a
//! [`NodeRegistry`] under its `node_type` tag. The engine crate dispatches
//! execution through the registry.

pub mod error;
pub mod traits;
pub mod registry;
pub mod http;
pub mod mock;

pub use error::NodeError;
pub use traits::{ExecutableNode, ExecutionContext};
pub use registry::NodeRegistry;
pub use http::HttpNode;
