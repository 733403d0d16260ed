//! Core abstractions for the flow engine
//!
//! This crate provides the value model, messages, property expressions,
//! context storage, environment resolution and the node contract that all
//! other components depend on.

pub mod context;
pub mod env;
mod error;
pub mod eval;
pub mod events;
mod flow;
mod id;
mod msg;
mod node;
pub mod propex;
pub mod value;

pub use context::{ContextKey, ContextScope, ContextSettings, ContextStore, StoreKind};
pub use env::{EnvVar, FlowIdentity, GroupIdentity, NodeIdentity};
pub use error::{FlowError, GraphError, NodeError, PropexError};
pub use eval::{EvalContext, Property, PropertyType, Target};
pub use events::*;
pub use flow::{FlowDefinition, FlowDocument, GroupDefinition, NodeDefinition};
pub use id::{ElementId, InvalidElementId};
pub use msg::Msg;
pub use node::{Node, NodeContext, Outlet};
pub use propex::{PathKey, PropPath};
pub use value::{Map, Value};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
