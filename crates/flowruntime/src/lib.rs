//! Flow execution runtime
//!
//! This crate turns a flow document into running nodes: it resolves node
//! identities and wiring, keeps the node registry, routes messages between
//! node input queues and drives the start/stop lifecycle.

mod engine;
mod graph;
mod registry;
mod router;

pub use engine::{EngineState, FlowEngine, OutputCollector, RuntimeConfig};
pub use graph::{FlowGraph, GraphNode};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry};
pub use router::Router;
