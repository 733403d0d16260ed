use crate::ElementId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Faults raised by a single node, either while it is being configured
/// or while it processes a message.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid property expression: {0}")]
    Propex(#[from] PropexError),

    #[error("Context store '{store}' failed: {reason}")]
    Context { store: String, reason: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn config(message: impl Into<String>) -> Self {
        NodeError::Configuration(message.into())
    }
}

/// Configuration errors detected while building the graph. None of these
/// let the graph start.
#[derive(Error, Debug, Clone)]
pub enum GraphError {
    #[error("Invalid flow record: {0}")]
    InvalidRecord(String),

    #[error("Invalid element id: {0}")]
    InvalidId(String),

    #[error("Duplicate element id: {0}")]
    DuplicateId(ElementId),

    #[error("Node {node} belongs to unknown flow {flow}")]
    UnknownFlow { node: ElementId, flow: ElementId },

    #[error("Node {node} belongs to unknown group {group}")]
    UnknownGroup { node: ElementId, group: ElementId },

    #[error("Node {node} has unknown type '{node_type}'")]
    UnknownNodeType { node: ElementId, node_type: String },

    #[error("Node {from} is wired to missing node {to}")]
    DanglingWire { from: ElementId, to: ElementId },

    #[error("Node {node} ({node_type}) rejected its configuration: {source}")]
    InvalidConfig {
        node: ElementId,
        node_type: String,
        #[source]
        source: NodeError,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropexError {
    #[error("empty property expression")]
    Empty,

    #[error("bad property expression '{expr}' at offset {offset}: {reason}")]
    BadSyntax {
        expr: String,
        offset: usize,
        reason: &'static str,
    },
}
