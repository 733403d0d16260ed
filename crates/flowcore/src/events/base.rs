use crate::{ElementId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identifies one start/stop cycle of an engine
pub type ExecutionId = Uuid;

/// Events emitted while a graph is running
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    EngineStarted {
        execution_id: ExecutionId,
        nodes: usize,
        timestamp: DateTime<Utc>,
    },
    EngineStopped {
        execution_id: ExecutionId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: ElementId,
        node_type: String,
        timestamp: DateTime<Utc>,
    },
    NodeClosed {
        execution_id: ExecutionId,
        node_id: ElementId,
        timestamp: DateTime<Utc>,
    },
    MessageDelivered {
        execution_id: ExecutionId,
        from: ElementId,
        port: usize,
        to: ElementId,
        msg_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: ElementId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        execution_id: ExecutionId,
        node_id: ElementId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events specific to one node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    /// A value a sink node observed
    Data { value: Value },
}

/// Event emitter handed to each node
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    node_id: ElementId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        node_id: ElementId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            node_id,
            sender,
        }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            execution_id: self.execution_id,
            node_id: self.node_id,
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    pub fn data(&self, value: Value) {
        self.emit(NodeEvent::Data { value });
    }

    /// Report a fault of this node
    pub fn failed(&self, error: impl ToString) {
        let _ = self.sender.send(ExecutionEvent::NodeFailed {
            execution_id: self.execution_id,
            node_id: self.node_id,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Engine-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, node_id: ElementId) -> EventEmitter {
        EventEmitter::new(execution_id, node_id, self.sender.clone())
    }
}
