use crate::graph::FlowGraph;
use crate::registry::NodeRegistry;
use crate::router::Router;
use chrono::Utc;
use flowcore::{
    ContextSettings, ContextStore, ElementId, EventBus, ExecutionEvent, ExecutionId, FlowDocument, FlowError,
    Msg, Node, NodeContext,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    pub context: ContextSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            context: ContextSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Built,
    Running,
    Stopped,
}

struct NodeRuntime {
    node: Arc<dyn Node>,
    ctx: NodeContext,
    inbox: Option<mpsc::UnboundedReceiver<Msg>>,
}

/// A built graph of running nodes.
///
/// `start()` arms every node, `stop()` cancels timers and in-flight work,
/// waits for every node task and then runs the close hooks. No node emits
/// once `stop()` has returned.
pub struct FlowEngine {
    execution_id: ExecutionId,
    event_bus: Arc<EventBus>,
    context: Arc<ContextStore>,
    router: Arc<Router>,
    nodes: Vec<NodeRuntime>,
    cancellation: CancellationToken,
    tasks: TaskTracker,
    outputs: Option<mpsc::UnboundedReceiver<Msg>>,
    state: EngineState,
    started_at: Option<Instant>,
}

impl FlowEngine {
    /// Parse a flow document and build it.
    pub async fn from_json(
        records: serde_json::Value,
        registry: &NodeRegistry,
        config: RuntimeConfig,
    ) -> Result<Self, FlowError> {
        let doc = FlowDocument::parse(records)?;
        Self::build(&doc, registry, config).await
    }

    /// Instantiate every enabled node and wire them up. Fails on the first
    /// configuration problem; nothing runs until `start()`.
    pub async fn build(doc: &FlowDocument, registry: &NodeRegistry, config: RuntimeConfig) -> Result<Self, FlowError> {
        let graph = FlowGraph::build(doc)?;
        let execution_id = ExecutionId::new_v4();
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let context = Arc::new(ContextStore::from_settings(&config.context).await?);
        let cancellation = CancellationToken::new();
        let tasks = TaskTracker::new();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let mut instances = Vec::with_capacity(graph.len());
        for graph_node in graph.nodes() {
            instances.push(registry.create_node(&graph_node.definition)?);
        }

        let mut router = Router::new(execution_id, event_bus.clone());
        let mut inboxes = Vec::with_capacity(graph.len());
        for graph_node in graph.nodes() {
            let (tx, rx) = mpsc::unbounded_channel();
            router.add_node(graph_node.identity.id, graph_node.ports.clone(), tx);
            inboxes.push(rx);
        }
        let router = Arc::new(router);

        let nodes = graph
            .into_nodes()
            .into_iter()
            .zip(instances)
            .zip(inboxes)
            .map(|((graph_node, node), inbox)| {
                let id = graph_node.identity.id;
                let ctx = NodeContext::new(
                    graph_node.identity,
                    context.clone(),
                    event_bus.create_emitter(execution_id, id),
                    cancellation.clone(),
                    router.clone(),
                    tasks.clone(),
                    output_tx.clone(),
                );
                NodeRuntime {
                    node,
                    ctx,
                    inbox: Some(inbox),
                }
            })
            .collect::<Vec<_>>();

        info!(%execution_id, nodes = nodes.len(), "Flow graph built");
        Ok(Self {
            execution_id,
            event_bus,
            context,
            router,
            nodes,
            cancellation,
            tasks,
            outputs: Some(output_rx),
            state: EngineState::Built,
            started_at: None,
        })
    }

    /// Start every node: its input queue begins draining and its start
    /// hook runs (inject nodes arm their timers here).
    pub async fn start(&mut self) -> Result<(), FlowError> {
        if self.state != EngineState::Built {
            return Err(FlowError::Execution(format!("engine cannot start from state {:?}", self.state)));
        }
        self.state = EngineState::Running;
        self.started_at = Some(Instant::now());

        for runtime in &mut self.nodes {
            if let Some(inbox) = runtime.inbox.take() {
                self.tasks.spawn(drain_inbox(runtime.node.clone(), runtime.ctx.clone(), inbox));
            }
        }

        for runtime in &self.nodes {
            let id = runtime.ctx.id();
            if let Err(e) = runtime.node.start(&runtime.ctx).await {
                warn!(node = %id, node_type = runtime.node.node_type(), "Node failed to start: {}", e);
                runtime.ctx.events.failed(e);
                continue;
            }
            self.event_bus.emit(ExecutionEvent::NodeStarted {
                execution_id: self.execution_id,
                node_id: id,
                node_type: runtime.node.node_type().to_string(),
                timestamp: Utc::now(),
            });
        }

        self.event_bus.emit(ExecutionEvent::EngineStarted {
            execution_id: self.execution_id,
            nodes: self.nodes.len(),
            timestamp: Utc::now(),
        });
        info!(execution_id = %self.execution_id, nodes = self.nodes.len(), "Engine started");
        Ok(())
    }

    /// Cancel all timers and in-flight processing, wait for every node task
    /// to finish, then run each node's close hook.
    pub async fn stop(&mut self) {
        if self.state == EngineState::Stopped {
            return;
        }
        self.cancellation.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let event_bus = &self.event_bus;
        let execution_id = self.execution_id;
        let closes = self.nodes.iter().map(|runtime| async move {
            let id = runtime.ctx.id();
            if let Err(e) = runtime.node.close(&runtime.ctx).await {
                warn!(node = %id, "Close hook failed: {}", e);
                runtime.ctx.events.failed(e);
            }
            event_bus.emit(ExecutionEvent::NodeClosed {
                execution_id,
                node_id: id,
                timestamp: Utc::now(),
            });
        });
        futures::future::join_all(closes).await;

        let duration_ms = self
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or_default();
        self.state = EngineState::Stopped;
        self.event_bus.emit(ExecutionEvent::EngineStopped {
            execution_id: self.execution_id,
            duration_ms,
            timestamp: Utc::now(),
        });
        info!(execution_id = %self.execution_id, duration_ms, "Engine stopped");
    }

    /// Place `msg` in the input queue of node `target`.
    pub fn inject(&self, target: ElementId, msg: Msg) -> Result<(), FlowError> {
        if self.state == EngineState::Stopped {
            return Err(FlowError::Execution("engine is stopped".into()));
        }
        debug!(node = %target, "External injection");
        self.router.inject(target, msg)
    }

    /// The receiving end of everything sink nodes observe. Available once.
    pub fn take_outputs(&mut self) -> Option<OutputCollector> {
        self.outputs.take().map(|rx| OutputCollector { rx })
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Ids of the running nodes, in start order
    pub fn node_ids(&self) -> Vec<ElementId> {
        self.nodes.iter().map(|n| n.ctx.id()).collect()
    }
}

impl Drop for FlowEngine {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

async fn drain_inbox(node: Arc<dyn Node>, ctx: NodeContext, mut inbox: mpsc::UnboundedReceiver<Msg>) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => break,
            msg = inbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let _guard = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => break,
            guard = ctx.lock() => guard,
        };
        let result = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => break,
            result = node.receive(&ctx, msg) => result,
        };
        if let Err(e) = result {
            warn!(node = %ctx.id(), node_type = node.node_type(), "Node failed: {}", e);
            ctx.events.failed(e);
        }
    }
    debug!(node = %ctx.id(), "Input queue closed");
}

/// Reads what sink nodes observed, in arrival order
pub struct OutputCollector {
    rx: mpsc::UnboundedReceiver<Msg>,
}

impl OutputCollector {
    /// Wait up to `timeout` for the next message
    pub async fn next(&mut self, timeout: Duration) -> Option<Msg> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    /// Collect until `count` messages arrived or `timeout` elapsed
    pub async fn collect(&mut self, count: usize, timeout: Duration) -> Vec<Msg> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::with_capacity(count.min(64));
        while out.len() < count {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(msg)) => out.push(msg),
                Ok(None) | Err(_) => break,
            }
        }
        out
    }

    /// Everything already waiting, without blocking
    pub fn drain(&mut self) -> Vec<Msg> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}
