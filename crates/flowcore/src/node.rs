use crate::{events::EventEmitter, ContextStore, ElementId, EvalContext, Msg, NodeError, NodeIdentity};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Core trait that all node types implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Type name as written in flow documents (e.g. "inject", "switch")
    fn node_type(&self) -> &str;

    /// Called once when the engine starts, before any message arrives.
    /// Nodes that emit on their own (timers) arm themselves here.
    async fn start(&self, _ctx: &NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    /// Handle one message from the node's input queue
    async fn receive(&self, ctx: &NodeContext, msg: Msg) -> Result<(), NodeError>;

    /// Called once after every task of the engine has finished
    async fn close(&self, _ctx: &NodeContext) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Where a node's output goes. Implemented by the router.
pub trait Outlet: Send + Sync {
    fn deliver(&self, source: ElementId, port: usize, msg: Msg);
}

/// Everything a running node may touch
#[derive(Clone)]
pub struct NodeContext {
    pub identity: Arc<NodeIdentity>,
    pub context: Arc<ContextStore>,
    pub events: EventEmitter,
    pub cancellation: CancellationToken,
    outlet: Arc<dyn Outlet>,
    serial: Arc<Mutex<()>>,
    tasks: TaskTracker,
    output: mpsc::UnboundedSender<Msg>,
}

impl NodeContext {
    pub fn new(
        identity: Arc<NodeIdentity>,
        context: Arc<ContextStore>,
        events: EventEmitter,
        cancellation: CancellationToken,
        outlet: Arc<dyn Outlet>,
        tasks: TaskTracker,
        output: mpsc::UnboundedSender<Msg>,
    ) -> Self {
        Self {
            identity,
            context,
            events,
            cancellation,
            outlet,
            serial: Arc::new(Mutex::new(())),
            tasks,
            output,
        }
    }

    pub fn id(&self) -> ElementId {
        self.identity.id
    }

    /// Emit `msg` on output port `port`. Dropped once the engine is stopping.
    pub fn send(&self, port: usize, msg: Msg) {
        if self.cancellation.is_cancelled() {
            tracing::trace!(node = %self.identity.id, port, "Engine stopping, message dropped");
            return;
        }
        self.outlet.deliver(self.identity.id, port, msg);
    }

    pub fn send_many(&self, msgs: impl IntoIterator<Item = (usize, Msg)>) {
        for (port, msg) in msgs {
            self.send(port, msg);
        }
    }

    /// Hand a message to whoever observes the engine's output (sink nodes).
    pub fn observe(&self, msg: Msg) {
        if self.output.send(msg).is_err() {
            tracing::debug!(node = %self.identity.id, "No output collector attached");
        }
    }

    /// Run a background task owned by the engine. `stop()` waits for it, so
    /// the task must watch `cancellation`.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Serialises message handling and timer firings of this node.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.serial.clone().lock_owned().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn eval_context(&self) -> EvalContext {
        EvalContext::new(self.identity.clone(), self.context.clone())
    }
}
