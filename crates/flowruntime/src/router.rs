use chrono::Utc;
use flowcore::{ElementId, EventBus, ExecutionEvent, ExecutionId, FlowError, Msg, Outlet};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

struct Slot {
    ports: Vec<Vec<ElementId>>,
    inbox: mpsc::UnboundedSender<Msg>,
}

/// Moves messages along wires into the input queues of their targets.
///
/// The wiring is fixed when the engine is built, so delivery needs no
/// locking.
pub struct Router {
    execution_id: ExecutionId,
    slots: HashMap<ElementId, Slot>,
    events: Arc<EventBus>,
}

impl Router {
    pub fn new(execution_id: ExecutionId, events: Arc<EventBus>) -> Self {
        Self {
            execution_id,
            slots: HashMap::new(),
            events,
        }
    }

    pub(crate) fn add_node(&mut self, id: ElementId, ports: Vec<Vec<ElementId>>, inbox: mpsc::UnboundedSender<Msg>) {
        self.slots.insert(id, Slot { ports, inbox });
    }

    /// Place `msg` in `target`'s queue, bypassing wiring.
    pub fn inject(&self, target: ElementId, msg: Msg) -> Result<(), FlowError> {
        let slot = self
            .slots
            .get(&target)
            .ok_or_else(|| FlowError::Execution(format!("no running node {target}")))?;
        slot.inbox
            .send(msg)
            .map_err(|_| FlowError::Execution(format!("node {target} is no longer accepting messages")))
    }

    /// Number of targets wired to `port` of `source`
    #[cfg(test)]
    pub fn fan_out(&self, source: ElementId, port: usize) -> usize {
        self.slots
            .get(&source)
            .and_then(|s| s.ports.get(port))
            .map_or(0, Vec::len)
    }
}

impl Outlet for Router {
    fn deliver(&self, source: ElementId, port: usize, msg: Msg) {
        let Some(slot) = self.slots.get(&source) else {
            warn!(node = %source, "Message from a node the router does not know");
            return;
        };
        let Some(targets) = slot.ports.get(port) else {
            trace!(node = %source, port, "Port has no wires");
            return;
        };

        let msg_id = msg.id().map(str::to_string);
        let mut pending = Some(msg);
        for (i, target) in targets.iter().enumerate() {
            // the last target takes the original, the others a deep copy
            let copy = if i + 1 == targets.len() {
                pending.take()
            } else {
                pending.clone()
            };
            let Some(copy) = copy else { break };
            let Some(target_slot) = self.slots.get(target) else {
                continue;
            };
            if target_slot.inbox.send(copy).is_err() {
                debug!(from = %source, to = %target, "Target stopped, message dropped");
                continue;
            }
            trace!(from = %source, port, to = %target, "Delivered");
            self.events.emit(ExecutionEvent::MessageDelivered {
                execution_id: self.execution_id,
                from: source,
                port,
                to: *target,
                msg_id: msg_id.clone(),
                timestamp: Utc::now(),
            });
        }
    }
}
