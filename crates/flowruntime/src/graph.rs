//! Resolves a flow document into the set of nodes that will run: identities
//! with their flow and group chains, de-duplicated wiring and a start order.

use flowcore::env::EnvList;
use flowcore::{
    ElementId, FlowDocument, FlowIdentity, GraphError, GroupIdentity, NodeDefinition, NodeIdentity,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// A node that takes part in the running graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub definition: NodeDefinition,
    pub identity: Arc<NodeIdentity>,
    /// Targets per output port, duplicates removed, disabled targets dropped
    pub ports: Vec<Vec<ElementId>>,
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    nodes: Vec<GraphNode>,
    cyclic: bool,
}

impl FlowGraph {
    pub fn build(doc: &FlowDocument) -> Result<Self, GraphError> {
        let flows = flow_identities(doc)?;
        let groups = group_identities(doc)?;

        let known: HashSet<ElementId> = doc.nodes.iter().map(|n| n.id).collect();
        let active: Vec<&NodeDefinition> = doc
            .nodes
            .iter()
            .filter(|n| {
                let flow_disabled = doc.flow(n.flow).is_some_and(|f| f.disabled);
                if n.disabled || flow_disabled {
                    debug!(node = %n.id, node_type = %n.node_type, "Skipping disabled node");
                }
                !n.disabled && !flow_disabled
            })
            .collect();
        let active_ids: HashSet<ElementId> = active.iter().map(|n| n.id).collect();

        let mut nodes = Vec::with_capacity(active.len());
        for def in active {
            let flow = flows
                .get(&def.flow)
                .cloned()
                .ok_or(GraphError::UnknownFlow { node: def.id, flow: def.flow })?;
            let chain = match def.group {
                Some(group) => groups
                    .get(&group)
                    .cloned()
                    .ok_or(GraphError::UnknownGroup { node: def.id, group })?,
                None => Vec::new(),
            };

            let mut ports = Vec::with_capacity(def.wires.len());
            for port in &def.wires {
                let mut targets: Vec<ElementId> = Vec::with_capacity(port.len());
                for &target in port {
                    if !known.contains(&target) {
                        return Err(GraphError::DanglingWire { from: def.id, to: target });
                    }
                    if !active_ids.contains(&target) {
                        debug!(from = %def.id, to = %target, "Dropping wire into disabled node");
                        continue;
                    }
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
                ports.push(targets);
            }

            let identity = NodeIdentity {
                id: def.id,
                name: def.name.clone(),
                node_type: def.node_type.clone(),
                flow,
                groups: chain,
            };
            nodes.push(GraphNode {
                definition: def.clone(),
                identity: Arc::new(identity),
                ports,
            });
        }

        let cyclic = order_for_start(&mut nodes);
        if cyclic {
            warn!("Flow wiring contains cycles; nodes start in definition order");
        }
        Ok(Self { nodes, cyclic })
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<GraphNode> {
        self.nodes
    }

    pub fn node(&self, id: ElementId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.identity.id == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the wiring loops back on itself
    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }
}

/// Sort downstream nodes before the nodes feeding them, so consumers are
/// running before any producer fires. Returns true when the wiring has a
/// cycle, in which case definition order is kept.
fn order_for_start(nodes: &mut Vec<GraphNode>) -> bool {
    let mut graph: DiGraph<ElementId, usize> = DiGraph::new();
    let mut index: HashMap<ElementId, NodeIndex> = HashMap::new();
    for node in nodes.iter() {
        index.insert(node.identity.id, graph.add_node(node.identity.id));
    }
    for node in nodes.iter() {
        let from = index[&node.identity.id];
        for (port, targets) in node.ports.iter().enumerate() {
            for target in targets {
                if let Some(&to) = index.get(target) {
                    graph.add_edge(from, to, port);
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => {
            let rank: HashMap<ElementId, usize> = order
                .into_iter()
                .rev()
                .enumerate()
                .map(|(rank, idx)| (graph[idx], rank))
                .collect();
            nodes.sort_by_key(|n| rank.get(&n.identity.id).copied().unwrap_or(usize::MAX));
            false
        }
        Err(_) => true,
    }
}

fn flow_identities(doc: &FlowDocument) -> Result<HashMap<ElementId, Arc<FlowIdentity>>, GraphError> {
    doc.flows
        .iter()
        .map(|flow| {
            let env = EnvList::compile(&flow.env)
                .map_err(|e| GraphError::InvalidRecord(format!("flow {} env: {e}", flow.id)))?;
            let identity = FlowIdentity {
                id: flow.id,
                label: flow.label.clone(),
                env,
            };
            Ok((flow.id, Arc::new(identity)))
        })
        .collect()
}

/// Each group's chain of identities, innermost first.
fn group_identities(doc: &FlowDocument) -> Result<HashMap<ElementId, Vec<Arc<GroupIdentity>>>, GraphError> {
    let mut single = HashMap::new();
    for group in &doc.groups {
        let env = EnvList::compile(&group.env)
            .map_err(|e| GraphError::InvalidRecord(format!("group {} env: {e}", group.id)))?;
        single.insert(
            group.id,
            Arc::new(GroupIdentity {
                id: group.id,
                name: group.name.clone(),
                env,
            }),
        );
    }

    let mut chains = HashMap::new();
    for group in &doc.groups {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(group.id);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(GraphError::InvalidRecord(format!("group {} is nested in itself", group.id)));
            }
            let Some(identity) = single.get(&id) else {
                return Err(GraphError::UnknownGroup { node: group.id, group: id });
            };
            chain.push(identity.clone());
            cursor = doc.group(id).and_then(|g| g.parent);
        }
        chains.insert(group.id, chain);
    }
    Ok(chains)
}
