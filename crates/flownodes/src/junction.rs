use async_trait::async_trait;
use flowcore::{Msg, Node, NodeContext, NodeDefinition, NodeError};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

/// Wiring point: passes every message through unchanged
pub struct JunctionNode;

#[async_trait]
impl Node for JunctionNode {
    fn node_type(&self) -> &str {
        "junction"
    }

    async fn receive(&self, ctx: &NodeContext, msg: Msg) -> Result<(), NodeError> {
        ctx.send(0, msg);
        Ok(())
    }
}

pub struct JunctionNodeFactory;

impl NodeFactory for JunctionNodeFactory {
    fn create(&self, _definition: &NodeDefinition) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(JunctionNode))
    }

    fn node_type(&self) -> &str {
        "junction"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Forwards messages unchanged".to_string(),
            category: "common".to_string(),
            inputs: 1,
            outputs: Some(1),
        }
    }
}
