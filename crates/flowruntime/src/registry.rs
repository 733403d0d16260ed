use flowcore::{GraphError, Node, NodeDefinition, NodeError};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a node from its flow-document record. Any problem with the
    /// record's fields is a configuration error.
    fn create(&self, definition: &NodeDefinition) -> Result<Arc<dyn Node>, NodeError>;

    /// Type name this factory answers to
    fn node_type(&self) -> &str;

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: usize,
    /// `None` when the port count follows the configuration (switch rules)
    pub outputs: Option<usize>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "common".to_string(),
            inputs: 1,
            outputs: Some(1),
        }
    }
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory, replacing any earlier one for the same type
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::debug!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Create a node instance from its definition
    pub fn create_node(&self, definition: &NodeDefinition) -> Result<Arc<dyn Node>, GraphError> {
        let factory = self
            .factories
            .get(&definition.node_type)
            .ok_or_else(|| GraphError::UnknownNodeType {
                node: definition.id,
                node_type: definition.node_type.clone(),
            })?;

        factory.create(definition).map_err(|source| GraphError::InvalidConfig {
            node: definition.id,
            node_type: definition.node_type.clone(),
            source,
        })
    }

    /// All registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
