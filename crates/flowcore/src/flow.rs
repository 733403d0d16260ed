//! Flow documents: the JSON array of `tab`, `group` and node records a
//! graph is built from.

use crate::{ElementId, EnvVar, GraphError, NodeError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Record types that carry no behaviour and are skipped
const IGNORED_TYPES: &[&str] = &["comment"];

/// A `tab` record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: ElementId,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// A `group` record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub id: ElementId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "z")]
    pub flow: ElementId,
    /// Enclosing group
    #[serde(rename = "g", default)]
    pub parent: Option<ElementId>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Any other record: a node instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(rename = "z")]
    pub flow: ElementId,
    #[serde(rename = "g", default)]
    pub group: Option<ElementId>,
    #[serde(default)]
    pub name: String,
    /// One list of target ids per output port
    #[serde(default)]
    pub wires: Vec<Vec<ElementId>>,
    #[serde(rename = "d", default)]
    pub disabled: bool,
    /// Type-specific fields
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<ElementId>, node_type: impl Into<String>, flow: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            flow: flow.into(),
            group: None,
            name: String::new(),
            wires: Vec::new(),
            disabled: false,
            config: serde_json::Map::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_wires(mut self, wires: Vec<Vec<ElementId>>) -> Self {
        self.wires = wires;
        self
    }

    pub fn in_group(mut self, group: impl Into<ElementId>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Deserialize the type-specific fields into a node's config struct.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_value(serde_json::Value::Object(self.config.clone()))
            .map_err(|e| NodeError::config(e.to_string()))
    }
}

/// A parsed, structurally consistent flow document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDocument {
    pub flows: Vec<FlowDefinition>,
    pub groups: Vec<GroupDefinition>,
    pub nodes: Vec<NodeDefinition>,
}

impl FlowDocument {
    pub fn from_json_str(text: &str) -> Result<Self, GraphError> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|e| GraphError::InvalidRecord(e.to_string()))?;
        Self::parse(json)
    }

    /// Split records by type and check ids, owning flows and owning groups.
    pub fn parse(json: serde_json::Value) -> Result<Self, GraphError> {
        let serde_json::Value::Array(records) = json else {
            return Err(GraphError::InvalidRecord("flow document must be a JSON array".into()));
        };
        let mut doc = FlowDocument::default();
        let mut seen = HashSet::new();

        for record in records {
            let Some(id) = record.get("id").and_then(|v| v.as_str()) else {
                return Err(GraphError::InvalidRecord(format!("record without string id: {record}")));
            };
            let id: ElementId = id.parse().map_err(|_| GraphError::InvalidId(id.to_string()))?;
            if !seen.insert(id) {
                return Err(GraphError::DuplicateId(id));
            }
            let record_type = record.get("type").and_then(|v| v.as_str()).unwrap_or_default();
            let invalid = |e: serde_json::Error| GraphError::InvalidRecord(format!("{record_type} {id}: {e}"));

            match record_type {
                "tab" => doc.flows.push(serde_json::from_value(record.clone()).map_err(invalid)?),
                "group" => doc.groups.push(serde_json::from_value(record.clone()).map_err(invalid)?),
                "" => return Err(GraphError::InvalidRecord(format!("record {id} has no type"))),
                "subflow" => {
                    return Err(GraphError::InvalidRecord(format!("subflow {id}: subflows are not supported")))
                }
                t if IGNORED_TYPES.contains(&t) => {}
                _ if record.get("z").is_none() => {
                    return Err(GraphError::InvalidRecord(format!(
                        "{record_type} {id}: node records need an owning flow (z)"
                    )))
                }
                _ => doc.nodes.push(serde_json::from_value(record.clone()).map_err(invalid)?),
            }
        }

        doc.check_owners()?;
        Ok(doc)
    }

    fn check_owners(&self) -> Result<(), GraphError> {
        let flows: HashSet<_> = self.flows.iter().map(|f| f.id).collect();
        let groups: HashSet<_> = self.groups.iter().map(|g| g.id).collect();
        for group in &self.groups {
            if !flows.contains(&group.flow) {
                return Err(GraphError::UnknownFlow { node: group.id, flow: group.flow });
            }
            if let Some(parent) = group.parent.filter(|p| !groups.contains(p)) {
                return Err(GraphError::UnknownGroup { node: group.id, group: parent });
            }
        }
        for node in &self.nodes {
            if !flows.contains(&node.flow) {
                return Err(GraphError::UnknownFlow { node: node.id, flow: node.flow });
            }
            if let Some(group) = node.group.filter(|g| !groups.contains(g)) {
                return Err(GraphError::UnknownGroup { node: node.id, group });
            }
        }
        Ok(())
    }

    pub fn flow(&self, id: ElementId) -> Option<&FlowDefinition> {
        self.flows.iter().find(|f| f.id == id)
    }

    pub fn group(&self, id: ElementId) -> Option<&GroupDefinition> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn node(&self, id: ElementId) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
