use crate::de::{default_true, flex_bool};
use async_trait::async_trait;
use flowcore::{Msg, Node, NodeContext, NodeDefinition, NodeError, PropPath, Value};
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct DebugConfig {
    #[serde(default = "default_true", deserialize_with = "flex_bool")]
    active: bool,
    /// `"true"` logs the whole message, anything else a property path
    #[serde(default, deserialize_with = "crate::de::opt_text")]
    complete: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Shown {
    Message,
    Property(PropPath),
}

/// Sink that logs what it receives and hands every message to the engine's
/// output collector. Serves as `debug`, `test-once` and `console-json`.
pub struct DebugNode {
    node_type: String,
    active: bool,
    shown: Shown,
}

impl DebugNode {
    pub fn from_definition(definition: &NodeDefinition) -> Result<Self, NodeError> {
        let config: DebugConfig = definition.config()?;
        let shown = match config.complete.as_deref().map(str::trim) {
            Some("true") => Shown::Message,
            Some(path) if !path.is_empty() && path != "false" => Shown::Property(PropPath::parse(path)?),
            _ => Shown::Property(PropPath::parse("payload")?),
        };
        Ok(Self {
            node_type: definition.node_type.clone(),
            active: config.active,
            shown,
        })
    }

    fn render(&self, msg: &Msg) -> Value {
        match &self.shown {
            Shown::Message => Value::Object(msg.body().clone()),
            Shown::Property(path) => msg.get_path(path).cloned().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    async fn receive(&self, ctx: &NodeContext, msg: Msg) -> Result<(), NodeError> {
        if self.active {
            let shown = self.render(&msg);
            let text = serde_json::Value::from(shown.clone());
            match self.node_type.as_str() {
                "console-json" => info!(node = %ctx.identity.path(), "{}", text),
                _ => debug!(node = %ctx.identity.path(), value = %text, "Debug output"),
            }
            ctx.events.data(shown);
        }
        ctx.observe(msg);
        Ok(())
    }
}

/// One factory per sink type name
pub struct DebugNodeFactory {
    type_name: &'static str,
}

impl DebugNodeFactory {
    pub const TYPES: [&'static str; 3] = ["debug", "test-once", "console-json"];

    pub fn new(type_name: &'static str) -> Self {
        Self { type_name }
    }
}

impl NodeFactory for DebugNodeFactory {
    fn create(&self, definition: &NodeDefinition) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(DebugNode::from_definition(definition)?))
    }

    fn node_type(&self) -> &str {
        self.type_name
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs messages and passes them to the output collector".to_string(),
            category: "common".to_string(),
            inputs: 1,
            outputs: Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink(config: serde_json::Value) -> DebugNode {
        let mut definition = NodeDefinition::new(2u64, "debug", 0x100u64);
        if let Some(fields) = config.as_object() {
            definition.config = fields.clone();
        }
        DebugNode::from_definition(&definition).unwrap()
    }

    #[test]
    fn renders_payload_by_default() {
        let msg = Msg::from_json(json!({"payload": {"a": 1}, "topic": "t"})).unwrap();
        let shown = |config| serde_json::Value::from(sink(config).render(&msg));
        assert_eq!(shown(json!({})), json!({"a": 1}));
        assert_eq!(shown(json!({"complete": "topic"})), json!("t"));
        assert_eq!(shown(json!({"complete": "false"})), json!({"a": 1}));
        assert_eq!(shown(json!({"complete": true}))["topic"], json!("t"));
        assert_eq!(shown(json!({"complete": "nothing"})), json!(null));
    }

    #[test]
    fn active_flag_accepts_strings() {
        assert!(sink(json!({})).active);
        assert!(!sink(json!({"active": false})).active);
        assert!(!sink(json!({"active": "false"})).active);
    }
}
