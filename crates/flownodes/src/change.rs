use async_trait::async_trait;
use flowcore::{EvalContext, Msg, Node, NodeContext, NodeDefinition, NodeError, Property, Target};
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default, Deserialize)]
struct ChangeConfig {
    #[serde(default)]
    rules: Vec<RuleConfig>,
    /// Single-rule form written by older flows
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    property: Option<String>,
    #[serde(default)]
    to: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RuleConfig {
    t: String,
    p: String,
    #[serde(default)]
    pt: Option<String>,
    #[serde(default)]
    to: Option<serde_json::Value>,
    #[serde(default)]
    tot: Option<String>,
}

impl ChangeConfig {
    /// Rule list, translating the single-rule form when no list is given
    fn into_rules(self) -> Result<Vec<RuleConfig>, NodeError> {
        if !self.rules.is_empty() {
            return Ok(self.rules);
        }
        let Some(action) = self.action else {
            return Ok(Vec::new());
        };
        let p = self.property.unwrap_or_else(|| "payload".to_string());
        match action.as_str() {
            "replace" => {
                let (to, tot) = match self.to {
                    Some(serde_json::Value::String(to)) => match to.strip_prefix("msg.") {
                        Some(path) => (serde_json::Value::String(path.to_string()), "msg"),
                        None => (serde_json::Value::String(to), "str"),
                    },
                    Some(other) => (other, "str"),
                    None => (serde_json::Value::String(String::new()), "str"),
                };
                Ok(vec![RuleConfig {
                    t: "set".to_string(),
                    p,
                    pt: None,
                    to: Some(to),
                    tot: Some(tot.to_string()),
                }])
            }
            "delete" => Ok(vec![RuleConfig {
                t: "delete".to_string(),
                p,
                pt: None,
                to: None,
                tot: None,
            }]),
            other => Err(NodeError::config(format!("change action '{other}' is not supported"))),
        }
    }
}

#[derive(Debug)]
enum Rule {
    Set { target: Target, value: Property },
    Delete { target: Target },
    Move { from: Target, to: Target },
}

impl Rule {
    fn compile(rule: &RuleConfig) -> Result<Self, NodeError> {
        let target = Target::compile(rule.pt.as_deref().unwrap_or("msg"), &rule.p)?;
        let to_type = rule.tot.as_deref().unwrap_or("str");
        match rule.t.as_str() {
            "set" => {
                let raw = rule.to.clone().unwrap_or(serde_json::Value::String(String::new()));
                Ok(Rule::Set {
                    target,
                    value: Property::compile(to_type, &raw)?,
                })
            }
            "delete" => Ok(Rule::Delete { target }),
            "move" => {
                let to = match &rule.to {
                    Some(serde_json::Value::String(path)) => path.clone(),
                    _ => return Err(NodeError::config("move rule needs a destination")),
                };
                // move destinations default to the message, like sources
                let to_type = rule.tot.as_deref().unwrap_or("msg");
                Ok(Rule::Move {
                    from: target,
                    to: Target::compile(to_type, &to)?,
                })
            }
            other => Err(NodeError::config(format!("change rule '{other}' is not supported"))),
        }
    }

    async fn apply(&self, ectx: &EvalContext, msg: &mut Msg) -> Result<(), NodeError> {
        match self {
            Rule::Set { target, value } => {
                let value = value.evaluate(ectx, Some(&*msg)).await;
                target.set(ectx, msg, value).await
            }
            Rule::Delete { target } => target.set(ectx, msg, None).await,
            Rule::Move { from, to } => {
                if from == to {
                    return Ok(());
                }
                let Some(value) = from.get(ectx, msg).await else {
                    return Ok(());
                };
                from.set(ectx, msg, None).await?;
                to.set(ectx, msg, Some(value)).await
            }
        }
    }
}

/// Applies its rules in order to each message, then forwards it.
pub struct ChangeNode {
    rules: Vec<Rule>,
}

impl ChangeNode {
    pub fn from_definition(definition: &NodeDefinition) -> Result<Self, NodeError> {
        let config: ChangeConfig = definition.config()?;
        let rules = config
            .into_rules()?
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    async fn apply(&self, ectx: &EvalContext, msg: &mut Msg) -> Result<(), NodeError> {
        for rule in &self.rules {
            rule.apply(ectx, msg).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Node for ChangeNode {
    fn node_type(&self) -> &str {
        "change"
    }

    async fn receive(&self, ctx: &NodeContext, mut msg: Msg) -> Result<(), NodeError> {
        self.apply(&ctx.eval_context(), &mut msg).await?;
        trace!(node = %ctx.id(), rules = self.rules.len(), "Change applied");
        ctx.send(0, msg);
        Ok(())
    }
}

pub struct ChangeNodeFactory;

impl NodeFactory for ChangeNodeFactory {
    fn create(&self, definition: &NodeDefinition) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(ChangeNode::from_definition(definition)?))
    }

    fn node_type(&self) -> &str {
        "change"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Sets, deletes or moves message and context properties".to_string(),
            category: "function".to_string(),
            inputs: 1,
            outputs: Some(1),
        }
    }
}
