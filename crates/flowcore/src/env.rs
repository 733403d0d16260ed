//! Node identity and environment variable resolution.
//!
//! A name is looked up in this order: the reserved identity names
//! (`NR_NODE_ID` and friends), the `env` lists of the owning groups from
//! innermost outwards, the owning flow's `env` list, then the process
//! environment.

use crate::eval::{self, PropertyType};
use crate::{ElementId, NodeError, Value};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

static SUBSTITUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([^}\s]+)\s*\}").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// Raw `env` list entry of a flow or group record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(rename = "type", default = "default_env_type")]
    pub ty: String,
}

fn default_env_type() -> String {
    "str".to_string()
}

#[derive(Debug, Clone, PartialEq)]
enum EnvValue {
    Value(Value),
    /// `str` value containing `${…}`, expanded against the outer levels
    Template(String),
    /// `env` typed entry naming a variable of an outer level
    Ref(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvList(Vec<(String, EnvValue)>);

impl EnvList {
    pub fn compile(vars: &[EnvVar]) -> Result<Self, NodeError> {
        let mut entries = Vec::with_capacity(vars.len());
        for var in vars {
            let ty: PropertyType = var.ty.parse()?;
            let value = match ty {
                PropertyType::Env => EnvValue::Ref(json_text(&var.value)),
                PropertyType::Str => {
                    let text = json_text(&var.value);
                    if text.contains("${") {
                        EnvValue::Template(text)
                    } else {
                        EnvValue::Value(Value::String(text))
                    }
                }
                _ => EnvValue::Value(eval::literal(ty, &var.value)?),
            };
            entries.push((var.name.clone(), value));
        }
        Ok(Self(entries))
    }

    fn find(&self, name: &str) -> Option<&EnvValue> {
        self.0.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowIdentity {
    pub id: ElementId,
    pub label: String,
    pub env: EnvList,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupIdentity {
    pub id: ElementId,
    pub name: String,
    pub env: EnvList,
}

/// Who a node is and where it lives. Shared by the node's context and the
/// property resolver.
#[derive(Debug, Clone, Default)]
pub struct NodeIdentity {
    pub id: ElementId,
    pub name: String,
    pub node_type: String,
    pub flow: Arc<FlowIdentity>,
    /// Owning groups, innermost first
    pub groups: Vec<Arc<GroupIdentity>>,
}

impl NodeIdentity {
    /// `flowid/nodeid`
    pub fn path(&self) -> String {
        format!("{}/{}", self.flow.id, self.id)
    }

    fn reserved(&self, name: &str) -> Option<Value> {
        let group = self.groups.first();
        let text = match name {
            "NR_NODE_NAME" => self.name.clone(),
            "NR_NODE_ID" => self.id.to_string(),
            "NR_NODE_PATH" => self.path(),
            "NR_FLOW_NAME" => self.flow.label.clone(),
            "NR_FLOW_ID" => self.flow.id.to_string(),
            "NR_GROUP_NAME" => group?.name.clone(),
            "NR_GROUP_ID" => group?.id.to_string(),
            _ => return None,
        };
        Some(Value::String(text))
    }

    /// Resolve an environment variable as seen by this node.
    pub fn env(&self, name: &str) -> Option<Value> {
        let name = name.trim();
        self.reserved(name).or_else(|| self.env_from(name, 0))
    }

    /// Expand every `${NAME}`; unknown names expand to the empty string.
    pub fn substitute(&self, text: &str) -> String {
        self.substitute_from(text, 0)
    }

    // Levels: 0..groups.len() are groups, then the flow, then the process.
    fn env_from(&self, name: &str, level: usize) -> Option<Value> {
        let list = match level {
            l if l < self.groups.len() => &self.groups[l].env,
            l if l == self.groups.len() => &self.flow.env,
            _ => return std::env::var(name).ok().map(Value::String),
        };
        match list.find(name) {
            Some(EnvValue::Value(v)) => Some(v.clone()),
            Some(EnvValue::Template(t)) => Some(Value::String(self.substitute_from(t, level + 1))),
            Some(EnvValue::Ref(other)) => {
                let other = other.trim();
                self.reserved(other).or_else(|| self.env_from(other, level + 1))
            }
            None => self.env_from(name, level + 1),
        }
    }

    fn substitute_from(&self, text: &str, level: usize) -> String {
        SUBSTITUTION
            .replace_all(text, |caps: &Captures<'_>| {
                let name = &caps[1];
                self.reserved(name)
                    .or_else(|| self.env_from(name, level))
                    .map(|v| env_text(&v))
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

fn env_text(value: &Value) -> String {
    value
        .to_text()
        .unwrap_or_else(|| serde_json::Value::from(value.clone()).to_string())
}
