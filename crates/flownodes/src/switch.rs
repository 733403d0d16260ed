use crate::de::{default_true, flex_bool};
use async_trait::async_trait;
use flowcore::value::parse_number;
use flowcore::{EvalContext, Msg, Node, NodeContext, NodeDefinition, NodeError, Property, Value};
use flowruntime::{NodeFactory, NodeMetadata};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Deserialize)]
struct SwitchConfig {
    #[serde(default = "default_property")]
    property: String,
    #[serde(rename = "propertyType", default)]
    property_type: Option<String>,
    #[serde(default = "default_true", deserialize_with = "flex_bool")]
    checkall: bool,
    #[serde(default)]
    rules: Vec<RuleConfig>,
}

fn default_property() -> String {
    "payload".to_string()
}

#[derive(Debug, Deserialize)]
struct RuleConfig {
    /// Operator; `true`/`false` may be written as JSON booleans
    t: serde_json::Value,
    #[serde(default)]
    v: Option<serde_json::Value>,
    #[serde(default)]
    vt: Option<String>,
    #[serde(default)]
    v2: Option<serde_json::Value>,
    #[serde(default)]
    v2t: Option<String>,
    #[serde(default, deserialize_with = "flex_bool")]
    case: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeCheck {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Buffer,
    Json,
    Null,
    Undefined,
}

impl TypeCheck {
    fn parse(name: &str) -> Result<Self, NodeError> {
        Ok(match name {
            "string" => TypeCheck::String,
            "number" => TypeCheck::Number,
            "boolean" => TypeCheck::Boolean,
            "array" => TypeCheck::Array,
            "object" => TypeCheck::Object,
            "buffer" => TypeCheck::Buffer,
            "json" => TypeCheck::Json,
            "null" => TypeCheck::Null,
            "undefined" => TypeCheck::Undefined,
            other => return Err(NodeError::config(format!("istype: unknown type '{other}'"))),
        })
    }

    fn matches(self, value: Option<&Value>) -> bool {
        match (self, value) {
            (TypeCheck::Undefined, v) => v.is_none(),
            (_, None) => false,
            (TypeCheck::String, Some(v)) => matches!(v, Value::String(_)),
            (TypeCheck::Number, Some(v)) => v.as_f64().is_some_and(f64::is_finite),
            (TypeCheck::Boolean, Some(v)) => matches!(v, Value::Bool(_)),
            (TypeCheck::Array, Some(v)) => matches!(v, Value::Array(_)),
            (TypeCheck::Object, Some(v)) => matches!(v, Value::Object(_)),
            (TypeCheck::Buffer, Some(v)) => matches!(v, Value::Bytes(_)),
            (TypeCheck::Json, Some(v)) => v
                .as_str()
                .is_some_and(|s| serde_json::from_str::<serde_json::Value>(s).is_ok()),
            (TypeCheck::Null, Some(v)) => v.is_null(),
        }
    }
}

#[derive(Debug)]
enum Operator {
    Eq(Property),
    Neq(Property),
    Lt(Property),
    Lte(Property),
    Gt(Property),
    Gte(Property),
    Between(Property, Property),
    Contains(Property),
    Regex(RegexRule),
    IsType(TypeCheck),
    HasKey(Property),
    True,
    False,
    Empty,
    NotEmpty,
    Null,
    NotNull,
    Else,
}

#[derive(Debug)]
struct RegexRule {
    pattern: Property,
    case_insensitive: bool,
    /// Present when the pattern is a literal
    compiled: Option<Regex>,
}

/// Operand type when the rule does not name one: numeric literals are
/// numbers, everything else a string.
fn operand(value: Option<&serde_json::Value>, ty: Option<&str>) -> Result<Property, NodeError> {
    let raw = value.cloned().unwrap_or(serde_json::Value::String(String::new()));
    let ty = match ty {
        Some(ty) if !ty.is_empty() => ty,
        _ => match &raw {
            serde_json::Value::Number(_) => "num",
            serde_json::Value::String(s) if parse_number(s).is_some() => "num",
            _ => "str",
        },
    };
    Property::compile(ty, &raw)
}

impl Operator {
    fn compile(rule: &RuleConfig) -> Result<Self, NodeError> {
        let name = match &rule.t {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => return Err(NodeError::config(format!("invalid rule operator {other}"))),
        };
        let v = || operand(rule.v.as_ref(), rule.vt.as_deref());
        let v2 = || operand(rule.v2.as_ref(), rule.v2t.as_deref());

        Ok(match name.as_str() {
            "eq" => Operator::Eq(v()?),
            "neq" => Operator::Neq(v()?),
            "lt" => Operator::Lt(v()?),
            "lte" => Operator::Lte(v()?),
            "gt" => Operator::Gt(v()?),
            "gte" => Operator::Gte(v()?),
            "btwn" => Operator::Between(v()?, v2()?),
            "cont" => Operator::Contains(v()?),
            "regex" => {
                let raw = rule.v.clone().unwrap_or(serde_json::Value::String(String::new()));
                let pattern = Property::compile(rule.vt.as_deref().unwrap_or("str"), &raw)?;
                let compiled = match pattern.constant() {
                    Some(constant) => Some(build_regex(&text_of(constant), rule.case)?),
                    None => None,
                };
                Operator::Regex(RegexRule {
                    pattern,
                    case_insensitive: rule.case,
                    compiled,
                })
            }
            "istype" => {
                let ty = rule.v.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
                Operator::IsType(TypeCheck::parse(ty)?)
            }
            "hask" => Operator::HasKey(v()?),
            "true" => Operator::True,
            "false" => Operator::False,
            "empty" => Operator::Empty,
            "nempty" => Operator::NotEmpty,
            "null" => Operator::Null,
            "nnull" => Operator::NotNull,
            "else" => Operator::Else,
            "head" | "tail" | "index" | "jsonata_exp" => {
                return Err(NodeError::config(format!("switch operator '{name}' is not supported")))
            }
            other => return Err(NodeError::config(format!("unknown switch operator '{other}'"))),
        })
    }

    async fn matches(&self, left: Option<&Value>, ectx: &EvalContext, msg: &Msg, matched: bool) -> bool {
        match self {
            Operator::Null => left.map_or(true, Value::is_null),
            Operator::NotNull => left.is_some_and(|v| !v.is_null()),
            Operator::Else => !matched,
            Operator::IsType(check) => check.matches(left),
            _ => match left {
                Some(left) => self.compare(left, ectx, msg).await,
                None => false,
            },
        }
    }

    async fn compare(&self, left: &Value, ectx: &EvalContext, msg: &Msg) -> bool {
        match self {
            Operator::Eq(p) => p.evaluate(ectx, Some(msg)).await.is_some_and(|r| left.loose_eq(&r)),
            Operator::Neq(p) => p.evaluate(ectx, Some(msg)).await.is_some_and(|r| !left.loose_eq(&r)),
            Operator::Lt(p) => ordered(left, p.evaluate(ectx, Some(msg)).await, |o| o == Ordering::Less),
            Operator::Lte(p) => ordered(left, p.evaluate(ectx, Some(msg)).await, |o| o != Ordering::Greater),
            Operator::Gt(p) => ordered(left, p.evaluate(ectx, Some(msg)).await, |o| o == Ordering::Greater),
            Operator::Gte(p) => ordered(left, p.evaluate(ectx, Some(msg)).await, |o| o != Ordering::Less),
            Operator::Between(a, b) => {
                let lower = a.evaluate(ectx, Some(msg)).await;
                let upper = b.evaluate(ectx, Some(msg)).await;
                match (lower, upper) {
                    (Some(a), Some(b)) => between(left, &a, &b),
                    _ => false,
                }
            }
            Operator::Contains(p) => p.evaluate(ectx, Some(msg)).await.is_some_and(|r| contains(left, &r)),
            Operator::Regex(rule) => {
                let Some(text) = left.to_text() else {
                    return false;
                };
                match &rule.compiled {
                    Some(re) => re.is_match(&text),
                    None => {
                        let Some(pattern) = rule.pattern.evaluate(ectx, Some(msg)).await else {
                            return false;
                        };
                        match build_regex(&text_of(&pattern), rule.case_insensitive) {
                            Ok(re) => re.is_match(&text),
                            Err(e) => {
                                debug!(node = %ectx.identity.id, "Dynamic regex rejected: {}", e);
                                false
                            }
                        }
                    }
                }
            }
            Operator::HasKey(p) => match (left, p.evaluate(ectx, Some(msg)).await) {
                (Value::Object(map), Some(Value::String(key))) => map.contains_key(&key),
                _ => false,
            },
            Operator::True => left.as_bool() == Some(true),
            Operator::False => left.as_bool() == Some(false),
            Operator::Empty => sized(left).is_some_and(|n| n == 0),
            Operator::NotEmpty => sized(left).is_some_and(|n| n > 0),
            Operator::Null | Operator::NotNull | Operator::Else | Operator::IsType(_) => false,
        }
    }
}

fn text_of(value: &Value) -> String {
    value.to_text().unwrap_or_default()
}

fn build_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, NodeError> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| NodeError::config(format!("invalid regex '{pattern}': {e}")))
}

fn ordered(left: &Value, right: Option<Value>, accept: impl Fn(Ordering) -> bool) -> bool {
    right
        .and_then(|r| left.compare(&r))
        .is_some_and(accept)
}

/// Inclusive, whichever way round the bounds are written. Numeric when all
/// three values are numbers, otherwise on their string forms.
fn between(x: &Value, a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(a), Some(b)) = (x.to_number(), a.to_number(), b.to_number()) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        return lo <= x && x <= hi;
    }
    if let (Some(x), Some(a), Some(b)) = (x.to_text(), a.to_text(), b.to_text()) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        return lo <= x && x <= hi;
    }
    false
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::Array(items) => items.iter().any(|item| item.loose_eq(right)),
        Value::String(_) | Value::Number(_) | Value::Bool(_) => match (left.to_text(), right.to_text()) {
            (Some(haystack), Some(needle)) => haystack.contains(&needle),
            _ => false,
        },
        _ => false,
    }
}

/// Length of things that can be empty
fn sized(value: &Value) -> Option<usize> {
    match value {
        Value::String(_) | Value::Array(_) | Value::Bytes(_) | Value::Object(_) => value.len(),
        _ => None,
    }
}

/// Routes each message to the ports of the rules it matches. Rule N feeds
/// port N-1.
pub struct SwitchNode {
    property: Property,
    rules: Vec<Operator>,
    check_all: bool,
}

impl SwitchNode {
    pub fn from_definition(definition: &NodeDefinition) -> Result<Self, NodeError> {
        let config: SwitchConfig = definition.config()?;
        let property = Property::compile(
            config.property_type.as_deref().unwrap_or("msg"),
            &serde_json::Value::String(config.property.clone()),
        )?;
        let rules = config
            .rules
            .iter()
            .map(Operator::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            property,
            rules,
            check_all: config.checkall,
        })
    }

    /// Ports the message goes out on, in rule order
    async fn route(&self, ectx: &EvalContext, msg: &Msg) -> Vec<usize> {
        let left = self.property.evaluate(ectx, Some(msg)).await;
        let mut ports = Vec::new();
        for (port, rule) in self.rules.iter().enumerate() {
            if rule.matches(left.as_ref(), ectx, msg, !ports.is_empty()).await {
                ports.push(port);
                if !self.check_all {
                    break;
                }
            }
        }
        ports
    }
}

#[async_trait]
impl Node for SwitchNode {
    fn node_type(&self) -> &str {
        "switch"
    }

    async fn receive(&self, ctx: &NodeContext, msg: Msg) -> Result<(), NodeError> {
        let ports = self.route(&ctx.eval_context(), &msg).await;
        trace!(node = %ctx.id(), ?ports, "Switch routed");
        ctx.send_many(ports.into_iter().map(|port| (port, msg.clone())));
        Ok(())
    }
}

pub struct SwitchNodeFactory;

impl NodeFactory for SwitchNodeFactory {
    fn create(&self, definition: &NodeDefinition) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(SwitchNode::from_definition(definition)?))
    }

    fn node_type(&self) -> &str {
        "switch"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Routes messages by comparing a property against rules".to_string(),
            category: "function".to_string(),
            inputs: 1,
            outputs: None,
        }
    }
}
