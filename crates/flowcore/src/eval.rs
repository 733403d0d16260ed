//! Typed property values as they appear in node configs: a value plus a
//! type tag (`str`, `num`, `msg`, `flow`, …).
//!
//! Literals are parsed once when the node is configured; a bad literal is
//! a configuration error. Everything else is resolved on demand and a miss
//! resolves to `None`.

use crate::context::{ContextKey, ContextScope, ContextStore, Store};
use crate::propex::PropPath;
use crate::value::parse_number;
use crate::{Msg, NodeError, NodeIdentity, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Str,
    Num,
    Bool,
    Json,
    Bin,
    Date,
    Env,
    Msg,
    Flow,
    Global,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Str => "str",
            PropertyType::Num => "num",
            PropertyType::Bool => "bool",
            PropertyType::Json => "json",
            PropertyType::Bin => "bin",
            PropertyType::Date => "date",
            PropertyType::Env => "env",
            PropertyType::Msg => "msg",
            PropertyType::Flow => "flow",
            PropertyType::Global => "global",
        }
    }
}

impl FromStr for PropertyType {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "str" => PropertyType::Str,
            "num" => PropertyType::Num,
            "bool" => PropertyType::Bool,
            "json" => PropertyType::Json,
            "bin" => PropertyType::Bin,
            "date" => PropertyType::Date,
            "env" => PropertyType::Env,
            "msg" => PropertyType::Msg,
            "flow" => PropertyType::Flow,
            "global" => PropertyType::Global,
            other => return Err(NodeError::config(format!("unsupported property type '{other}'"))),
        })
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a property needs besides the message
#[derive(Clone)]
pub struct EvalContext {
    pub identity: Arc<NodeIdentity>,
    pub context: Arc<ContextStore>,
}

impl EvalContext {
    pub fn new(identity: Arc<NodeIdentity>, context: Arc<ContextStore>) -> Self {
        Self { identity, context }
    }

    pub fn scope(&self, kind: ContextKind) -> ContextScope {
        match kind {
            ContextKind::Flow => ContextScope::Flow(self.identity.flow.id),
            ContextKind::Global => ContextScope::Global,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Flow,
    Global,
}

/// A `flow`/`global` reference. The store is looked up on first use and
/// remembered.
#[derive(Debug, Clone)]
pub struct ContextRef {
    kind: ContextKind,
    key: ContextKey,
    store: OnceLock<Arc<Store>>,
}

impl PartialEq for ContextRef {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.key == other.key
    }
}

impl ContextRef {
    pub fn new(kind: ContextKind, key: ContextKey) -> Self {
        Self {
            kind,
            key,
            store: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    async fn resolve_store(&self, ctx: &EvalContext) -> Arc<Store> {
        if let Some(store) = self.store.get() {
            return store.clone();
        }
        let store = ctx.context.store(self.key.store()).await;
        self.store.get_or_init(|| store).clone()
    }

    pub async fn get(&self, ctx: &EvalContext, msg: Option<&Msg>) -> Option<Value> {
        let keys = self.key.path().bind(msg)?;
        let store = self.resolve_store(ctx).await;
        store.get(ctx.scope(self.kind), &keys).await
    }

    pub async fn set(&self, ctx: &EvalContext, msg: Option<&Msg>, value: Option<Value>) -> Result<(), NodeError> {
        let store = self.resolve_store(ctx).await;
        let keys = self.key.path().bind(msg).ok_or_else(|| NodeError::Context {
            store: store.name().to_string(),
            reason: format!("key '{}' did not resolve against the message", self.key.path()),
        })?;
        store.set(ctx.scope(self.kind), &keys, value).await
    }
}

/// Parse a literal of a constant type.
pub fn literal(ty: PropertyType, raw: &serde_json::Value) -> Result<Value, NodeError> {
    use serde_json::Value as Json;
    match ty {
        PropertyType::Str => Ok(Value::String(raw_text(raw))),
        PropertyType::Num => match raw {
            Json::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or(f64::NAN))),
            Json::String(s) => parse_number(s)
                .map(Value::Number)
                .ok_or_else(|| NodeError::config(format!("invalid number literal '{s}'"))),
            other => Err(NodeError::config(format!("invalid number literal {other}"))),
        },
        PropertyType::Bool => Ok(Value::Bool(match raw {
            Json::Bool(b) => *b,
            Json::String(s) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        })),
        PropertyType::Json => match raw {
            Json::String(s) => serde_json::from_str::<Json>(s)
                .map(Value::from)
                .map_err(|e| NodeError::config(format!("invalid JSON literal: {e}"))),
            other => Ok(Value::from(other.clone())),
        },
        PropertyType::Bin => {
            let parsed = match raw {
                Json::String(s) => serde_json::from_str::<Json>(s)
                    .map_err(|e| NodeError::config(format!("invalid buffer literal: {e}")))?,
                other => other.clone(),
            };
            match parsed {
                Json::String(s) => Ok(Value::Bytes(s.into_bytes())),
                Json::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|b| u8::try_from(b).ok())
                            .ok_or_else(|| NodeError::config(format!("buffer element {item} is not a byte")))
                    })
                    .collect::<Result<Vec<u8>, _>>()
                    .map(Value::Bytes),
                other => Err(NodeError::config(format!("invalid buffer literal {other}"))),
            }
        }
        PropertyType::Date => Ok(now_millis()),
        other => Err(NodeError::config(format!("'{other}' is not a literal type"))),
    }
}

fn raw_text(raw: &serde_json::Value) -> String {
    match raw {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn now_millis() -> Value {
    Value::Number(chrono::Utc::now().timestamp_millis() as f64)
}

/// A compiled typed property
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Constant(Value),
    /// String containing `${NAME}` references
    Template(String),
    Date,
    Env(String),
    Msg(PropPath),
    Context(ContextRef),
}

impl Property {
    pub fn compile(ty: &str, raw: &serde_json::Value) -> Result<Self, NodeError> {
        Self::compile_typed(ty.parse()?, raw)
    }

    pub fn compile_typed(ty: PropertyType, raw: &serde_json::Value) -> Result<Self, NodeError> {
        let text = raw_text(raw);
        Ok(match ty {
            PropertyType::Str if text.contains("${") => Property::Template(text),
            PropertyType::Env if text.contains("${") => Property::Template(text),
            PropertyType::Env => Property::Env(text.trim().to_string()),
            PropertyType::Date => Property::Date,
            PropertyType::Msg => Property::Msg(PropPath::parse(&text)?),
            PropertyType::Flow => Property::Context(ContextRef::new(ContextKind::Flow, ContextKey::parse(&text)?)),
            PropertyType::Global => {
                Property::Context(ContextRef::new(ContextKind::Global, ContextKey::parse(&text)?))
            }
            _ => Property::Constant(literal(ty, raw)?),
        })
    }

    /// The value when it does not depend on the message or the clock
    pub fn constant(&self) -> Option<&Value> {
        match self {
            Property::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub async fn evaluate(&self, ctx: &EvalContext, msg: Option<&Msg>) -> Option<Value> {
        match self {
            Property::Constant(v) => Some(v.clone()),
            Property::Template(t) => Some(Value::String(ctx.identity.substitute(t))),
            Property::Date => Some(now_millis()),
            Property::Env(name) => ctx.identity.env(name),
            Property::Msg(path) => msg?.get_path(path).cloned(),
            Property::Context(r) => r.get(ctx, msg).await,
        }
    }
}

/// Writable location: a message property or a context entry
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Msg(PropPath),
    Context(ContextRef),
}

impl Target {
    pub fn compile(ty: &str, path: &str) -> Result<Self, NodeError> {
        match ty.parse::<PropertyType>()? {
            PropertyType::Msg => Ok(Target::Msg(PropPath::parse(path)?)),
            PropertyType::Flow => Ok(Target::Context(ContextRef::new(ContextKind::Flow, ContextKey::parse(path)?))),
            PropertyType::Global => Ok(Target::Context(ContextRef::new(
                ContextKind::Global,
                ContextKey::parse(path)?,
            ))),
            other => Err(NodeError::config(format!("cannot write to a '{other}' property"))),
        }
    }

    pub async fn get(&self, ctx: &EvalContext, msg: &Msg) -> Option<Value> {
        match self {
            Target::Msg(path) => msg.get_path(path).cloned(),
            Target::Context(r) => r.get(ctx, Some(msg)).await,
        }
    }

    /// Write `value`; `None` deletes the target.
    pub async fn set(&self, ctx: &EvalContext, msg: &mut Msg, value: Option<Value>) -> Result<(), NodeError> {
        match (self, value) {
            (Target::Msg(path), Some(value)) => {
                if msg.set_path(path, value) {
                    Ok(())
                } else {
                    Err(NodeError::ExecutionFailed(format!("cannot set msg.{path}")))
                }
            }
            (Target::Msg(path), None) => {
                msg.remove_path(path);
                Ok(())
            }
            (Target::Context(r), value) => r.set(ctx, Some(&*msg), value).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElementId, FlowIdentity};
    use serde_json::json;

    fn ctx() -> EvalContext {
        let identity = NodeIdentity {
            id: ElementId::new(0xa),
            name: "n".into(),
            node_type: "test".into(),
            flow: Arc::new(FlowIdentity {
                id: ElementId::new(0xf),
                label: "flow".into(),
                ..Default::default()
            }),
            groups: Vec::new(),
        };
        EvalContext::new(Arc::new(identity), Arc::new(ContextStore::in_memory()))
    }

    #[test]
    fn literals_keep_their_kind() {
        assert_eq!(literal(PropertyType::Num, &json!("10")).unwrap(), Value::Number(10.0));
        assert_eq!(literal(PropertyType::Num, &json!("0x1F")).unwrap(), Value::Number(31.0));
        assert_eq!(literal(PropertyType::Num, &json!(2.5)).unwrap(), Value::Number(2.5));
        assert_eq!(literal(PropertyType::Str, &json!("10")).unwrap(), Value::from("10"));
        assert_eq!(literal(PropertyType::Bool, &json!("TRUE")).unwrap(), Value::Bool(true));
        assert_eq!(literal(PropertyType::Bool, &json!("yes")).unwrap(), Value::Bool(false));
        assert_eq!(
            literal(PropertyType::Json, &json!("{\"a\": [1]}")).unwrap(),
            Value::from(json!({"a": [1]}))
        );
        assert_eq!(literal(PropertyType::Bin, &json!("[1,2,255]")).unwrap(), Value::Bytes(vec![1, 2, 255]));
        assert_eq!(literal(PropertyType::Bin, &json!("\"Hi\"")).unwrap(), Value::Bytes(b"Hi".to_vec()));
    }

    #[test]
    fn malformed_literals_are_configuration_errors() {
        assert!(literal(PropertyType::Num, &json!("ten")).is_err());
        assert!(literal(PropertyType::Num, &json!("")).is_err());
        assert!(literal(PropertyType::Json, &json!("{oops")).is_err());
        assert!(literal(PropertyType::Bin, &json!("[1, 300]")).is_err());
        assert!(Property::compile("jsonata", &json!("$now()")).is_err());
        assert!(Property::compile("msg", &json!("a..b")).is_err());
    }

    #[tokio::test]
    async fn date_is_epoch_millis() {
        let before = chrono::Utc::now().timestamp_millis() as f64;
        let v = Property::compile("date", &json!("")).unwrap().evaluate(&ctx(), None).await;
        let n = v.and_then(|v| v.as_f64()).unwrap();
        assert!(n >= before && n < before + 60_000.0);
    }

    #[tokio::test]
    async fn msg_and_env_resolution() {
        let ctx = ctx();
        let msg = Msg::from_json(json!({"topic": "t", "payload": {"t": 42}})).unwrap();
        let p = Property::compile("msg", &json!("payload[msg.topic]")).unwrap();
        assert_eq!(p.evaluate(&ctx, Some(&msg)).await, Some(Value::Number(42.0)));
        let miss = Property::compile("msg", &json!("payload.none")).unwrap();
        assert_eq!(miss.evaluate(&ctx, Some(&msg)).await, None);

        let env = Property::compile("env", &json!("NR_NODE_ID")).unwrap();
        assert_eq!(env.evaluate(&ctx, None).await, Some(Value::from("000000000000000a")));
        let tpl = Property::compile("str", &json!("flow=${NR_FLOW_NAME}")).unwrap();
        assert_eq!(tpl.evaluate(&ctx, None).await, Some(Value::from("flow=flow")));
    }

    #[tokio::test]
    async fn context_targets_round_trip() {
        let ctx = ctx();
        let mut msg = Msg::new();
        let target = Target::compile("flow", "#:(alt)::count").unwrap();
        target.set(&ctx, &mut msg, Some(Value::from(7.0))).await.unwrap();

        let read = Property::compile("flow", &json!("#:(alt)::count")).unwrap();
        assert_eq!(read.evaluate(&ctx, None).await, Some(Value::Number(7.0)));
        let other_store = Property::compile("flow", &json!("count")).unwrap();
        assert_eq!(other_store.evaluate(&ctx, None).await, None);
        let global = Property::compile("global", &json!("#:(alt)::count")).unwrap();
        assert_eq!(global.evaluate(&ctx, None).await, None);

        target.set(&ctx, &mut msg, None).await.unwrap();
        assert_eq!(read.evaluate(&ctx, None).await, None);
    }

    #[test]
    fn literal_targets_are_rejected() {
        assert!(Target::compile("str", "x").is_err());
        assert!(Target::compile("msg", "payload").is_ok());
    }
}
