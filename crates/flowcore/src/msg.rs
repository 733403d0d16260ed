use crate::propex::{self, PropPath};
use crate::{Map, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MSG_ID: &str = "_msgid";

/// Message envelope travelling along wires.
///
/// An open mapping of property name to value. `payload` and `topic` are
/// conventional; `_msgid` is assigned when the envelope is created.
/// Cloning is a deep copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Msg {
    body: Map,
}

impl Msg {
    pub fn new() -> Self {
        let mut body = Map::new();
        body.insert(MSG_ID.to_string(), Value::String(Uuid::new_v4().to_string()));
        Self { body }
    }

    pub fn with_payload(payload: impl Into<Value>) -> Self {
        let mut msg = Self::new();
        msg.insert("payload", payload);
        msg
    }

    /// Wrap an existing mapping, assigning a `_msgid` when it has none.
    pub fn from_map(mut body: Map) -> Self {
        body.entry(MSG_ID.to_string())
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        Self { body }
    }

    /// `None` unless `value` is a JSON object.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match Value::from(value) {
            Value::Object(body) => Some(Self::from_map(body)),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.body.get(MSG_ID).and_then(Value::as_str)
    }

    pub fn payload(&self) -> Option<&Value> {
        self.body.get("payload")
    }

    pub fn topic(&self) -> Option<&Value> {
        self.body.get("topic")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.body.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.body.remove(key)
    }

    pub fn body(&self) -> &Map {
        &self.body
    }

    pub fn into_body(self) -> Map {
        self.body
    }

    pub fn get_path(&self, path: &PropPath) -> Option<&Value> {
        let keys = path.bind(Some(self))?;
        propex::lookup(&self.body, &keys)
    }

    /// Returns false when the path cannot be bound or runs through a
    /// scalar value.
    pub fn set_path(&mut self, path: &PropPath, value: Value) -> bool {
        match path.bind(Some(self)) {
            Some(keys) => propex::assign(&mut self.body, &keys, value),
            None => false,
        }
    }

    pub fn remove_path(&mut self, path: &PropPath) -> Option<Value> {
        let keys = path.bind(Some(self))?;
        propex::remove(&mut self.body, &keys)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(Value::Object(self.body.clone()))
    }
}

impl Default for Msg {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Map> for Msg {
    fn from(body: Map) -> Self {
        Self::from_map(body)
    }
}
