//! Layered context storage shared between nodes.
//!
//! Entries are addressed by scope (a flow or global), store name and key
//! path. Every store keeps its own scopes apart and serialises access with
//! its own lock.

use crate::propex::{self, PathKey, PropPath};
use crate::{ElementId, Map, Msg, NodeError, PropexError, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextScope {
    Flow(ElementId),
    Global,
}

impl fmt::Display for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextScope::Flow(id) => write!(f, "flow:{id}"),
            ContextScope::Global => f.write_str("global"),
        }
    }
}

/// A context key with optional store qualifier: `count`, `#:(file)::a.b`
#[derive(Debug, Clone, PartialEq)]
pub struct ContextKey {
    store: Option<String>,
    path: PropPath,
}

impl ContextKey {
    pub fn parse(text: &str) -> Result<Self, PropexError> {
        let text = text.trim();
        if let Some(rest) = text.strip_prefix("#:(") {
            let Some((store, key)) = rest.split_once(")::") else {
                return Err(PropexError::BadSyntax {
                    expr: text.to_string(),
                    offset: 0,
                    reason: "store qualifier must look like #:(name)::key",
                });
            };
            let store = store.trim();
            return Ok(Self {
                store: (!store.is_empty()).then(|| store.to_string()),
                path: PropPath::parse(key)?,
            });
        }
        Ok(Self {
            store: None,
            path: PropPath::parse(text)?,
        })
    }

    pub fn store(&self) -> Option<&str> {
        self.store.as_deref()
    }

    pub fn path(&self) -> &PropPath {
        &self.path
    }
}

impl FromStr for ContextKey {
    type Err = PropexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "module", rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    /// JSON files under `dir/<store name>/`, written through on every change
    Localfilesystem { dir: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    #[serde(default = "default_store_name")]
    pub default_store: String,
    #[serde(default)]
    pub stores: HashMap<String, StoreKind>,
}

fn default_store_name() -> String {
    "memory".to_string()
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            default_store: default_store_name(),
            stores: HashMap::new(),
        }
    }
}

/// One named store
pub struct Store {
    name: String,
    dir: Option<PathBuf>,
    scopes: RwLock<HashMap<ContextScope, Map>>,
}

impl Store {
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: None,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    /// Open a file-backed store, loading whatever an earlier run persisted.
    pub async fn open(name: impl Into<String>, base: &Path) -> Result<Self, NodeError> {
        let name = name.into();
        let dir = base.join(&name);
        let io_err = |e: std::io::Error| NodeError::Context {
            store: name.clone(),
            reason: e.to_string(),
        };
        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;

        let mut scopes = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let file_name = entry.file_name();
            let Some(scope) = file_name.to_str().and_then(scope_from_file) else {
                continue;
            };
            let bytes = tokio::fs::read(entry.path()).await.map_err(io_err)?;
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => {
                    scopes.insert(scope, map);
                }
                _ => {
                    return Err(NodeError::Context {
                        store: name.clone(),
                        reason: format!("{} does not hold a JSON object", entry.path().display()),
                    })
                }
            }
        }
        info!(store = %name, dir = %dir.display(), scopes = scopes.len(), "Opened file context store");

        Ok(Self {
            name,
            dir: Some(dir),
            scopes: RwLock::new(scopes),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, scope: ContextScope, keys: &[PathKey]) -> Option<Value> {
        let scopes = self.scopes.read().await;
        propex::lookup(scopes.get(&scope)?, keys).cloned()
    }

    /// Write or, with `None`, delete an entry. The change is applied to a
    /// copy of the scope and only kept once it has been persisted, so a
    /// failed write leaves the store as it was.
    pub async fn set(&self, scope: ContextScope, keys: &[PathKey], value: Option<Value>) -> Result<(), NodeError> {
        let mut scopes = self.scopes.write().await;
        let mut map = scopes.get(&scope).cloned().unwrap_or_default();
        match value {
            Some(value) => {
                if !propex::assign(&mut map, keys, value) {
                    return Err(NodeError::Context {
                        store: self.name.clone(),
                        reason: format!("cannot write {} in {scope}", describe(keys)),
                    });
                }
            }
            None => {
                propex::remove(&mut map, keys);
            }
        }
        if let Some(dir) = &self.dir {
            self.persist(dir, scope, &map).await?;
        }
        debug!(store = %self.name, %scope, key = %describe(keys), "Context updated");
        scopes.insert(scope, map);
        Ok(())
    }

    /// Top-level keys present in `scope`
    pub async fn keys(&self, scope: ContextScope) -> Vec<String> {
        let scopes = self.scopes.read().await;
        scopes
            .get(&scope)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn persist(&self, dir: &Path, scope: ContextScope, map: &Map) -> Result<(), NodeError> {
        let err = |reason: String| NodeError::Context {
            store: self.name.clone(),
            reason,
        };
        let bytes =
            serde_json::to_vec_pretty(&Value::Object(map.clone())).map_err(|e| err(e.to_string()))?;
        tokio::fs::write(dir.join(scope_file(scope)), bytes)
            .await
            .map_err(|e| err(e.to_string()))
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

fn describe(keys: &[PathKey]) -> String {
    keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}

fn scope_file(scope: ContextScope) -> String {
    match scope {
        ContextScope::Global => "global.json".to_string(),
        ContextScope::Flow(id) => format!("flow-{id}.json"),
    }
}

fn scope_from_file(file: &str) -> Option<ContextScope> {
    let stem = file.strip_suffix(".json")?;
    if stem == "global" {
        return Some(ContextScope::Global);
    }
    stem.strip_prefix("flow-")?.parse().ok().map(ContextScope::Flow)
}

/// All stores of one engine
pub struct ContextStore {
    default_store: String,
    stores: RwLock<HashMap<String, Arc<Store>>>,
}

impl ContextStore {
    /// Only the memory-backed default store
    pub fn in_memory() -> Self {
        let default_store = default_store_name();
        let mut stores = HashMap::new();
        stores.insert(default_store.clone(), Arc::new(Store::memory(default_store.clone())));
        Self {
            default_store,
            stores: RwLock::new(stores),
        }
    }

    pub async fn from_settings(settings: &ContextSettings) -> Result<Self, NodeError> {
        let mut stores = HashMap::new();
        for (name, kind) in &settings.stores {
            let store = match kind {
                StoreKind::Memory => Store::memory(name.clone()),
                StoreKind::Localfilesystem { dir } => Store::open(name.clone(), dir).await?,
            };
            stores.insert(name.clone(), Arc::new(store));
        }
        stores
            .entry(settings.default_store.clone())
            .or_insert_with(|| Arc::new(Store::memory(settings.default_store.clone())));
        Ok(Self {
            default_store: settings.default_store.clone(),
            stores: RwLock::new(stores),
        })
    }

    pub fn default_store_name(&self) -> &str {
        &self.default_store
    }

    /// Resolve a store by name. A name nobody configured gets its own
    /// memory store on first use.
    pub async fn store(&self, name: Option<&str>) -> Arc<Store> {
        let name = name.unwrap_or(&self.default_store);
        if let Some(store) = self.stores.read().await.get(name) {
            return store.clone();
        }
        let mut stores = self.stores.write().await;
        stores
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(store = %name, "Creating unconfigured context store in memory");
                Arc::new(Store::memory(name))
            })
            .clone()
    }

    /// Read `key` from `scope`; nested `[msg.x]` indices bind against `msg`.
    pub async fn get(&self, scope: ContextScope, key: &ContextKey, msg: Option<&Msg>) -> Option<Value> {
        let keys = key.path.bind(msg)?;
        self.store(key.store()).await.get(scope, &keys).await
    }

    pub async fn set(
        &self,
        scope: ContextScope,
        key: &ContextKey,
        msg: Option<&Msg>,
        value: Option<Value>,
    ) -> Result<(), NodeError> {
        let store = self.store(key.store()).await;
        let keys = key.path.bind(msg).ok_or_else(|| NodeError::Context {
            store: store.name().to_string(),
            reason: format!("key '{}' did not resolve against the message", key.path),
        })?;
        store.set(scope, &keys, value).await
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> ContextKey {
        text.parse().unwrap()
    }

    #[test]
    fn parses_store_qualifier() {
        let k = key("#:(file)::a.b");
        assert_eq!(k.store(), Some("file"));
        assert_eq!(k.path().as_str(), "a.b");
        assert_eq!(key("count").store(), None);
        assert!(ContextKey::parse("#:(file)a").is_err());
    }

    #[test]
    fn settings_deserialize() {
        let settings: ContextSettings = serde_json::from_value(serde_json::json!({
            "default_store": "mem",
            "stores": {
                "mem": {"module": "memory"},
                "disk": {"module": "localfilesystem", "dir": "/tmp/ctx"}
            }
        }))
        .unwrap();
        assert_eq!(settings.default_store, "mem");
        assert_eq!(
            settings.stores["disk"],
            StoreKind::Localfilesystem { dir: "/tmp/ctx".into() }
        );
    }

    #[tokio::test]
    async fn scopes_and_stores_are_isolated() {
        let ctx = ContextStore::in_memory();
        let flow_a = ContextScope::Flow(ElementId::new(1));
        let flow_b = ContextScope::Flow(ElementId::new(2));

        ctx.set(flow_a, &key("n"), None, Some(Value::from(1.0))).await.unwrap();
        ctx.set(ContextScope::Global, &key("#:(other)::n"), None, Some(Value::from(2.0)))
            .await
            .unwrap();

        assert_eq!(ctx.get(flow_a, &key("n"), None).await, Some(Value::Number(1.0)));
        assert_eq!(ctx.get(flow_b, &key("n"), None).await, None);
        assert_eq!(ctx.get(ContextScope::Global, &key("n"), None).await, None);
        assert_eq!(ctx.get(flow_a, &key("#:(other)::n"), None).await, None);
        assert_eq!(
            ctx.get(ContextScope::Global, &key("#:(other)::n"), None).await,
            Some(Value::Number(2.0))
        );
    }

    #[tokio::test]
    async fn setting_none_deletes() {
        let ctx = ContextStore::in_memory();
        let scope = ContextScope::Global;
        ctx.set(scope, &key("a.b"), None, Some(Value::from("x"))).await.unwrap();
        ctx.set(scope, &key("a.b"), None, None).await.unwrap();
        assert_eq!(ctx.get(scope, &key("a.b"), None).await, None);
        assert_eq!(ctx.store(None).await.keys(scope).await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ContextSettings::default();
        settings.stores.insert(
            "file".into(),
            StoreKind::Localfilesystem { dir: dir.path().to_path_buf() },
        );
        let scope = ContextScope::Flow(ElementId::new(0x10));

        let ctx = ContextStore::from_settings(&settings).await.unwrap();
        ctx.set(scope, &key("#:(file)::count"), None, Some(Value::from(3.0)))
            .await
            .unwrap();
        drop(ctx);

        assert!(dir.path().join("file").join("flow-0000000000000010.json").exists());
        let reopened = ContextStore::from_settings(&settings).await.unwrap();
        assert_eq!(
            reopened.get(scope, &key("#:(file)::count"), None).await,
            Some(Value::Number(3.0))
        );
    }

    #[tokio::test]
    async fn failed_persist_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ContextSettings::default();
        settings.stores.insert(
            "file".into(),
            StoreKind::Localfilesystem { dir: dir.path().to_path_buf() },
        );
        let scope = ContextScope::Flow(ElementId::new(0x10));
        let ctx = ContextStore::from_settings(&settings).await.unwrap();
        ctx.set(scope, &key("#:(file)::count"), None, Some(Value::from(3.0)))
            .await
            .unwrap();

        // a directory in place of the scope files makes every write fail
        let store_dir = dir.path().join("file");
        let flow_file = store_dir.join("flow-0000000000000010.json");
        std::fs::remove_file(&flow_file).unwrap();
        std::fs::create_dir(&flow_file).unwrap();
        std::fs::create_dir(store_dir.join("global.json")).unwrap();

        let result = ctx
            .set(scope, &key("#:(file)::count"), None, Some(Value::from(4.0)))
            .await;
        assert!(matches!(result, Err(NodeError::Context { .. })));
        assert_eq!(
            ctx.get(scope, &key("#:(file)::count"), None).await,
            Some(Value::Number(3.0))
        );

        let result = ctx
            .set(ContextScope::Global, &key("#:(file)::fresh"), None, Some(Value::from(1.0)))
            .await;
        assert!(result.is_err());
        assert_eq!(ctx.get(ContextScope::Global, &key("#:(file)::fresh"), None).await, None);
    }
}
