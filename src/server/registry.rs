//! Lazily populated per-entity handler registry
//!
//! Maps an entity key (account code, device id) to a sub-handler and the
//! private route table it mounted. An entry is created at most once per key
//! and is never removed; the sub-handler's own init/uninit state is what
//! toggles between active and inactive.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::Method;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use super::dispatch::HandlerFn;

/// Registry errors. None of them leave an entry behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid registry key: {0:?}")]
    InvalidKey(String),

    #[error("failed to construct handlers for {key}: {message}")]
    Construction { key: String, message: String },
}

/// A sub-handler that owns a route subtree.
pub trait SubHandler: Send + Sync + 'static {
    /// Register this handler's routes, relative to its prefix.
    fn mount(self: &Arc<Self>, routes: &mut SubRouter);
}

/// Exact-match route table for one registry entry.
#[derive(Default, Clone)]
pub struct SubRouter {
    routes: HashMap<(Method, String), HandlerFn>,
}

impl SubRouter {
    pub fn get(&mut self, path: &str, f: HandlerFn) -> &mut Self {
        self.add(Method::GET, path, f)
    }

    pub fn post(&mut self, path: &str, f: HandlerFn) -> &mut Self {
        self.add(Method::POST, path, f)
    }

    pub fn add(&mut self, method: Method, path: &str, f: HandlerFn) -> &mut Self {
        self.routes.insert((method, normalize(path)), f);
        self
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Option<&HandlerFn> {
        self.routes.get(&(method.clone(), normalize(path)))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for SubRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .routes
            .keys()
            .map(|(m, p)| format!("{} {}", m, p))
            .collect();
        keys.sort();
        f.debug_list().entries(keys).finish()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// One registered entity: its handler and the routes mounted for it.
pub struct RegistryEntry<H> {
    key: String,
    prefix: String,
    handler: Arc<H>,
    routes: SubRouter,
}

impl<H> RegistryEntry<H> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Absolute path prefix of this entry's subtree.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn routes(&self) -> &SubRouter {
        &self.routes
    }
}

type Factory<H> = Box<dyn Fn(&str) -> Result<H, RegistryError> + Send + Sync>;

/// Create-once, never-evict map from entity key to [`RegistryEntry`].
pub struct HandlerRegistry<H: SubHandler> {
    base: String,
    entries: RwLock<HashMap<String, Arc<RegistryEntry<H>>>>,
    factory: Factory<H>,
}

impl<H: SubHandler> HandlerRegistry<H> {
    /// `base` is the path the key is appended to, e.g. `/api/account`.
    pub fn new<F>(base: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str) -> Result<H, RegistryError> + Send + Sync + 'static,
    {
        Self {
            base: base.into(),
            entries: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Return the entry for `key`, constructing and mounting it on first use.
    ///
    /// Concurrent callers for the same key all receive the same entry and the
    /// factory runs exactly once. A factory error is returned to the caller
    /// and nothing is stored, so a later call retries.
    pub fn get_or_create(&self, key: &str) -> Result<Arc<RegistryEntry<H>>, RegistryError> {
        if let Some(entry) = self.lookup(key) {
            return Ok(entry);
        }
        validate_key(key)?;

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            return Ok(Arc::clone(entry));
        }

        let handler = Arc::new((self.factory)(key)?);
        let mut routes = SubRouter::default();
        handler.mount(&mut routes);
        let entry = Arc::new(RegistryEntry {
            key: key.to_string(),
            prefix: format!("{}/{}", self.base, key),
            handler,
            routes,
        });
        entries.insert(key.to_string(), Arc::clone(&entry));
        debug!(
            target: "gateway",
            prefix = %entry.prefix,
            routes = entry.routes.len(),
            "mounted handler subtree"
        );
        Ok(entry)
    }

    /// Return the entry for `key` without creating one.
    pub fn lookup(&self, key: &str) -> Option<Arc<RegistryEntry<H>>> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

fn validate_key(key: &str) -> Result<(), RegistryError> {
    if key.is_empty() || key.contains('/') || key.chars().any(char::is_control) {
        return Err(RegistryError::InvalidKey(key.to_string()));
    }
    Ok(())
}
