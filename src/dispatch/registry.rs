//! Method registry built from independently registered modules.
//!
//! Modules are folded in ascending priority; when two modules register the
//! same target URI the higher priority wins, and at equal priority the module
//! registered later wins. Every shadowed handler is logged and kept in
//! [`Registry::overrides`] so conflicts are visible at startup.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{info, warn};

use super::context::Call;
use crate::error::HandlerError;
use crate::protocol::Value;

pub const DEFAULT_PRIORITY: i32 = 0;

/// A callable method. `S` is the shared application state.
pub trait Handler<S>: Send + Sync {
    fn call(&self, call: &Call<'_>, state: &S) -> Result<Value, HandlerError>;
}

impl<S, F> Handler<S> for F
where
    F: Fn(&Call<'_>, &S) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, call: &Call<'_>, state: &S) -> Result<Value, HandlerError> {
        self(call, state)
    }
}

type SharedHandler<S> = Arc<dyn Handler<S>>;

/// The methods one module contributes, keyed by target URI.
pub struct ModuleHandlers<S> {
    routes: IndexMap<String, SharedHandler<S>>,
}

impl<S> Default for ModuleHandlers<S> {
    fn default() -> Self {
        Self {
            routes: IndexMap::new(),
        }
    }
}

impl<S: 'static> ModuleHandlers<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure or function under `target_uri`.
    pub fn route<F>(self, target_uri: &str, handler: F) -> Self
    where
        F: Fn(&Call<'_>, &S) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.route_handler(target_uri, handler)
    }

    /// Register any [`Handler`] implementation under `target_uri`.
    pub fn route_handler<H>(mut self, target_uri: &str, handler: H) -> Self
    where
        H: Handler<S> + 'static,
    {
        self.routes.insert(target_uri.to_owned(), Arc::new(handler));
        self
    }

    /// Expose an already registered method under a second name.
    pub fn alias(mut self, alias: &str, target_uri: &str) -> Self {
        match self.routes.get(target_uri).cloned() {
            Some(handler) => {
                self.routes.insert(alias.to_owned(), handler);
            }
            None => warn!(alias, target_uri, "alias points at an unregistered method, ignored"),
        }
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A resolved method together with where it came from.
pub struct HandlerEntry<S> {
    pub module: String,
    pub priority: i32,
    handler: SharedHandler<S>,
}

impl<S> HandlerEntry<S> {
    pub fn invoke(&self, call: &Call<'_>, state: &S) -> Result<Value, HandlerError> {
        self.handler.call(call, state)
    }
}

/// Record of one handler shadowing another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub target_uri: String,
    pub winner: String,
    pub winner_priority: i32,
    pub shadowed: String,
    pub shadowed_priority: i32,
}

struct Registration<S> {
    name: String,
    priority: i32,
    handlers: ModuleHandlers<S>,
}

pub struct RegistryBuilder<S> {
    modules: Vec<Registration<S>>,
}

impl<S> Default for RegistryBuilder<S> {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
        }
    }
}

impl<S: 'static> RegistryBuilder<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(mut self, name: &str, priority: i32, handlers: ModuleHandlers<S>) -> Self {
        self.modules.push(Registration {
            name: name.to_owned(),
            priority,
            handlers,
        });
        self
    }

    /// Run a module's registration function and add what it returns.
    pub fn register<F>(self, name: &str, priority: i32, register: F) -> Self
    where
        F: FnOnce() -> ModuleHandlers<S>,
    {
        self.module(name, priority, register())
    }

    pub fn build(self) -> Registry<S> {
        let mut modules = self.modules;
        // Stable: equal priorities keep registration order, so later modules win.
        modules.sort_by_key(|m| m.priority);

        let module_count = modules.len();
        let mut entries: HashMap<String, HandlerEntry<S>> = HashMap::new();
        let mut overrides = Vec::new();

        for module in modules {
            for (target_uri, handler) in module.handlers.routes {
                let entry = HandlerEntry {
                    module: module.name.clone(),
                    priority: module.priority,
                    handler,
                };
                if let Some(previous) = entries.insert(target_uri.clone(), entry) {
                    info!(
                        target_uri = %target_uri,
                        winner = %module.name,
                        shadowed = %previous.module,
                        "handler override"
                    );
                    overrides.push(Override {
                        target_uri,
                        winner: module.name.clone(),
                        winner_priority: module.priority,
                        shadowed: previous.module,
                        shadowed_priority: previous.priority,
                    });
                }
            }
        }

        info!(
            modules = module_count,
            methods = entries.len(),
            overrides = overrides.len(),
            "registry built"
        );

        Registry { entries, overrides }
    }
}

/// Immutable method table, safe to share across workers.
pub struct Registry<S> {
    entries: HashMap<String, HandlerEntry<S>>,
    overrides: Vec<Override>,
}

impl<S: 'static> Registry<S> {
    pub fn builder() -> RegistryBuilder<S> {
        RegistryBuilder::new()
    }
}

impl<S> Registry<S> {
    pub fn lookup(&self, target_uri: &str) -> Option<&HandlerEntry<S>> {
        self.entries.get(target_uri)
    }

    pub fn contains(&self, target_uri: &str) -> bool {
        self.entries.contains_key(target_uri)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    pub fn target_uris(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
