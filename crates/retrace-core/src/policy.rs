//! Interception policy and capability dispatch.
//!
//! The engine never decides which operations are non-deterministic. A
//! [`PolicyTable`] supplied by the embedder maps capability names to a
//! [`Directive`]:
//!
//! - `"time.time"`: an exact capability (function or method)
//! - `"socket.socket"`: a type, covering every method (`"socket.socket.recv"`)
//!   and every live object of that type returned from an intercepted call
//!
//! Types first seen at runtime have no entry. The [`Dispatcher`] resolves
//! them once (exact entry, then the receiver's type, then the generic
//! fallback) and caches the answer, so a proxy for a never-declared type
//! still intercepts every method call made through it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use retrace_types::{CallError, ObjRef, Result, Value};
use retrace_wire::ExternalResolver;
use serde::{Deserialize, Serialize};

use crate::session::Session;

/// Outcome of the live operation, or its recorded substitute.
pub type CallResult = std::result::Result<Value, CallError>;

/// Live implementation handed to the engine for one crossing.
pub type LiveCall<'a> = &'a mut dyn FnMut(&CallDescriptor) -> CallResult;

/// How a capability crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    /// Execute and capture when recording; substitute when replaying.
    Intercept,
    /// Deterministic value type: always run live, never traced. Live
    /// objects of this type are snapshotted by value.
    Immutable,
    /// Process-global object bound by identity under the capability name.
    Bind,
    /// Hand the crossing to a named shim.
    Custom(String),
}

/// One boundary crossing.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    /// Capability key, e.g. `"random.random"` or `"socket.socket.recv"`.
    pub capability: String,
    /// Receiver type for method calls.
    pub receiver: Option<String>,
    pub args: Vec<Value>,
}

impl CallDescriptor {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            receiver: None,
            args: Vec::new(),
        }
    }

    /// Method call on an object; the receiver becomes the first argument.
    pub fn method(receiver: &ObjRef, method: &str) -> Self {
        Self {
            capability: format!("{}.{}", receiver.type_name(), method),
            receiver: Some(receiver.type_name().to_string()),
            args: vec![Value::Object(receiver.clone())],
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Identity-free form stored in call checkpoints.
    pub fn normalized(&self) -> Value {
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(Value::Str(self.capability.clone()));
        items.extend(self.args.iter().map(Value::normalized));
        Value::List(items)
    }
}

impl fmt::Display for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.capability)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Custom handling for a capability that needs more than the generic
/// execute/substitute split.
pub trait Shim: Send + Sync {
    fn call(&self, session: &Session, call: &CallDescriptor, live: LiveCall<'_>) -> Result<CallResult>;
}

/// Declarative capability table plus registered shims.
#[derive(Clone, Default)]
pub struct PolicyTable {
    directives: HashMap<String, Directive>,
    shims: HashMap<String, Arc<dyn Shim>>,
    fallback: Option<Directive>,
}

impl fmt::Debug for PolicyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut shims: Vec<&String> = self.shims.keys().collect();
        shims.sort();
        f.debug_struct("PolicyTable")
            .field("directives", &self.directives)
            .field("shims", &shims)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{ "capability": directive, ... }` JSON.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let directives: HashMap<String, Directive> = serde_json::from_str(text)?;
        Ok(Self {
            directives,
            ..Self::default()
        })
    }

    pub fn with(mut self, capability: impl Into<String>, directive: Directive) -> Self {
        self.directives.insert(capability.into(), directive);
        self
    }

    pub fn with_shim(mut self, name: impl Into<String>, shim: Arc<dyn Shim>) -> Self {
        self.shims.insert(name.into(), shim);
        self
    }

    /// Directive for capabilities with no entry (default: `Intercept`).
    pub fn with_fallback(mut self, directive: Directive) -> Self {
        self.fallback = Some(directive);
        self
    }

    pub fn get(&self, capability: &str) -> Option<&Directive> {
        self.directives.get(capability)
    }

    pub fn shim(&self, name: &str) -> Option<Arc<dyn Shim>> {
        self.shims.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

/// Lazily-built capability → directive cache over a [`PolicyTable`].
pub struct Dispatcher {
    table: PolicyTable,
    resolved: RwLock<HashMap<String, Directive>>,
}

impl Dispatcher {
    pub fn new(table: PolicyTable) -> Self {
        Self {
            table,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &PolicyTable {
        &self.table
    }

    /// Directive for a crossing.
    pub fn resolve(&self, call: &CallDescriptor) -> Directive {
        if let Some(hit) = self.resolved.read().get(&call.capability) {
            return hit.clone();
        }
        let directive = self
            .table
            .get(&call.capability)
            .or_else(|| call.receiver.as_deref().and_then(|t| self.table.get(t)))
            .or_else(|| {
                // "module.Type.method" without an explicit receiver
                call.capability
                    .rsplit_once('.')
                    .and_then(|(owner, _)| self.table.get(owner))
            })
            .cloned()
            .unwrap_or_else(|| self.fallback());
        self.resolved
            .write()
            .entry(call.capability.clone())
            .or_insert(directive)
            .clone()
    }

    /// Directive for a live object of `type_name` leaving an intercepted call.
    pub fn resolve_type(&self, type_name: &str) -> Directive {
        let key = format!("type:{}", type_name);
        if let Some(hit) = self.resolved.read().get(&key) {
            return hit.clone();
        }
        let directive = self
            .table
            .get(type_name)
            .cloned()
            .unwrap_or(Directive::Intercept);
        self.resolved.write().entry(key).or_insert(directive).clone()
    }

    fn fallback(&self) -> Directive {
        self.table.fallback.clone().unwrap_or(Directive::Intercept)
    }

    /// Number of capabilities resolved so far.
    pub fn cached(&self) -> usize {
        self.resolved.read().len()
    }
}

/// Process-global objects addressable by key, used to resolve EXT_BIND.
#[derive(Default)]
pub struct ExternalRegistry {
    objects: RwLock<HashMap<String, ObjRef>>,
}

impl ExternalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, object: ObjRef) {
        self.objects.write().insert(key.into(), object);
    }

    pub fn get(&self, key: &str) -> Option<ObjRef> {
        self.objects.read().get(key).cloned()
    }

    /// Copy for a forked child.
    pub fn snapshot(&self) -> Self {
        Self {
            objects: RwLock::new(self.objects.read().clone()),
        }
    }
}

impl ExternalResolver for ExternalRegistry {
    fn resolve(&self, key: &str) -> Option<ObjRef> {
        self.get(key)
    }
}
