//! Host-side object table and the proxy protocol.
//!
//! Native objects are exposed to script through integer handles. A handle is
//! allocated the first time an object crosses the process boundary, either
//! because it was registered under a name and looked up, or because it was
//! reached as a nested property. Handles stay valid until session teardown.

use crate::bridge::error::BridgeError;
use crate::bridge::promise::AsyncCall;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Result of reading a member of a proxy object.
pub enum PropertyValue {
    /// JSON payload of a readable property.
    Value(String),
    /// Callable member.
    Function { asynchronous: bool },
    /// Nested proxy object.
    Object(Arc<dyn NativeProxy>),
    /// Unknown member.
    Undefined,
}

/// Deferred start of an asynchronous native call.
pub type AsyncStart = Box<dyn FnOnce(AsyncCall) + Send + 'static>;

/// Result of applying a function member.
pub enum ApplyOutcome {
    /// Completed synchronously with a JSON payload.
    Value(String),
    /// Completes later through the [`AsyncCall`] passed to the start closure.
    Pending(AsyncStart),
    /// The native call raised an error.
    Failed(String),
    /// No function with that name.
    NotApplicable,
}

/// A host object that script may read, write and call.
pub trait NativeProxy: Send + Sync + 'static {
    fn get(&self, name: &str) -> PropertyValue;

    /// Returns false when the member is unknown or read-only.
    fn set(&self, name: &str, json: &str) -> bool;

    fn apply(&self, name: &str, args: &str) -> ApplyOutcome;
}

/// Body of a get-property request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRequest {
    pub object_id: i64,
    pub name: String,
}

/// Body of a set-property request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPropertyRequest {
    pub object_id: i64,
    pub name: String,
    pub value: String,
}

/// Body of a call-method request. `call_id` is present for promise calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub object_id: i64,
    pub name: String,
    pub args: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// Wire form of [`PropertyValue`] with nested objects replaced by handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PropertyReply {
    Value { data: String },
    Function { asynchronous: bool },
    Object { id: i64 },
    Undefined,
}

/// Wire form of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallReply {
    Value { data: String },
    Pending,
}

struct Handles {
    by_id: HashMap<i64, Arc<dyn NativeProxy>>,
    // Arc address -> handle, so the same object keeps one identity.
    by_ptr: HashMap<usize, i64>,
    named: HashMap<String, Arc<dyn NativeProxy>>,
}

/// Handle table owned by one host facade.
pub struct ObjectRegistry {
    next_id: AtomicI64,
    handles: Mutex<Handles>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn ptr_key(object: &Arc<dyn NativeProxy>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            handles: Mutex::new(Handles {
                by_id: HashMap::new(),
                by_ptr: HashMap::new(),
                named: HashMap::new(),
            }),
        }
    }

    /// Register a top-level object under `name`.
    ///
    /// Returns an error if the name is already taken.
    pub fn register(&self, name: &str, object: Arc<dyn NativeProxy>) -> Result<(), BridgeError> {
        let mut handles = self.handles.lock();
        if handles.named.contains_key(name) {
            return Err(BridgeError::Protocol(format!(
                "object '{}' is already registered",
                name
            )));
        }
        handles.named.insert(name.to_string(), object);
        tracing::debug!(name, "registered native object");
        Ok(())
    }

    /// Remove a name. Handles already handed out stay resolvable.
    pub fn unregister(&self, name: &str) -> bool {
        self.handles.lock().named.remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handles.lock().named.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.lock().named.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a named object to its handle, allocating it on first use.
    pub fn lookup(&self, name: &str) -> Result<i64, BridgeError> {
        let object = self
            .handles
            .lock()
            .named
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::ObjectNotFound(format!("'{}'", name)))?;
        Ok(self.expose(object))
    }

    /// Handle for `object`, allocated lazily and reused afterwards.
    pub fn expose(&self, object: Arc<dyn NativeProxy>) -> i64 {
        let key = ptr_key(&object);
        let mut handles = self.handles.lock();
        if let Some(id) = handles.by_ptr.get(&key) {
            return *id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        handles.by_ptr.insert(key, id);
        handles.by_id.insert(id, object);
        tracing::trace!(object_id = id, "allocated object handle");
        id
    }

    pub fn resolve(&self, id: i64) -> Result<Arc<dyn NativeProxy>, BridgeError> {
        self.handles
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| BridgeError::ObjectNotFound(format!("#{}", id)))
    }

    /// Read a member; nested objects come back as handles.
    pub fn get(&self, id: i64, name: &str) -> Result<PropertyReply, BridgeError> {
        let object = self.resolve(id)?;
        Ok(match object.get(name) {
            PropertyValue::Value(data) => PropertyReply::Value { data },
            PropertyValue::Function { asynchronous } => PropertyReply::Function { asynchronous },
            PropertyValue::Object(child) => PropertyReply::Object {
                id: self.expose(child),
            },
            PropertyValue::Undefined => PropertyReply::Undefined,
        })
    }

    pub fn set(&self, id: i64, name: &str, json: &str) -> Result<bool, BridgeError> {
        let object = self.resolve(id)?;
        Ok(object.set(name, json))
    }

    pub fn apply(&self, id: i64, name: &str, args: &str) -> Result<ApplyOutcome, BridgeError> {
        let object = self.resolve(id)?;
        Ok(object.apply(name, args))
    }

    /// Number of allocated handles.
    pub fn handle_count(&self) -> usize {
        self.handles.lock().by_id.len()
    }

    /// Drop every handle and name; session teardown only.
    pub fn clear(&self) {
        let mut handles = self.handles.lock();
        handles.by_id.clear();
        handles.by_ptr.clear();
        handles.named.clear();
    }
}
