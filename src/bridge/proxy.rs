//! Default [`NativeProxy`]: a map of named members built up front.

use crate::bridge::promise::AsyncCall;
use crate::bridge::registry::{ApplyOutcome, NativeProxy, PropertyValue};
use std::collections::HashMap;
use std::sync::Arc;

pub type Getter = Arc<dyn Fn() -> String + Send + Sync>;
pub type Setter = Arc<dyn Fn(&str) + Send + Sync>;
pub type SyncFunction = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;
pub type AsyncFunction = Arc<dyn Fn(&str, AsyncCall) + Send + Sync>;

/// Capability attached to a member name.
#[derive(Clone)]
pub enum Member {
    Property {
        getter: Getter,
        setter: Option<Setter>,
    },
    Function(SyncFunction),
    AsyncFunction(AsyncFunction),
    Child(Arc<dyn NativeProxy>),
}

/// Proxy object backed by a member map.
///
/// ```ignore
/// let math = DynamicProxy::builder()
///     .property("pi", || "3.14159".to_string())
///     .function("add", |args| add(args))
///     .async_function("delayedAdd", |args, call| spawn_add(args, call))
///     .build();
/// ```
#[derive(Clone, Default)]
pub struct DynamicProxy {
    members: HashMap<String, Member>,
}

impl DynamicProxy {
    pub fn builder() -> DynamicProxyBuilder {
        DynamicProxyBuilder::default()
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn member_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.members.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl NativeProxy for DynamicProxy {
    fn get(&self, name: &str) -> PropertyValue {
        match self.members.get(name) {
            Some(Member::Property { getter, .. }) => PropertyValue::Value(getter()),
            Some(Member::Function(_)) => PropertyValue::Function {
                asynchronous: false,
            },
            Some(Member::AsyncFunction(_)) => PropertyValue::Function { asynchronous: true },
            Some(Member::Child(child)) => PropertyValue::Object(child.clone()),
            None => PropertyValue::Undefined,
        }
    }

    fn set(&self, name: &str, json: &str) -> bool {
        match self.members.get(name) {
            Some(Member::Property {
                setter: Some(setter),
                ..
            }) => {
                setter(json);
                true
            }
            _ => false,
        }
    }

    fn apply(&self, name: &str, args: &str) -> ApplyOutcome {
        match self.members.get(name) {
            Some(Member::Function(function)) => match function(args) {
                Ok(value) => ApplyOutcome::Value(value),
                Err(message) => ApplyOutcome::Failed(message),
            },
            Some(Member::AsyncFunction(function)) => {
                let function = function.clone();
                let args = args.to_string();
                ApplyOutcome::Pending(Box::new(move |call| function(&args, call)))
            }
            _ => ApplyOutcome::NotApplicable,
        }
    }
}

#[derive(Default)]
pub struct DynamicProxyBuilder {
    members: HashMap<String, Member>,
}

impl DynamicProxyBuilder {
    /// Read-only property.
    pub fn property<G>(mut self, name: &str, getter: G) -> Self
    where
        G: Fn() -> String + Send + Sync + 'static,
    {
        self.members.insert(
            name.to_string(),
            Member::Property {
                getter: Arc::new(getter),
                setter: None,
            },
        );
        self
    }

    pub fn read_write_property<G, S>(mut self, name: &str, getter: G, setter: S) -> Self
    where
        G: Fn() -> String + Send + Sync + 'static,
        S: Fn(&str) + Send + Sync + 'static,
    {
        self.members.insert(
            name.to_string(),
            Member::Property {
                getter: Arc::new(getter),
                setter: Some(Arc::new(setter)),
            },
        );
        self
    }

    /// Synchronous function: JSON arguments in, JSON result out.
    pub fn function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.members
            .insert(name.to_string(), Member::Function(Arc::new(function)));
        self
    }

    /// Asynchronous function settled later through its [`AsyncCall`].
    pub fn async_function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&str, AsyncCall) + Send + Sync + 'static,
    {
        self.members
            .insert(name.to_string(), Member::AsyncFunction(Arc::new(function)));
        self
    }

    /// Nested proxy object reachable by property name.
    pub fn child(mut self, name: &str, object: Arc<dyn NativeProxy>) -> Self {
        self.members.insert(name.to_string(), Member::Child(object));
        self
    }

    pub fn build(self) -> DynamicProxy {
        DynamicProxy {
            members: self.members,
        }
    }
}
