//! Custom JSON serializer and parser hooks
//!
//! Every value type serializes through `ToJson::to_json`. Composite types first
//! serialize their nested values (each of which may have its own hook), then
//! the hook registered for the composite type itself sees the assembled JSON.
//! A hook receives `(typed value, built JSON)` and returns the JSON to emit;
//! an absent hook passes the JSON through unchanged.
//!
//! Parser hooks run after a successful parse with `(source JSON, parsed value)`
//! and return the value to use.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// Serializer hook for values of type `T`
pub type CustomSerializer<T> = Arc<dyn Fn(&T, Value) -> Value + Send + Sync>;

/// Parser hook for values of type `T`
pub type CustomParser<T> = Arc<dyn Fn(&Value, T) -> T + Send + Sync>;

/// Registry of serializer hooks keyed by value type
#[derive(Clone, Default)]
pub struct CustomSerializers {
    hooks: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl CustomSerializers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the hook for `T`
    pub fn register<T: 'static>(
        &mut self,
        hook: impl Fn(&T, Value) -> Value + Send + Sync + 'static,
    ) {
        let hook: CustomSerializer<T> = Arc::new(hook);
        self.hooks.insert(TypeId::of::<T>(), Arc::new(hook));
    }

    /// Builder-style `register`
    pub fn with<T: 'static>(
        mut self,
        hook: impl Fn(&T, Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.register(hook);
        self
    }

    /// Run the hook for `T` over `json`, if one is registered
    pub fn apply<T: 'static>(&self, value: &T, json: Value) -> Value {
        match self
            .hooks
            .get(&TypeId::of::<T>())
            .and_then(|h| h.downcast_ref::<CustomSerializer<T>>())
        {
            Some(hook) => hook(value, json),
            None => json,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for CustomSerializers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomSerializers")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Registry of parser hooks keyed by value type
#[derive(Clone, Default)]
pub struct CustomParsers {
    hooks: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl CustomParsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: 'static>(&mut self, hook: impl Fn(&Value, T) -> T + Send + Sync + 'static) {
        let hook: CustomParser<T> = Arc::new(hook);
        self.hooks.insert(TypeId::of::<T>(), Arc::new(hook));
    }

    pub fn with<T: 'static>(mut self, hook: impl Fn(&Value, T) -> T + Send + Sync + 'static) -> Self {
        self.register(hook);
        self
    }

    /// Hook registered for `T`, if any
    pub fn get<T: 'static>(&self) -> Option<CustomParser<T>> {
        self.hooks
            .get(&TypeId::of::<T>())
            .and_then(|h| h.downcast_ref::<CustomParser<T>>())
            .cloned()
    }

    /// Run the hook for `T` over a freshly parsed value
    pub fn apply<T: 'static>(&self, json: &Value, value: T) -> T {
        match self.get::<T>() {
            Some(hook) => hook(json, value),
            None => value,
        }
    }
}

impl std::fmt::Debug for CustomParsers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomParsers")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// JSON serialization with custom hooks
///
/// The default implementation serializes with serde and applies the hook for
/// `Self`. Composite types override it to route nested values through their
/// own `to_json` first.
pub trait ToJson: Serialize + Sized + 'static {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let json = serde_json::to_value(self).unwrap_or_default();
        custom.apply(self, json)
    }
}

/// Replace `key` in a JSON object with the hooked serialization of a nested value
pub(crate) fn put_nested<T: ToJson>(json: &mut Value, key: &str, value: &T, custom: &CustomSerializers) {
    if let Value::Object(map) = json {
        map.insert(key.to_string(), value.to_json(custom));
    }
}

/// Like `put_nested` for optional values; `None` leaves the object untouched
pub(crate) fn put_nested_opt<T: ToJson>(
    json: &mut Value,
    key: &str,
    value: Option<&T>,
    custom: &CustomSerializers,
) {
    if let Some(value) = value {
        put_nested(json, key, value, custom);
    }
}

/// Like `put_nested` for lists
pub(crate) fn put_nested_list<T: ToJson>(
    json: &mut Value,
    key: &str,
    values: &[T],
    custom: &CustomSerializers,
) {
    if let Value::Object(map) = json {
        map.insert(
            key.to_string(),
            Value::Array(values.iter().map(|v| v.to_json(custom)).collect()),
        );
    }
}
