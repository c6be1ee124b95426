//! Class instances
//!
//! An instance owns two kinds of state:
//! - its public fields, readable and writable by anyone holding the instance
//! - a bag table keyed by accessor token id, reachable only from the
//!   `protect` module
//!
//! Nothing on the public surface (`get`, `keys`, `Debug`) looks at the bag
//! table, so hidden members never leak through an instance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::class::{Class, Member};
use crate::members::Members;
use crate::protect::{PrivateBag, TokenId};
use crate::value::{Frame, Invocation, Value};
use crate::{EooError, EooResult};

/// Unique identifier for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        InstanceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

pub(crate) struct InstanceInner {
    id: InstanceId,
    class: Class,
    fields: RwLock<Members>,
    bags: Mutex<FxHashMap<TokenId, PrivateBag>>,
}

/// Handle to a class instance
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl Instance {
    /// Allocate an instance without running any constructor
    pub(crate) fn alloc(class: Class) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                id: InstanceId::next(),
                class,
                fields: RwLock::new(Members::new()),
                bags: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Instance identity
    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    /// Class the instance was constructed from (`$self`)
    pub fn class(&self) -> &Class {
        &self.inner.class
    }

    /// Check if the instance was constructed from `class` or a descendant
    pub fn is_instance_of(&self, class: &Class) -> bool {
        self.inner.class.is_subclass_of(class)
    }

    /// Check if two handles refer to the same instance
    pub fn ptr_eq(a: &Instance, b: &Instance) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Read a property: own field first, then the class's prototype chain.
    ///
    /// Methods are returned as plain functions; calling one obtained this
    /// way runs it without a method frame.
    pub fn get(&self, name: &str) -> Value {
        if let Some(value) = self.inner.fields.read().get(name) {
            return value.clone();
        }
        match self.inner.class.lookup(name) {
            Some(Member::Value(value)) => value,
            Some(Member::Method(slot)) => Value::Function(slot.body().clone()),
            None => Value::Undefined,
        }
    }

    /// Write an own field. Shadows any same-named prototype member.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.fields.write().insert(name, value.into());
    }

    /// Check for an own field
    pub fn has_own(&self, name: &str) -> bool {
        self.inner.fields.read().contains(name)
    }

    /// Own field names in insertion order
    pub fn keys(&self) -> Vec<String> {
        self.inner.fields.read().names()
    }

    /// Call a member by name with this instance as receiver
    pub fn call(&self, name: &str, args: &[Value]) -> EooResult<Value> {
        let own = self.inner.fields.read().get(name).cloned();
        if let Some(value) = own {
            return match value {
                Value::Function(function) => function.call(self, args),
                _ => Err(self.not_a_function(name)),
            };
        }
        match self.inner.class.lookup(name) {
            Some(Member::Method(slot)) => {
                let body = slot.body().clone();
                body.invoke(&Invocation::new(self, Frame::Method(slot)), args)
            }
            _ => Err(self.not_a_function(name)),
        }
    }

    fn not_a_function(&self, name: &str) -> EooError {
        EooError::NotAFunction {
            class: self.inner.class.name().to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<InstanceInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<InstanceInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn existing_bag(&self, token: TokenId) -> Option<PrivateBag> {
        self.inner.bags.lock().get(&token).cloned()
    }

    /// Return the bag stored for `token`, storing `create()` first if absent.
    ///
    /// Check and insert happen under one lock, so racing callers all observe
    /// the same bag.
    pub(crate) fn bag_or_insert_with(
        &self,
        token: TokenId,
        create: impl FnOnce() -> PrivateBag,
    ) -> PrivateBag {
        self.inner.bags.lock().entry(token).or_insert_with(create).clone()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.inner.id.0)
            .field("class", &self.inner.class.name())
            .field("fields", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_fields_shadow_prototype() {
        let class = Class::builder("Point").member("x", 1).build().unwrap();
        let point = class.construct(&[]).unwrap();

        assert_eq!(point.get("x"), Value::from(1));
        assert!(!point.has_own("x"));

        point.set("x", 10);
        assert_eq!(point.get("x"), Value::from(10));
        assert_eq!(class.get("x"), Some(Value::from(1)));
        assert_eq!(point.keys(), vec!["x"]);
    }

    #[test]
    fn test_missing_property_is_undefined() {
        let class = Class::builder("Empty").build().unwrap();
        let instance = class.construct(&[]).unwrap();
        assert!(instance.get("nothing").is_undefined());
    }

    #[test]
    fn test_call_non_function_fails() {
        let class = Class::builder("Point").member("x", 1).build().unwrap();
        let point = class.construct(&[]).unwrap();

        let err = point.call("x", &[]).unwrap_err();
        assert!(matches!(err, EooError::NotAFunction { ref name, .. } if name == "x"));
        assert!(point.call("missing", &[]).is_err());
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let class = Class::builder("Point").build().unwrap();
        let a = class.construct(&[]).unwrap();
        let b = class.construct(&[]).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(Instance::ptr_eq(&a, &a.clone()));
        assert!(!Instance::ptr_eq(&a, &b));
    }
}
