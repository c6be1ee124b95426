//! Protected members
//!
//! `declare_protected` turns a template of hidden members into an
//! `AccessorToken`. Binding the token to a class (through
//! `ClassBuilder::protect` or the `$protect` key) links it to the nearest
//! ancestor class's token. Calling `token.bag(instance)` then yields the
//! instance's `PrivateBag` for that class level.
//!
//! # Storage
//!
//! Bags live inside the instance they belong to, keyed by the token's id.
//! The bag table has no public accessor on `Instance`, and token ids cannot
//! be forged, so a token (or a method running on the class) is the only way
//! in. Each bag also records the instance it was built for.
//!
//! # Resolution
//!
//! ```text
//! bag(Sub1).get(k):  Sub1 bag fields -> Sub1 template -> Sub template -> Super template
//! bag(Sub1).parent():  bag(Sub) for the same instance
//! ```
//!
//! Fields written through an ancestor's bag are not visible from a
//! descendant's bag; only templates are inherited.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::class::{Class, ClassId, ClassInner};
use crate::instance::{Instance, InstanceId, InstanceInner};
use crate::members::Members;
use crate::value::{Frame, Invocation, Value};
use crate::{EooError, EooResult};

/// Unique identifier for an accessor token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(u64);

impl TokenId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TokenId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// What a token does when asked for the bag of an instance that was not
/// constructed by its bound class or a descendant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForeignAccess {
    /// Create the bag on demand
    #[default]
    Adopt,
    /// Fail with `ForeignInstance` (or `UnboundToken` before binding)
    Reject,
}

/// Options for a protected-member declaration
#[derive(Debug, Clone, Default)]
pub struct ProtectOptions {
    /// Policy for instances outside the bound class's hierarchy
    pub foreign_access: ForeignAccess,
}

impl ProtectOptions {
    /// Options that reject foreign and pre-binding access
    pub fn strict() -> Self {
        Self {
            foreign_access: ForeignAccess::Reject,
        }
    }
}

struct Binding {
    class: Weak<ClassInner>,
    class_id: ClassId,
    class_name: String,
    parent: Option<AccessorToken>,
}

struct TokenInner {
    id: TokenId,
    template: Members,
    options: ProtectOptions,
    binding: OnceCell<Binding>,
}

/// Capability mapping an instance to its private bag for one class level
#[derive(Clone)]
pub struct AccessorToken {
    inner: Arc<TokenInner>,
}

/// Declare a protected template with default options
pub fn declare_protected(template: Members) -> AccessorToken {
    AccessorToken::new(template)
}

/// Declare a protected template with explicit options
pub fn declare_protected_with(template: Members, options: ProtectOptions) -> AccessorToken {
    AccessorToken::with_options(template, options)
}

impl AccessorToken {
    /// Create an unbound token for `template`
    pub fn new(template: Members) -> Self {
        Self::with_options(template, ProtectOptions::default())
    }

    /// Create an unbound token with explicit options
    pub fn with_options(template: Members, options: ProtectOptions) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                id: TokenId::next(),
                template,
                options,
                binding: OnceCell::new(),
            }),
        }
    }

    /// Token identity
    pub fn id(&self) -> TokenId {
        self.inner.id
    }

    /// Options the token was declared with
    pub fn options(&self) -> &ProtectOptions {
        &self.inner.options
    }

    /// Names declared by this token's own template, in declaration order
    pub fn template_names(&self) -> Vec<String> {
        self.inner.template.names()
    }

    /// Check if the token has been bound to a class
    pub fn is_bound(&self) -> bool {
        self.inner.binding.get().is_some()
    }

    /// Class the token is bound to, if bound and still alive
    pub fn bound_class(&self) -> Option<Class> {
        self.inner
            .binding
            .get()
            .and_then(|binding| Class::upgrade(&binding.class))
    }

    /// Token of the nearest ancestor class that declared one
    pub fn parent(&self) -> Option<&AccessorToken> {
        self.inner
            .binding
            .get()
            .and_then(|binding| binding.parent.as_ref())
    }

    /// Private bag of `instance` for this class level.
    ///
    /// The first call for an instance creates the bag (and the ancestor
    /// levels' bags it links to). Later calls return the same bag.
    pub fn bag(&self, instance: &Instance) -> EooResult<PrivateBag> {
        if let Some(bag) = instance.existing_bag(self.inner.id) {
            debug_assert_eq!(bag.instance_id(), instance.id());
            return Ok(bag);
        }

        self.check_access(instance)?;

        let parent = match self.parent() {
            Some(token) => Some(token.bag(instance)?),
            None => None,
        };
        Ok(instance.bag_or_insert_with(self.inner.id, || {
            tracing::trace!(
                token = self.inner.id.0,
                instance = instance.id().as_u64(),
                "create private bag"
            );
            PrivateBag::new(self.clone(), instance, parent)
        }))
    }

    pub(crate) fn bound_class_name(&self) -> Option<&str> {
        self.inner
            .binding
            .get()
            .map(|binding| binding.class_name.as_str())
    }

    pub(crate) fn bind(&self, class: &Class, parent: Option<AccessorToken>) -> EooResult<()> {
        let binding = Binding {
            class: class.downgrade(),
            class_id: class.id(),
            class_name: class.name().to_string(),
            parent,
        };
        self.inner
            .binding
            .set(binding)
            .map_err(|_| EooError::TokenAlreadyBound {
                class: self.bound_class_name().unwrap_or_default().to_string(),
            })?;
        tracing::debug!(
            token = self.inner.id.0,
            class = %class.name(),
            parent = ?self.parent().map(|token| token.inner.id.0),
            "bind protected template"
        );
        Ok(())
    }

    fn check_access(&self, instance: &Instance) -> EooResult<()> {
        let policy = self.inner.options.foreign_access;
        match self.inner.binding.get() {
            Some(binding) => {
                if instance
                    .class()
                    .ancestors()
                    .any(|class| class.id() == binding.class_id)
                {
                    return Ok(());
                }
                match policy {
                    ForeignAccess::Adopt => {
                        tracing::debug!(
                            token = self.inner.id.0,
                            class = %instance.class().name(),
                            expected = %binding.class_name,
                            "adopt foreign instance"
                        );
                        Ok(())
                    }
                    ForeignAccess::Reject => Err(EooError::ForeignInstance {
                        class: instance.class().name().to_string(),
                        expected: binding.class_name.clone(),
                    }),
                }
            }
            None => match policy {
                ForeignAccess::Adopt => Ok(()),
                ForeignAccess::Reject => Err(EooError::UnboundToken),
            },
        }
    }

    fn level_name(&self) -> String {
        self.bound_class_name().unwrap_or("<unbound>").to_string()
    }
}

impl fmt::Debug for AccessorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessorToken")
            .field("id", &self.inner.id.0)
            .field("class", &self.bound_class_name())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Private bags
// ============================================================================

struct BagInner {
    token: AccessorToken,
    instance_id: InstanceId,
    instance: Weak<InstanceInner>,
    fields: RwLock<Members>,
    parent: Option<PrivateBag>,
}

/// Per-instance, per-class-level hidden storage
#[derive(Clone)]
pub struct PrivateBag {
    inner: Arc<BagInner>,
}

impl PrivateBag {
    fn new(token: AccessorToken, instance: &Instance, parent: Option<PrivateBag>) -> Self {
        Self {
            inner: Arc::new(BagInner {
                token,
                instance_id: instance.id(),
                instance: instance.downgrade(),
                fields: RwLock::new(Members::new()),
                parent,
            }),
        }
    }

    /// Instance this bag was built for
    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    /// Check if this bag belongs to `instance`
    pub fn belongs_to(&self, instance: &Instance) -> bool {
        self.inner.instance_id == instance.id()
    }

    /// Check if two handles refer to the same bag
    pub fn ptr_eq(a: &PrivateBag, b: &PrivateBag) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Bag of the ancestor level for the same instance (`$super`)
    pub fn parent(&self) -> Option<&PrivateBag> {
        self.inner.parent.as_ref()
    }

    /// Read a hidden member: own fields, then this level's template, then
    /// ancestor templates
    pub fn get(&self, name: &str) -> Value {
        self.resolve(name)
            .map(|(value, _)| value)
            .unwrap_or_default()
    }

    /// Write a hidden field on this level
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.fields.write().insert(name, value.into());
    }

    /// Check if a hidden member is visible from this level
    pub fn has(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Fields written through this bag, in insertion order
    pub fn own_keys(&self) -> Vec<String> {
        self.inner.fields.read().names()
    }

    /// Every hidden name visible from this level, most specific first
    pub fn names(&self) -> Vec<String> {
        let mut names = self.own_keys();
        let mut level = Some(self);
        while let Some(bag) = level {
            for name in bag.inner.token.inner.template.names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            level = bag.parent();
        }
        names
    }

    /// Call a hidden member with the bag's instance as receiver
    pub fn call(&self, name: &str, args: &[Value]) -> EooResult<Value> {
        match self.resolve(name) {
            Some((Value::Function(function), declaring)) => {
                let this = self.instance()?;
                let frame = Frame::Hidden {
                    bag: declaring,
                    name: name.to_string(),
                };
                function.invoke(&Invocation::new(&this, frame), args)
            }
            _ => Err(EooError::NotAFunction {
                class: self.inner.token.level_name(),
                name: name.to_string(),
            }),
        }
    }

    pub(crate) fn token(&self) -> &AccessorToken {
        &self.inner.token
    }

    pub(crate) fn call_parent(&self, name: &str, args: &[Value]) -> EooResult<Value> {
        let missing = || EooError::MissingSuperMethod {
            class: self.inner.token.level_name(),
            name: name.to_string(),
        };
        let parent = self.parent().ok_or_else(missing)?;
        match parent.resolve(name) {
            Some((Value::Function(_), _)) => parent.call(name, args),
            _ => Err(missing()),
        }
    }

    fn instance(&self) -> EooResult<Instance> {
        self.inner
            .instance
            .upgrade()
            .map(Instance::from_inner)
            .ok_or(EooError::DetachedBag)
    }

    /// Find `name` and the bag whose level declared it
    fn resolve(&self, name: &str) -> Option<(Value, PrivateBag)> {
        if let Some(value) = self.inner.fields.read().get(name) {
            return Some((value.clone(), self.clone()));
        }
        let mut level = Some(self);
        while let Some(bag) = level {
            if let Some(value) = bag.inner.token.inner.template.get(name) {
                return Some((value.clone(), bag.clone()));
            }
            level = bag.parent();
        }
        None
    }
}

impl fmt::Debug for PrivateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateBag")
            .field("token", &self.inner.token.inner.id.0)
            .field("instance", &self.inner.instance_id.as_u64())
            .field("fields", &self.own_keys())
            .finish()
    }
}
