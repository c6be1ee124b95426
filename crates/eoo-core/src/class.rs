//! Class builder and method dispatch
//!
//! A class is a prototype (ordered member table) chained to exactly one
//! superclass. Only the root class has none. Function members are installed
//! as method slots stamped with their name and declaring class. Each slot
//! also holds a link to the implementation it overrides, resolved when the
//! slot is installed. `call_parent` follows that link, so parent lookup
//! starts above the declaring class whatever the receiver's runtime class.
//!
//! When `define_members` later installs a member on an ancestor, live
//! descendants' links for that name are re-resolved.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::instance::Instance;
use crate::members::{Members, OrderedMap};
use crate::protect::{AccessorToken, PrivateBag};
use crate::value::{Frame, Function, Invocation, Value};
use crate::{EooError, EooResult, PROTECT_KEY, RESERVED_KEYS};

static ROOT: Lazy<Class> = Lazy::new(Class::new_root);

/// Unique identifier for a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(u64);

impl ClassId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ClassId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Prototype entry
#[derive(Clone)]
pub(crate) enum Member {
    /// Plain value shared by all instances
    Value(Value),
    /// Stamped function
    Method(Arc<MethodSlot>),
}

/// Function member stamped with its declaring class
pub(crate) struct MethodSlot {
    name: String,
    owner: Weak<ClassInner>,
    owner_name: String,
    body: Function,
    /// Implementation this slot overrides
    overridden: RwLock<Option<Arc<MethodSlot>>>,
}

impl MethodSlot {
    /// Member name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Function installed in this slot
    pub fn body(&self) -> &Function {
        &self.body
    }

    /// Declaring class, if still alive
    pub fn owner(&self) -> Option<Class> {
        self.owner.upgrade().map(|inner| Class { inner })
    }

    pub(crate) fn call_parent(&self, this: &Instance, args: &[Value]) -> EooResult<Value> {
        let parent = self.overridden.read().clone();
        match parent {
            Some(slot) => {
                let body = slot.body.clone();
                body.invoke(&Invocation::new(this, Frame::Method(slot)), args)
            }
            None => Err(EooError::MissingSuperMethod {
                class: self.owner_name.clone(),
                name: self.name.clone(),
            }),
        }
    }

    pub(crate) fn hidden_bag(&self, this: &Instance) -> EooResult<PrivateBag> {
        let owner = self.owner().ok_or_else(|| {
            EooError::Runtime(format!("declaring class of {} was dropped", self.name))
        })?;
        match owner.nearest_token() {
            Some(token) => token.bag(this),
            None => Err(EooError::NoProtectedTemplate {
                class: owner.name().to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct ClassMeta {
    protect: Option<AccessorToken>,
}

pub(crate) struct ClassInner {
    id: ClassId,
    name: String,
    superclass: Option<Class>,
    prototype: RwLock<OrderedMap<Member>>,
    meta: ClassMeta,
    subclasses: Mutex<Vec<Weak<ClassInner>>>,
}

/// Handle to a class
#[derive(Clone)]
pub struct Class {
    inner: Arc<ClassInner>,
}

fn stamp(
    owner: &Weak<ClassInner>,
    owner_name: &str,
    superclass: Option<&Class>,
    name: String,
    value: Value,
) -> Member {
    match value {
        Value::Function(body) => {
            let overridden = superclass.and_then(|class| class.lookup_method(&name));
            tracing::trace!(class = owner_name, member = %name, overrides = overridden.is_some(), "install method");
            Member::Method(Arc::new(MethodSlot {
                name,
                owner: owner.clone(),
                owner_name: owner_name.to_string(),
                body,
                overridden: RwLock::new(overridden),
            }))
        }
        value => {
            tracing::trace!(class = owner_name, member = %name, "install value");
            Member::Value(value)
        }
    }
}

/// Split reserved control keys out of an override map
fn take_reserved(members: Members) -> (Vec<(String, Value)>, Option<AccessorToken>) {
    let mut public = Vec::with_capacity(members.len());
    let mut protect = None;
    for (name, value) in members {
        if RESERVED_KEYS.contains(&name.as_str()) {
            if name == PROTECT_KEY {
                if let Value::Token(token) = value {
                    protect = Some(token);
                }
            }
            continue;
        }
        public.push((name, value));
    }
    (public, protect)
}

impl Class {
    fn new_root() -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let mut prototype = OrderedMap::new();
            let constructor = Function::named("Class", |_, _| Ok(Value::Undefined));
            prototype.insert(
                "constructor",
                stamp(weak, "Class", None, "constructor".to_string(), constructor.into()),
            );
            ClassInner {
                id: ClassId::next(),
                name: "Class".to_string(),
                superclass: None,
                prototype: RwLock::new(prototype),
                meta: ClassMeta::default(),
                subclasses: Mutex::new(Vec::new()),
            }
        });
        Self { inner }
    }

    /// The root class every class descends from
    pub fn root() -> Class {
        ROOT.clone()
    }

    /// Create a class deriving from `base` (the root class when `None`).
    ///
    /// Function members are stamped as methods of the new class. A
    /// `$protect` entry holding an accessor token binds that token to the new
    /// class and is never installed as a public member.
    pub fn create(base: Option<&Class>, overrides: Members) -> EooResult<Class> {
        let name = match overrides.get("constructor") {
            Some(Value::Function(f)) => f.name().filter(|n| *n != "constructor"),
            _ => None,
        }
        .unwrap_or("anonymous")
        .to_string();
        let base = base.cloned().unwrap_or_else(Class::root);
        Self::build(name, &base, overrides, None)
    }

    /// Start a typed class definition
    pub fn builder(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name)
    }

    fn build(
        name: String,
        base: &Class,
        overrides: Members,
        explicit_protect: Option<AccessorToken>,
    ) -> EooResult<Class> {
        let (public, reserved_protect) = take_reserved(overrides);
        let protect = match (explicit_protect, reserved_protect) {
            (Some(explicit), Some(reserved)) if explicit.id() != reserved.id() => {
                return Err(EooError::ConflictingProtect { class: name });
            }
            (explicit, reserved) => explicit.or(reserved),
        };

        if let Some(bound) = protect.as_ref().and_then(AccessorToken::bound_class_name) {
            return Err(EooError::TokenAlreadyBound {
                class: bound.to_string(),
            });
        }

        let inner = Arc::new_cyclic(|weak| {
            let mut prototype = OrderedMap::new();
            for (member, value) in public {
                let stamped = stamp(weak, &name, Some(base), member.clone(), value);
                prototype.insert(member, stamped);
            }
            ClassInner {
                id: ClassId::next(),
                name,
                superclass: Some(base.clone()),
                prototype: RwLock::new(prototype),
                meta: ClassMeta {
                    protect: protect.clone(),
                },
                subclasses: Mutex::new(Vec::new()),
            }
        });
        let class = Class { inner };
        base.register_subclass(&class);

        if let Some(token) = &protect {
            token.bind(&class, base.nearest_token())?;
        }

        tracing::debug!(
            class = %class.inner.name,
            id = class.inner.id.0,
            superclass = %base.inner.name,
            protected = protect.is_some(),
            "class created"
        );
        Ok(class)
    }

    /// Class identity
    pub fn id(&self) -> ClassId {
        self.inner.id
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Superclass (`$superClass`); `None` only for the root class
    pub fn superclass(&self) -> Option<&Class> {
        self.inner.superclass.as_ref()
    }

    /// Check if this is the root class
    pub fn is_root(&self) -> bool {
        self.inner.superclass.is_none()
    }

    /// Check if two handles refer to the same class
    pub fn ptr_eq(a: &Class, b: &Class) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Check if this class is `other` or descends from it
    pub fn is_subclass_of(&self, other: &Class) -> bool {
        self.ancestors().any(|class| class.id() == other.id())
    }

    /// This class followed by each superclass up to the root
    pub fn ancestors(&self) -> impl Iterator<Item = &Class> {
        std::iter::successors(Some(self), |class| class.superclass())
    }

    /// Whether this class was built with a protected template
    pub fn has_protected_template(&self) -> bool {
        self.inner.meta.protect.is_some()
    }

    /// Names of members declared directly on this class, in install order
    pub fn own_member_names(&self) -> Vec<String> {
        self.inner.prototype.read().names()
    }

    /// Read a member through the prototype chain
    pub fn get(&self, name: &str) -> Option<Value> {
        self.lookup(name).map(|member| match member {
            Member::Value(value) => value,
            Member::Method(slot) => Value::Function(slot.body.clone()),
        })
    }

    /// Class that declared the member `name` reachable from this class
    pub fn declaring_class_of(&self, name: &str) -> Option<Class> {
        self.ancestors()
            .find(|class| class.inner.prototype.read().contains(name))
            .cloned()
    }

    /// Construct an instance and run the nearest `constructor`
    pub fn construct(&self, args: &[Value]) -> EooResult<Instance> {
        let instance = Instance::alloc(self.clone());
        match self.lookup("constructor") {
            Some(Member::Method(slot)) => {
                let body = slot.body.clone();
                body.invoke(&Invocation::new(&instance, Frame::Method(slot)), args)?;
            }
            Some(Member::Value(_)) => {
                return Err(EooError::NotAFunction {
                    class: self.inner.name.clone(),
                    name: "constructor".to_string(),
                });
            }
            None => {}
        }
        Ok(instance)
    }

    /// Attach members after creation with the same stamping as `create`.
    ///
    /// Existing members are replaced silently. Reserved keys are skipped.
    pub fn define_members(&self, members: Members) -> EooResult<()> {
        let weak = Arc::downgrade(&self.inner);
        let superclass = self.superclass();
        let mut staged = Vec::with_capacity(members.len());
        for (name, value) in members {
            if RESERVED_KEYS.contains(&name.as_str()) {
                tracing::debug!(class = %self.inner.name, key = %name, "skip reserved key");
                continue;
            }
            let member = stamp(&weak, &self.inner.name, superclass, name.clone(), value);
            staged.push((name, member));
        }

        let mut names = Vec::with_capacity(staged.len());
        {
            let mut prototype = self.inner.prototype.write();
            for (name, member) in staged {
                prototype.insert(name.clone(), member);
                names.push(name);
            }
        }

        for name in &names {
            self.relink_descendants(name);
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Member> {
        self.ancestors()
            .find_map(|class| class.inner.prototype.read().get(name).cloned())
    }

    pub(crate) fn lookup_method(&self, name: &str) -> Option<Arc<MethodSlot>> {
        match self.lookup(name) {
            Some(Member::Method(slot)) => Some(slot),
            _ => None,
        }
    }

    /// Token declared by this class or, failing that, the nearest ancestor
    pub(crate) fn nearest_token(&self) -> Option<AccessorToken> {
        self.ancestors()
            .find_map(|class| class.inner.meta.protect.clone())
    }

    pub(crate) fn downgrade(&self) -> Weak<ClassInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ClassInner>) -> Option<Class> {
        weak.upgrade().map(|inner| Class { inner })
    }

    fn register_subclass(&self, child: &Class) {
        let mut subclasses = self.inner.subclasses.lock();
        subclasses.retain(|weak| weak.strong_count() > 0);
        subclasses.push(child.downgrade());
    }

    fn live_subclasses(&self) -> Vec<Class> {
        self.inner
            .subclasses
            .lock()
            .iter()
            .filter_map(Class::upgrade)
            .collect()
    }

    fn relink_descendants(&self, name: &str) {
        for child in self.live_subclasses() {
            let own = child.inner.prototype.read().get(name).cloned();
            if let Some(Member::Method(slot)) = own {
                let parent = child.superclass().and_then(|class| class.lookup_method(name));
                *slot.overridden.write() = parent;
                tracing::trace!(class = %child.inner.name, member = name, "relink method");
            }
            child.relink_descendants(name);
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lookup("constructor") {
            Some(Member::Method(slot)) => write!(f, "{}", slot.body),
            Some(Member::Value(value)) => write!(f, "{}", value),
            None => write!(f, "function {}() {{ [native code] }}", self.inner.name),
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.inner.id.0)
            .field("name", &self.inner.name)
            .field("superclass", &self.superclass().map(Class::name))
            .field("members", &self.own_member_names())
            .finish()
    }
}

/// Attach members to a class given as a dynamic value.
///
/// Fails with `TypeMismatch` before touching anything if `target` is not a
/// class.
pub fn define_members(target: &Value, members: Members) -> EooResult<()> {
    match target {
        Value::Class(class) => class.define_members(members),
        other => Err(EooError::TypeMismatch {
            expected: "class".to_string(),
            got: other.type_name().to_string(),
        }),
    }
}

/// Typed class definition
pub struct ClassBuilder {
    name: String,
    base: Option<Class>,
    members: Members,
    protect: Option<AccessorToken>,
}

impl ClassBuilder {
    /// Create a builder for a class named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            members: Members::new(),
            protect: None,
        }
    }

    /// Set the superclass (defaults to the root class)
    pub fn extends(mut self, base: &Class) -> Self {
        self.base = Some(base.clone());
        self
    }

    /// Add a plain public member
    pub fn member(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.members.insert(name, value.into());
        self
    }

    /// Add a public method
    pub fn method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Invocation<'_>, &[Value]) -> EooResult<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let function = Function::named(name.clone(), body);
        self.members.insert(name, Value::Function(function));
        self
    }

    /// Set the constructor
    pub fn constructor<F>(mut self, body: F) -> Self
    where
        F: Fn(&Invocation<'_>, &[Value]) -> EooResult<Value> + Send + Sync + 'static,
    {
        let function = Function::named(self.name.clone(), body);
        self.members.insert("constructor", Value::Function(function));
        self
    }

    /// Bind a protected-member token to the class
    ///
    /// Building fails with `ConflictingProtect` if the members also carry a
    /// different token under `$protect`.
    pub fn protect(mut self, token: &AccessorToken) -> Self {
        self.protect = Some(token.clone());
        self
    }

    /// Build the class
    pub fn build(self) -> EooResult<Class> {
        let base = self.base.unwrap_or_else(Class::root);
        Class::build(self.name, &base, self.members, self.protect)
    }
}
