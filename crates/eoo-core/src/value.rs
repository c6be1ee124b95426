//! Dynamic values, native functions and invocation contexts
//!
//! Members, fields and arguments are all `Value`s. Callable members are
//! `Function`s: reference-counted native closures that receive an
//! `Invocation` describing the receiver and the frame they run in.
//!
//! # Frames
//!
//! ```text
//! Free    function called directly (Function::call, extracted members)
//! Method  public member installed on a class; knows its declaring class
//! Hidden  protected member called through a private bag; knows its bag
//! ```
//!
//! The frame is what `call_parent` and `hidden` resolve against, so parent
//! lookup never depends on the receiver's runtime class.

use std::fmt;
use std::sync::Arc;

use crate::class::{Class, MethodSlot};
use crate::instance::Instance;
use crate::protect::{AccessorToken, PrivateBag};
use crate::{EooError, EooResult};

/// Native function body
pub type NativeFn = dyn Fn(&Invocation<'_>, &[Value]) -> EooResult<Value> + Send + Sync;

/// Dynamic value
#[derive(Clone, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Undefined,
    /// Explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// Number (double precision)
    Number(f64),
    /// Immutable string
    String(Arc<str>),
    /// Callable
    Function(Function),
    /// Class instance
    Object(Instance),
    /// Class
    Class(Class),
    /// Protected-member accessor token
    Token(AccessorToken),
}

impl Value {
    /// Name of the value's dynamic type
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
            Value::Class(_) => "class",
            Value::Token(_) => "token",
        }
    }

    /// Check if this value is undefined
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Check if this value is callable
    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    /// Extract boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract number value
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Extract string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract function value
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Extract instance value
    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Object(instance) => Some(instance),
            _ => None,
        }
    }

    /// Extract class value
    pub fn as_class(&self) -> Option<&Class> {
        match self {
            Value::Class(class) => Some(class),
            _ => None,
        }
    }

    /// Extract accessor token value
    pub fn as_token(&self) -> Option<&AccessorToken> {
        match self {
            Value::Token(token) => Some(token),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Function::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Instance::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => a.id() == b.id(),
            (Value::Token(a), Value::Token(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Function(func) => write!(f, "Function({})", func.name().unwrap_or("anonymous")),
            Value::Object(instance) => write!(f, "{:?}", instance),
            Value::Class(class) => write!(f, "Class({})", class.name()),
            Value::Token(token) => write!(f, "AccessorToken(#{})", token.id().as_u64()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Function(func) => write!(f, "{}", func),
            Value::Class(class) => write!(f, "{}", class),
            Value::Object(instance) => write!(f, "[object {}]", instance.class().name()),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Instance> for Value {
    fn from(instance: Instance) -> Self {
        Value::Object(instance)
    }
}

impl From<Class> for Value {
    fn from(class: Class) -> Self {
        Value::Class(class)
    }
}

impl From<AccessorToken> for Value {
    fn from(token: AccessorToken) -> Self {
        Value::Token(token)
    }
}

// ============================================================================
// Functions
// ============================================================================

struct FunctionInner {
    name: Option<String>,
    source: Option<String>,
    body: Arc<NativeFn>,
}

/// Reference-counted native function
///
/// Identity is by allocation: two `Function`s are equal only if they are
/// clones of the same function.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    /// Create an anonymous function
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&Invocation<'_>, &[Value]) -> EooResult<Value> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner {
                name: None,
                source: None,
                body: Arc::new(body),
            }),
        }
    }

    /// Create a named function
    pub fn named<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Invocation<'_>, &[Value]) -> EooResult<Value> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner {
                name: Some(name.into()),
                source: None,
                body: Arc::new(body),
            }),
        }
    }

    /// Attach source text, used when the function is rendered as a string.
    ///
    /// Returns a new function sharing the same body.
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FunctionInner {
                name: self.inner.name.clone(),
                source: Some(source.into()),
                body: self.inner.body.clone(),
            }),
        }
    }

    /// Function name, if any
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Check if two handles refer to the same function
    pub fn ptr_eq(a: &Function, b: &Function) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Call the function with `this` as receiver and no method frame.
    ///
    /// `call_parent` and `hidden` fail with `NoMethodContext` inside such a
    /// call.
    pub fn call(&self, this: &Instance, args: &[Value]) -> EooResult<Value> {
        self.invoke(&Invocation::new(this, Frame::Free), args)
    }

    pub(crate) fn invoke(&self, invocation: &Invocation<'_>, args: &[Value]) -> EooResult<Value> {
        (self.inner.body)(invocation, args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.source {
            Some(source) => write!(f, "{}", source),
            None => write!(
                f,
                "function {}() {{ [native code] }}",
                self.inner.name.as_deref().unwrap_or("")
            ),
        }
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// Frame a function runs in
#[derive(Clone)]
pub(crate) enum Frame {
    /// Direct call, no declaring class
    Free,
    /// Public member of a class
    Method(Arc<MethodSlot>),
    /// Protected member reached through a bag
    Hidden {
        /// Bag of the token whose template declared the member
        bag: PrivateBag,
        /// Member name
        name: String,
    },
}

/// Context handed to every native function call
pub struct Invocation<'a> {
    this: &'a Instance,
    frame: Frame,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(this: &'a Instance, frame: Frame) -> Self {
        Self { this, frame }
    }

    /// Receiver of the call
    pub fn this(&self) -> &Instance {
        self.this
    }

    /// Name of the member being executed, if called as a member
    pub fn method_name(&self) -> Option<&str> {
        match &self.frame {
            Frame::Free => None,
            Frame::Method(slot) => Some(slot.name()),
            Frame::Hidden { name, .. } => Some(name.as_str()),
        }
    }

    /// Class whose definition attached the running member.
    ///
    /// For protected members this is the class the declaring token is bound to.
    pub fn declaring_class(&self) -> Option<Class> {
        match &self.frame {
            Frame::Free => None,
            Frame::Method(slot) => slot.owner(),
            Frame::Hidden { bag, .. } => bag.token().bound_class(),
        }
    }

    /// Invoke the implementation this member overrides.
    ///
    /// For public methods this is the same-named member above the declaring
    /// class. For protected members it is the same-named member in the
    /// parent bag.
    pub fn call_parent(&self, args: &[Value]) -> EooResult<Value> {
        match &self.frame {
            Frame::Free => Err(EooError::NoMethodContext),
            Frame::Method(slot) => slot.call_parent(self.this, args),
            Frame::Hidden { bag, name } => bag.call_parent(name, args),
        }
    }

    /// Private bag visible to the running member.
    ///
    /// Public methods see the bag of the nearest protected template on their
    /// declaring class's chain. Protected members see the bag of the token
    /// that declared them.
    pub fn hidden(&self) -> EooResult<PrivateBag> {
        match &self.frame {
            Frame::Free => Err(EooError::NoMethodContext),
            Frame::Method(slot) => slot.hidden_bag(self.this),
            Frame::Hidden { bag, .. } => Ok(bag.clone()),
        }
    }
}
