//! eoo core
//!
//! Classical single-inheritance classes over a dynamic value model:
//! - Class builder with declaration-site `call_parent` dispatch
//! - Protected members: per-class templates reachable only through an
//!   accessor token, stored per instance and chained across the hierarchy
//! - Instances with a public property surface that never exposes hidden state
//!
//! ```ignore
//! let hidden = declare_protected(Members::new().with("counter", 5));
//! let token = hidden.clone();
//! let base = Class::builder("Super")
//!     .method("bump", move |inv, _| {
//!         let bag = token.bag(inv.this())?;
//!         let next = bag.get("counter").as_number().unwrap_or(0.0) + 1.0;
//!         bag.set("counter", next);
//!         Ok(Value::from(next))
//!     })
//!     .protect(&hidden)
//!     .build()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod class;
pub mod instance;
pub mod members;
pub mod protect;
pub mod value;

pub use class::{define_members, Class, ClassBuilder, ClassId};
pub use instance::{Instance, InstanceId};
pub use members::{Members, OrderedMap};
pub use protect::{
    declare_protected, declare_protected_with, AccessorToken, ForeignAccess, PrivateBag,
    ProtectOptions, TokenId,
};
pub use value::{Function, Invocation, NativeFn, Value};

/// Override key carrying a protected template into `Class::create`
pub const PROTECT_KEY: &str = "$protect";

/// Keys never installed as public members
pub const RESERVED_KEYS: &[&str] = &[PROTECT_KEY];

/// Object model errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EooError {
    /// Wrong kind of value passed where a class was expected
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected type name
        expected: String,
        /// Actual type name
        got: String,
    },

    /// `call_parent` found nothing callable above the declaring class
    #[error("Call the super class's {name}, but it is not a function (declared in {class})")]
    MissingSuperMethod {
        /// Declaring class of the caller
        class: String,
        /// Member name
        name: String,
    },

    /// Member is absent or not callable
    #[error("{class}.{name} is not a function")]
    NotAFunction {
        /// Class (or protected level) the lookup started from
        class: String,
        /// Member name
        name: String,
    },

    /// `call_parent` or `hidden` used outside a member call
    #[error("No method context: function was not called as a class member")]
    NoMethodContext,

    /// `hidden` used by a method whose class chain declares no protected template
    #[error("Class {class} has no protected template")]
    NoProtectedTemplate {
        /// Declaring class of the caller
        class: String,
    },

    /// Class definition names two different protected templates
    #[error("Class {class} declares more than one protected template")]
    ConflictingProtect {
        /// Class being defined
        class: String,
    },

    /// Token already belongs to a class
    #[error("Protected template is already bound to class {class}")]
    TokenAlreadyBound {
        /// Class the token is bound to
        class: String,
    },

    /// Strict token used before it was bound to a class
    #[error("Protected template is not bound to any class")]
    UnboundToken,

    /// Strict token used on an instance outside its class hierarchy
    #[error("Instance of {class} was not constructed by {expected} or a subclass")]
    ForeignInstance {
        /// Class of the instance
        class: String,
        /// Class the token is bound to
        expected: String,
    },

    /// Hidden member called after its instance was dropped
    #[error("Private bag outlived its instance")]
    DetachedBag,

    /// Error raised by a member body
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<String> for EooError {
    fn from(s: String) -> Self {
        EooError::Runtime(s)
    }
}

impl From<&str> for EooError {
    fn from(s: &str) -> Self {
        EooError::Runtime(s.to_string())
    }
}

/// Object model result
pub type EooResult<T> = Result<T, EooError>;
