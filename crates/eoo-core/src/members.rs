//! Insertion-ordered member maps
//!
//! Overrides, protected templates, instance fields and bag fields all need
//! "iterate key/value pairs in enumeration order" plus fast lookup by name.
//! `OrderedMap` keeps entries in a `Vec` and indexes them with an `FxHashMap`.

use rustc_hash::FxHashMap;

use crate::value::{Function, Invocation, Value};
use crate::EooResult;

/// Map from member name to value that remembers insertion order
#[derive(Debug, Clone)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
    index: FxHashMap<String, usize>,
}

/// Member map used for overrides, templates and fields
pub type Members = OrderedMap<Value>;

impl<V> OrderedMap<V> {
    /// Create an empty map
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Insert or replace an entry, returning the previous value.
    ///
    /// Replacing keeps the original position in enumeration order.
    pub fn insert(&mut self, name: impl Into<String>, value: V) -> Option<V> {
        let name = name.into();
        match self.index.get(&name) {
            Some(&slot) => Some(std::mem::replace(&mut self.entries[slot].1, value)),
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Get an entry by name
    pub fn get(&self, name: &str) -> Option<&V> {
        self.index.get(name).map(|&slot| &self.entries[slot].1)
    }

    /// Check if an entry exists
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Entry names in insertion order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntoIterator for OrderedMap<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

impl Members {
    /// Builder-style insert of a plain value
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    /// Builder-style insert of a native function
    pub fn with_method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Invocation<'_>, &[Value]) -> EooResult<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let function = Function::named(name.clone(), body);
        self.insert(name, Value::Function(function));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order() {
        let members = Members::new().with("b", 1).with("a", 2).with("c", 3);
        assert_eq!(members.names(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut members = Members::new().with("x", 1).with("y", 2);
        let previous = members.insert("x", Value::from(10));

        assert_eq!(previous, Some(Value::from(1)));
        assert_eq!(members.names(), vec!["x", "y"]);
        assert_eq!(members.get("x"), Some(&Value::from(10)));
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn test_missing_entry() {
        let members = Members::new();
        assert!(members.is_empty());
        assert!(members.get("nope").is_none());
        assert!(!members.contains("nope"));
    }

    #[test]
    fn test_with_method_names_function() {
        let members = Members::new().with_method("greet", |_, _| Ok(Value::from("hi")));
        let function = members.get("greet").and_then(Value::as_function).unwrap();
        assert_eq!(function.name(), Some("greet"));
    }
}
