use indexmap::IndexMap;
use luabridge_vm::Value;

use crate::error::{Error, Result};
use crate::object::{Object, TableRef};
use crate::runtime::Runtime;
use crate::table_map::{KeyPolicy, TableMap, TableSource};

/// Accepts only non-empty string keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringKey;

impl KeyPolicy<String> for StringKey {
    fn to_foreign(&self, _runtime: &Runtime, key: &String) -> Result<Value> {
        Ok(Value::string(key))
    }

    fn convert_key(&self, _runtime: &Runtime, key: Value) -> String {
        match key {
            Value::String(s) => s.to_string(),
            other => other.to_string(),
        }
    }

    fn check_key(&self, key: &String) -> Result<()> {
        check_name(key)
    }

    fn is_filtered(&self) -> bool {
        true
    }

    fn accept_key(&self, key: &Value) -> bool {
        matches!(key, Value::String(s) if !s.is_empty())
    }
}

fn check_name(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("empty string".to_string()));
    }
    Ok(())
}

/// A string-keyed view over the global namespace or another table.
pub type Bindings = TableMap<String, StringKey>;

impl TableMap<String, StringKey> {
    /// The live global namespace of `runtime`.
    pub fn globals(runtime: &Runtime) -> Self {
        Self::with_policy(runtime, TableSource::Globals, StringKey)
    }

    /// Bindings backed by a fresh, empty table.
    pub fn create(runtime: &Runtime) -> Self {
        let table = TableRef::create(runtime);
        Self::with_policy(runtime, TableSource::Table(table.id()), StringKey)
    }

    pub fn is_globals_of(&self, runtime: &Runtime) -> bool {
        self.source() == TableSource::Globals && self.runtime().ptr_eq(runtime)
    }
}

/// Host-side bindings kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimpleBindings {
    map: IndexMap<String, Object>,
}

impl SimpleBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Object> {
        self.map.get(key)
    }

    /// Stores `value` under `key`; nil removes the key.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Object>) -> Result<Option<Object>> {
        let key = key.into();
        check_name(&key)?;
        let value = value.into();
        if value.is_nil() {
            return Ok(self.map.shift_remove(&key));
        }
        Ok(self.map.insert(key, value))
    }

    pub fn remove(&mut self, key: &str) -> Option<Object> {
        self.map.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Object)> {
        self.map.iter()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Builds bindings from `(name, value)` pairs, failing on the first
    /// empty name.
    pub fn try_from_pairs<K, V, I>(pairs: I) -> Result<Self>
    where
        K: Into<String>,
        V: Into<Object>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut bindings = SimpleBindings::new();
        for (k, v) in pairs {
            bindings.put(k, v)?;
        }
        Ok(bindings)
    }
}

/// A bindings set attached to a script context.
#[derive(Clone)]
pub enum Scope {
    Live(Bindings),
    Simple(SimpleBindings),
}

impl Scope {
    /// Current name/value pairs, in iteration order.
    pub fn pairs(&self) -> Result<Vec<(String, Object)>> {
        match self {
            Scope::Live(b) => b.snapshot(),
            Scope::Simple(b) => Ok(b.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Object>> {
        match self {
            Scope::Live(b) => b.get(key),
            Scope::Simple(b) => Ok(b.get(key).cloned()),
        }
    }

    pub fn put(&mut self, key: &str, value: impl Into<Object>) -> Result<Option<Object>> {
        match self {
            Scope::Live(b) => b.put(key, value),
            Scope::Simple(b) => b.put(key, value),
        }
    }

    pub fn is_globals_of(&self, runtime: &Runtime) -> bool {
        matches!(self, Scope::Live(b) if b.is_globals_of(runtime))
    }
}

impl From<Bindings> for Scope {
    fn from(b: Bindings) -> Self {
        Scope::Live(b)
    }
}

impl From<SimpleBindings> for Scope {
    fn from(b: SimpleBindings) -> Self {
        Scope::Simple(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn globals_hide_non_string_keys() {
        let rt = Runtime::bare();
        rt.enter(|state| {
            state.load(b"x = 1; y = 'two'", "g").unwrap();
            state.call(0, Some(0)).unwrap();
            state.push_globals();
            state.push_number(1.0);
            state.push_boolean(true);
            state.set_table(-3).unwrap();
            state.pop(1);
        });
        let globals = Bindings::globals(&rt);
        let mut names: Vec<String> = globals.keys().map(|k| k.unwrap()).collect();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(globals.len().unwrap(), 2);
        assert_eq!(globals.get("y").unwrap(), Some(Object::from("two")));
    }

    #[test]
    fn empty_names_are_invalid() {
        let rt = Runtime::new();
        let globals = Bindings::globals(&rt);
        assert!(matches!(globals.put("", 1.0), Err(Error::InvalidKey(_))));
        assert!(matches!(globals.get(""), Err(Error::InvalidKey(_))));
        let mut simple = SimpleBindings::new();
        assert!(matches!(simple.put("", 1.0), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn created_bindings_are_detached() {
        let rt = Runtime::new();
        let fresh = Bindings::create(&rt);
        assert!(fresh.is_empty().unwrap());
        fresh.put("print", 1.0).unwrap();
        assert!(!fresh.is_globals_of(&rt));
        assert!(Bindings::globals(&rt).is_globals_of(&rt));
        let print = Bindings::globals(&rt).get("print").unwrap();
        assert!(matches!(print, Some(Object::Function(_))));
    }

    #[test]
    fn simple_bindings_keep_order() {
        let err = SimpleBindings::try_from_pairs([("b", 1.0), ("", 3.0)]).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        let b = SimpleBindings::try_from_pairs([("b", 1.0), ("a", 2.0)]).unwrap();
        let keys: Vec<&String> = b.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        let scope = Scope::from(b);
        assert_eq!(scope.get("a").unwrap(), Some(Object::Number(2.0)));
        assert_eq!(scope.pairs().unwrap().len(), 2);
    }
}
