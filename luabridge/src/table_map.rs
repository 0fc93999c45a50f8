use std::marker::PhantomData;

use log::trace;
use luabridge_vm::{State, TableId, Value};

use crate::error::{Error, Result};
use crate::object::{Object, TableRef};
use crate::runtime::{Runtime, StackGuard};

/// How a [`TableMap`] maps host keys to table keys and which keys it shows.
pub trait KeyPolicy<K> {
    /// The table key for `key` in `runtime`.
    fn to_foreign(&self, runtime: &Runtime, key: &K) -> Result<Value>;

    /// The host key for a table key that passed [`KeyPolicy::accept_key`].
    fn convert_key(&self, runtime: &Runtime, key: Value) -> K;

    /// Extra validation on top of the nil/NaN check every map performs first.
    fn check_key(&self, _key: &K) -> Result<()> {
        Ok(())
    }

    /// Whether iteration, `len` and `is_empty` only see accepted keys.
    fn is_filtered(&self) -> bool {
        false
    }

    fn accept_key(&self, _key: &Value) -> bool {
        true
    }
}

/// Every table key, seen as an [`Object`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyKey;

impl KeyPolicy<Object> for AnyKey {
    fn to_foreign(&self, runtime: &Runtime, key: &Object) -> Result<Value> {
        // table ids are per runtime, a foreign one would alias a local table
        if !key.belongs_to(runtime) {
            return Err(Error::InvalidKey(format!(
                "{} key belongs to another runtime",
                key.type_name()
            )));
        }
        Ok(key.raw_value())
    }

    fn convert_key(&self, runtime: &Runtime, key: Value) -> Object {
        Object::from_value(runtime, key)
    }
}

/// The table a map reads and writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TableSource {
    Table(TableId),
    /// The global namespace of the runtime.
    Globals,
}

impl TableSource {
    pub(crate) fn push(&self, state: &State) {
        match self {
            TableSource::Table(id) => state.push(Value::Table(*id)),
            TableSource::Globals => state.push_globals(),
        }
    }
}

/// A map view over one table.
///
/// Reads and writes go straight to the table, so changes made by scripts
/// are visible immediately. Storing nil removes the key.
#[derive(Clone)]
pub struct TableMap<K, P = AnyKey> {
    runtime: Runtime,
    source: TableSource,
    policy: P,
    _key: PhantomData<fn() -> K>,
}

impl TableMap<Object, AnyKey> {
    pub fn new(table: &TableRef) -> Self {
        Self::with_policy(table.runtime(), TableSource::Table(table.id()), AnyKey)
    }
}

impl<K, P: KeyPolicy<K>> TableMap<K, P> {
    pub fn with_policy(runtime: &Runtime, source: TableSource, policy: P) -> Self {
        Self {
            runtime: runtime.clone(),
            source,
            policy,
            _key: PhantomData,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn source(&self) -> TableSource {
        self.source
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    fn foreign_key(&self, key: &K) -> Result<Value> {
        let foreign = self.policy.to_foreign(&self.runtime, key)?;
        match &foreign {
            Value::Nil => return Err(Error::InvalidKey("nil".to_string())),
            Value::Number(n) if n.is_nan() => return Err(Error::InvalidKey("NaN".to_string())),
            _ => {}
        }
        self.policy.check_key(key)?;
        Ok(foreign)
    }

    fn raw_get(&self, state: &State, key: Value) -> Result<Option<Object>> {
        let _guard = StackGuard::new(state);
        self.source.push(state);
        state.push(key);
        state.get_table(-2)?;
        Ok(match state.to_value(-1)? {
            Value::Nil => None,
            v => Some(Object::from_value(&self.runtime, v)),
        })
    }

    fn raw_put(&self, state: &State, key: Value, value: Value) -> Result<()> {
        let _guard = StackGuard::new(state);
        self.source.push(state);
        state.push(key);
        state.push(value);
        state.set_table(-3)?;
        Ok(())
    }

    /// The value stored under `key`, `None` when the slot is nil.
    pub fn get(&self, key: impl Into<K>) -> Result<Option<Object>> {
        let key = self.foreign_key(&key.into())?;
        self.runtime.enter(|state| self.raw_get(state, key))
    }

    /// Stores `value` under `key` and returns the previous value.
    ///
    /// Storing [`Object::Nil`] deletes the key.
    pub fn put(&self, key: impl Into<K>, value: impl Into<Object>) -> Result<Option<Object>> {
        let key = self.foreign_key(&key.into())?;
        let value = value.into().into_value(&self.runtime)?;
        self.runtime.enter(|state| {
            let previous = self.raw_get(state, key.clone())?;
            self.raw_put(state, key, value)?;
            Ok(previous)
        })
    }

    /// Deletes `key` and returns the previous value.
    pub fn remove(&self, key: impl Into<K>) -> Result<Option<Object>> {
        self.put(key, Object::Nil)
    }

    /// Filtered maps answer `false` for keys they do not accept.
    pub fn contains_key(&self, key: impl Into<K>) -> Result<bool> {
        let foreign = self.foreign_key(&key.into())?;
        if self.policy.is_filtered() && !self.policy.accept_key(&foreign) {
            return Ok(false);
        }
        Ok(self.runtime.enter(|state| self.raw_get(state, foreign))?.is_some())
    }

    /// Number of entries. A filtered map walks the whole table.
    pub fn len(&self) -> Result<usize> {
        if self.policy.is_filtered() {
            let mut n = 0;
            for entry in self.entries() {
                entry?;
                n += 1;
            }
            return Ok(n);
        }
        self.runtime.enter(|state| {
            let _guard = StackGuard::new(state);
            self.source.push(state);
            Ok(state.table_count(-1)?)
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        match self.entries().next() {
            Some(entry) => entry.map(|_| false),
            None => Ok(true),
        }
    }

    /// Lazily walks the table with the runtime's `next` primitive.
    ///
    /// Each step locks the runtime on its own. Reading, updating existing
    /// keys and removing the current key are fine during the walk; inserting
    /// new keys is not and may end it with an error. Use
    /// [`TableMap::snapshot`] when the table must change while walking.
    pub fn entries(&self) -> Entries<'_, K, P> {
        Entries {
            map: self,
            cursor: Value::Nil,
            done: false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = Result<K>> + '_ {
        self.entries().map(|e| e.map(|e| e.key))
    }

    pub fn values(&self) -> impl Iterator<Item = Result<Object>> + '_ {
        self.entries()
            .map(|e| e.and_then(|e| e.value().map(Option::unwrap_or_default)))
    }

    /// Copies every accepted entry in one critical section.
    pub fn snapshot(&self) -> Result<Vec<(K, Object)>> {
        self.runtime.enter(|state| {
            let _guard = StackGuard::new(state);
            self.source.push(state);
            state.push_nil();
            let mut out = Vec::new();
            while state.next(-2)? {
                let key = state.to_value(-2)?;
                let value = state.to_value(-1)?;
                state.pop(1);
                if self.policy.accept_key(&key) || !self.policy.is_filtered() {
                    out.push((
                        self.policy.convert_key(&self.runtime, key),
                        Object::from_value(&self.runtime, value),
                    ));
                }
            }
            Ok(out)
        })
    }

    /// Removes every accepted entry.
    pub fn clear(&self) -> Result<()> {
        self.runtime.enter(|state| {
            let keys = {
                let _guard = StackGuard::new(state);
                self.source.push(state);
                state.push_nil();
                let mut keys = Vec::new();
                while state.next(-2)? {
                    state.pop(1);
                    let key = state.to_value(-1)?;
                    if !self.policy.is_filtered() || self.policy.accept_key(&key) {
                        keys.push(key);
                    }
                }
                keys
            };
            trace!("clear: {} keys", keys.len());
            for key in keys {
                self.raw_put(state, key, Value::Nil)?;
            }
            Ok(())
        })
    }
}

/// One entry of a [`TableMap`], reading and writing the table on demand.
pub struct Entry<'a, K, P> {
    map: &'a TableMap<K, P>,
    key: K,
    foreign: Value,
}

impl<'a, K, P: KeyPolicy<K>> Entry<'a, K, P> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn into_key(self) -> K {
        self.key
    }

    /// Current value, `None` once the key has been removed.
    pub fn value(&self) -> Result<Option<Object>> {
        let key = self.foreign.clone();
        self.map.runtime.enter(|state| self.map.raw_get(state, key))
    }

    pub fn set_value(&self, value: impl Into<Object>) -> Result<Option<Object>> {
        let value = value.into().into_value(&self.map.runtime)?;
        let key = self.foreign.clone();
        self.map.runtime.enter(|state| {
            let previous = self.map.raw_get(state, key.clone())?;
            self.map.raw_put(state, key, value)?;
            Ok(previous)
        })
    }
}

/// Entries are equal when they come from the same runtime and have equal keys.
impl<K: PartialEq, P> PartialEq for Entry<'_, K, P> {
    fn eq(&self, other: &Self) -> bool {
        self.map.runtime.ptr_eq(&other.map.runtime) && self.key == other.key
    }
}

impl<K: std::fmt::Debug, P> std::fmt::Debug for Entry<'_, K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry").field("key", &self.key).finish()
    }
}

pub struct Entries<'a, K, P> {
    map: &'a TableMap<K, P>,
    cursor: Value,
    done: bool,
}

impl<'a, K, P: KeyPolicy<K>> Iterator for Entries<'a, K, P> {
    type Item = Result<Entry<'a, K, P>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let map = self.map;
        let step = map.runtime.enter(|state| -> Result<Option<Value>> {
            let _guard = StackGuard::new(state);
            map.source.push(state);
            state.push(self.cursor.clone());
            loop {
                if !state.next(-2)? {
                    return Ok(None);
                }
                state.pop(1);
                let key = state.to_value(-1)?;
                if !map.policy.is_filtered() || map.policy.accept_key(&key) {
                    return Ok(Some(key));
                }
            }
        });
        match step {
            Ok(Some(key)) => {
                self.cursor = key.clone();
                Some(Ok(Entry {
                    map,
                    key: map.policy.convert_key(&map.runtime, key.clone()),
                    foreign: key,
                }))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn map_of(rt: &Runtime, src: &str) -> TableMap<Object> {
        let value = rt.enter(|state| {
            state.load(src.as_bytes(), "map").unwrap();
            state.call(0, Some(1)).unwrap();
            let v = state.to_value(-1).unwrap();
            state.pop(1);
            v
        });
        let id = value.as_table().unwrap();
        TableMap::new(&TableRef::new(rt, id))
    }

    fn key_names(map: &TableMap<Object>) -> BTreeSet<String> {
        map.keys()
            .map(|k| match k.unwrap() {
                Object::String(s) => s,
                Object::Number(n) => n.to_string(),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn put_get_round_trip() {
        let rt = Runtime::new();
        let map = TableMap::new(&TableRef::create(&rt));
        assert_eq!(map.put("a", 1.0).unwrap(), None);
        assert_eq!(map.get("a").unwrap(), Some(Object::Number(1.0)));
        assert_eq!(map.put("a", "x").unwrap(), Some(Object::Number(1.0)));
        assert_eq!(map.get("a").unwrap(), Some(Object::from("x")));
        assert_eq!(map.len().unwrap(), 1);
    }

    #[test]
    fn nil_put_deletes() {
        let rt = Runtime::new();
        let map = map_of(&rt, "return { a = 1, b = 2 }");
        assert_eq!(map.put("a", Object::Nil).unwrap(), Some(Object::Number(1.0)));
        assert!(!map.contains_key("a").unwrap());
        assert_eq!(map.remove("missing").unwrap(), None);
        assert_eq!(map.len().unwrap(), 1);
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let rt = Runtime::new();
        let map = TableMap::new(&TableRef::create(&rt));
        assert!(matches!(map.get(Object::Nil), Err(Error::InvalidKey(_))));
        assert!(matches!(
            map.put(Object::Number(f64::NAN), 1.0),
            Err(Error::InvalidKey(_))
        ));
        assert_eq!(rt.enter(|s| s.get_top()), 0);
    }

    #[test]
    fn iteration_is_repeatable() {
        let rt = Runtime::new();
        let map = map_of(&rt, "return { 10, 20, x = 1, y = 2 }");
        let first = key_names(&map);
        assert_eq!(first, key_names(&map));
        assert_eq!(first.len(), 4);
        assert!(first.contains("x"));
        assert!(!map.is_empty().unwrap());
    }

    #[test]
    fn removing_the_current_key_while_walking() {
        let rt = Runtime::new();
        let map = map_of(&rt, "return { a = 1, b = 2, c = 3, 7 }");
        let mut seen = 0;
        for entry in map.entries() {
            let entry = entry.unwrap();
            assert!(entry.set_value(Object::Nil).unwrap().is_some());
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn entries_read_live_values() {
        let rt = Runtime::new();
        let map = map_of(&rt, "return { a = 1 }");
        let entry = map.entries().next().unwrap().unwrap();
        map.put("a", 5.0).unwrap();
        assert_eq!(entry.value().unwrap(), Some(Object::Number(5.0)));
        let again = map.entries().next().unwrap().unwrap();
        assert_eq!(entry, again);
    }

    struct NoNumbers;

    impl KeyPolicy<Object> for NoNumbers {
        fn to_foreign(&self, runtime: &Runtime, key: &Object) -> Result<Value> {
            AnyKey.to_foreign(runtime, key)
        }

        fn convert_key(&self, runtime: &Runtime, key: Value) -> Object {
            AnyKey.convert_key(runtime, key)
        }

        fn is_filtered(&self) -> bool {
            true
        }

        fn accept_key(&self, key: &Value) -> bool {
            !matches!(key, Value::Number(_))
        }
    }

    #[test]
    fn filtered_keys_stay_hidden() {
        let rt = Runtime::new();
        let table = map_of(&rt, "return { 1, 2, 3, name = 'n' }");
        let TableSource::Table(id) = table.source() else {
            unreachable!()
        };
        let map = TableMap::with_policy(&rt, TableSource::Table(id), NoNumbers);
        let keys: Vec<Object> = map.keys().map(|k| k.unwrap()).collect();
        assert_eq!(keys, vec![Object::from("name")]);
        assert_eq!(map.len().unwrap(), 1);
        assert!(!map.contains_key(Object::Number(1.0)).unwrap());
        // still present underneath
        assert!(table.contains_key(Object::Number(1.0)).unwrap());
        assert_eq!(map.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn clear_and_snapshot() {
        let rt = Runtime::new();
        let map = map_of(&rt, "return { 'a', 'b', k = true }");
        let snap = map.snapshot().unwrap();
        assert_eq!(snap.len(), 3);
        map.clear().unwrap();
        assert_eq!(map.len().unwrap(), 0);
        assert_eq!(map.snapshot().unwrap(), Vec::new());
    }

    #[test]
    fn keys_of_another_runtime_are_rejected() {
        let a = Runtime::new();
        let b = Runtime::new();
        let ta = TableRef::create(&a);
        let tb = TableRef::create(&b);
        assert_eq!(ta.id(), tb.id());

        let map = TableMap::new(&TableRef::create(&b));
        assert!(matches!(map.put(ta.clone(), 1.0), Err(Error::InvalidKey(_))));
        assert!(matches!(map.get(ta), Err(Error::InvalidKey(_))));
        map.put(tb.clone(), 2.0).unwrap();
        assert_eq!(map.get(tb).unwrap(), Some(Object::Number(2.0)));
        assert_eq!(b.enter(|s| s.get_top()), 0);
    }
}
