use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::LuaError;
use crate::value::{Function, TableId, UserData, Value};

/// Hashable projection of a [`Value`] used as a table key.
///
/// Functions and userdata hash by identity; the original value is kept next to
/// the entry so iteration can hand it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Boolean(bool),
    Number(u64),
    String(Arc<str>),
    Table(TableId),
    Function(usize),
    UserData(usize),
}

impl Key {
    /// Returns `None` for keys that cannot index a table (`nil`, NaN).
    pub fn from_value(v: &Value) -> Option<Key> {
        match v {
            Value::Nil => None,
            Value::Boolean(b) => Some(Key::Boolean(*b)),
            Value::Number(n) => {
                if n.is_nan() {
                    None
                } else if *n == 0.0 {
                    Some(Key::Number(0f64.to_bits()))
                } else {
                    Some(Key::Number(n.to_bits()))
                }
            }
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Table(id) => Some(Key::Table(*id)),
            Value::Function(f) => Some(Key::Function(Function::ptr(f))),
            Value::UserData(u) => Some(Key::UserData(UserData::ptr(u))),
        }
    }
}

/// Positive integral index usable in the array part.
#[inline]
fn array_index(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) if *n >= 1.0 && n.fract() == 0.0 && *n <= u32::MAX as f64 => {
            Some(*n as usize)
        }
        _ => None,
    }
}

/// Table storage: a dense array part for keys `1..=n` and an insertion-ordered
/// hash part for everything else.
///
/// Assigning `nil` to a hash entry leaves a tombstone so that a traversal in
/// progress can still resume from that key. Tombstones are purged only when a
/// new key is inserted.
#[derive(Default, Clone)]
pub struct Table {
    array: Vec<Value>,
    array_live: usize,
    hash: IndexMap<Key, (Value, Value)>,
    tombstones: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(narray: usize, nhash: usize) -> Self {
        Self {
            array: Vec::with_capacity(narray),
            array_live: 0,
            hash: IndexMap::with_capacity(nhash),
            tombstones: 0,
        }
    }

    pub fn get(&self, key: &Value) -> Value {
        if let Some(i) = array_index(key) {
            if i <= self.array.len() {
                return self.array[i - 1].clone();
            }
        }
        match Key::from_value(key) {
            Some(k) => self.hash.get(&k).map(|(_, v)| v.clone()).unwrap_or_default(),
            None => Value::Nil,
        }
    }

    pub fn get_int(&self, i: i64) -> Value {
        self.get(&Value::Number(i as f64))
    }

    pub fn get_str(&self, name: &str) -> Value {
        self.get(&Value::string(name))
    }

    pub fn set(&mut self, key: Value, value: Value) -> Result<(), LuaError> {
        if let Some(i) = array_index(&key) {
            if i <= self.array.len() {
                self.set_array_slot(i - 1, value);
                return Ok(());
            }
            let in_hash = Key::from_value(&key).is_some_and(|k| self.hash.contains_key(&k));
            if i == self.array.len() + 1 && !value.is_nil() && !in_hash {
                self.array.push(value);
                self.array_live += 1;
                self.migrate_from_hash();
                return Ok(());
            }
        }
        let k = match Key::from_value(&key) {
            Some(k) => k,
            None if key.is_nil() => return Err(LuaError::runtime("table index is nil")),
            None => return Err(LuaError::runtime("table index is NaN")),
        };
        self.set_hash(k, key, value);
        Ok(())
    }

    pub fn set_int(&mut self, i: i64, value: Value) -> Result<(), LuaError> {
        self.set(Value::Number(i as f64), value)
    }

    pub fn set_str(&mut self, name: &str, value: Value) -> Result<(), LuaError> {
        self.set(Value::string(name), value)
    }

    fn set_array_slot(&mut self, idx: usize, value: Value) {
        let was_live = !self.array[idx].is_nil();
        let is_live = !value.is_nil();
        self.array[idx] = value;
        match (was_live, is_live) {
            (true, false) => self.array_live -= 1,
            (false, true) => self.array_live += 1,
            _ => {}
        }
    }

    fn set_hash(&mut self, k: Key, key: Value, value: Value) {
        if let Some(slot) = self.hash.get_mut(&k) {
            let was_live = !slot.1.is_nil();
            let is_live = !value.is_nil();
            slot.1 = value;
            match (was_live, is_live) {
                (true, false) => self.tombstones += 1,
                (false, true) => self.tombstones -= 1,
                _ => {}
            }
            return;
        }
        if value.is_nil() {
            return;
        }
        if self.tombstones > 0 {
            self.hash.retain(|_, (_, v)| !v.is_nil());
            self.tombstones = 0;
        }
        self.hash.insert(k, (key, value));
    }

    fn remove_hash(&mut self, k: &Key) {
        if let Some((_, v)) = self.hash.shift_remove(k) {
            if v.is_nil() {
                self.tombstones -= 1;
            }
        }
    }

    /// Pulls `n+1, n+2, ...` out of the hash part after the array grew.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = Key::Number(((self.array.len() + 1) as f64).to_bits());
            match self.hash.get(&next) {
                Some((_, v)) if !v.is_nil() => {
                    let v = v.clone();
                    self.remove_hash(&next);
                    self.array.push(v);
                    self.array_live += 1;
                }
                _ => break,
            }
        }
    }

    /// A border of the array part: `t[n] ~= nil` and `t[n+1] == nil`.
    pub fn length(&self) -> usize {
        let mut n = match self.array.iter().rposition(|v| !v.is_nil()) {
            Some(i) => i + 1,
            None => 0,
        };
        if n == self.array.len() {
            // keys that were parked in the hash part continue the sequence
            while !self.get_int(n as i64 + 1).is_nil() {
                n += 1;
            }
        }
        n
    }

    /// Number of non-nil entries.
    pub fn count(&self) -> usize {
        self.array_live + self.hash.len() - self.tombstones
    }

    /// Traversal step: the entry following `key`, `None` at the end.
    ///
    /// `nil` starts the traversal. Assigning to existing fields (including
    /// clearing them) during a traversal is allowed.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, LuaError> {
        let mut array_from = 0usize;
        let mut hash_from = 0usize;
        if !key.is_nil() {
            match array_index(key) {
                Some(i) if i <= self.array.len() => array_from = i,
                _ => {
                    let k = Key::from_value(key)
                        .ok_or_else(|| LuaError::runtime("invalid key to 'next'"))?;
                    let pos = self
                        .hash
                        .get_index_of(&k)
                        .ok_or_else(|| LuaError::runtime("invalid key to 'next'"))?;
                    array_from = self.array.len();
                    hash_from = pos + 1;
                }
            }
        }
        for i in array_from..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((Value::Number((i + 1) as f64), self.array[i].clone())));
            }
        }
        for i in hash_from..self.hash.len() {
            if let Some((_, (k, v))) = self.hash.get_index(i) {
                if !v.is_nil() {
                    return Ok(Some((k.clone(), v.clone())));
                }
            }
        }
        Ok(None)
    }

    /// Copies `t[src..src+count]` to `t[dst..dst+count]`, safe for overlapping ranges.
    pub fn move_range(&mut self, src: i64, count: i64, dst: i64) -> Result<(), LuaError> {
        if count <= 0 {
            return Ok(());
        }
        if dst > src {
            for i in (0..count).rev() {
                let v = self.get_int(src + i);
                self.set_int(dst + i, v)?;
            }
        } else {
            for i in 0..count {
                let v = self.get_int(src + i);
                self.set_int(dst + i, v)?;
            }
        }
        Ok(())
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.array.clear();
        self.array_live = 0;
        self.hash.clear();
        self.tombstones = 0;
    }
}
