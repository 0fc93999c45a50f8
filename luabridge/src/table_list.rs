use luabridge_vm::{State, Value};

use crate::error::{Error, Result};
use crate::object::{Object, TableRef};
use crate::runtime::{Runtime, StackGuard};

/// A 0-based list view over the sequence `t[1..=#t]`.
///
/// Elements are never nil, so the sequence never has holes and `len`
/// always matches what scripts see with `#t`.
pub struct TableList {
    table: TableRef,
}

impl TableList {
    pub fn new(table: &TableRef) -> Self {
        Self {
            table: table.clone(),
        }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    fn runtime(&self) -> &Runtime {
        self.table.runtime()
    }

    /// Runs `f` with the table pushed on top of the stack.
    fn with_table<R>(&self, f: impl FnOnce(&State, usize) -> Result<R>) -> Result<R> {
        self.runtime().enter(|state| {
            let _guard = StackGuard::new(state);
            state.push(Value::Table(self.table.id()));
            let len = state.raw_len(-1)?;
            f(state, len)
        })
    }

    fn element(&self, value: Object, index: usize) -> Result<Value> {
        if value.is_nil() {
            return Err(Error::NilElement { index });
        }
        value.into_value(self.runtime())
    }

    fn read(&self, state: &State, slot: usize) -> Result<Object> {
        state.raw_get_int(-1, slot as i64)?;
        let v = state.to_value(-1)?;
        state.pop(1);
        Ok(Object::from_value(self.runtime(), v))
    }

    fn write(&self, state: &State, slot: usize, value: Value) -> Result<()> {
        state.push(value);
        state.raw_set_int(-2, slot as i64)?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        self.with_table(|_, len| Ok(len))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Object> {
        self.with_table(|state, len| {
            check_index(index, len)?;
            self.read(state, index + 1)
        })
    }

    /// Overwrites element `index` and returns the old one.
    pub fn set(&self, index: usize, value: impl Into<Object>) -> Result<Object> {
        let value = self.element(value.into(), index)?;
        self.with_table(|state, len| {
            check_index(index, len)?;
            let old = self.read(state, index + 1)?;
            self.write(state, index + 1, value)?;
            Ok(old)
        })
    }

    /// Inserts at `index`, shifting later elements up. `index == len` appends.
    pub fn insert(&self, index: usize, value: impl Into<Object>) -> Result<()> {
        let value = self.element(value.into(), index)?;
        self.with_table(|state, len| {
            if index > len {
                return Err(Error::IndexOutOfRange { index, len });
            }
            let slot = index as i64 + 1;
            state.raw_move(-1, slot, (len - index) as i64, slot + 1)?;
            self.write(state, index + 1, value)
        })
    }

    pub fn push(&self, value: impl Into<Object>) -> Result<()> {
        let value = value.into();
        self.with_table(|state, len| {
            let value = self.element(value, len)?;
            self.write(state, len + 1, value)
        })
    }

    /// Removes element `index`, shifting later elements down.
    pub fn remove(&self, index: usize) -> Result<Object> {
        self.with_table(|state, len| {
            check_index(index, len)?;
            let old = self.read(state, index + 1)?;
            let slot = index as i64 + 1;
            state.raw_move(-1, slot + 1, (len - index - 1) as i64, slot)?;
            self.write(state, len, Value::Nil)?;
            Ok(old)
        })
    }

    /// Copies the elements in one critical section.
    pub fn to_vec(&self) -> Result<Vec<Object>> {
        self.with_table(|state, len| (1..=len).map(|slot| self.read(state, slot)).collect())
    }
}

fn check_index(index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(Error::IndexOutOfRange { index, len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn list(rt: &Runtime, items: &[&str]) -> TableList {
        let list = TableList::new(&TableRef::create(rt));
        for item in items {
            list.push(*item).unwrap();
        }
        list
    }

    fn strings(list: &TableList) -> Vec<String> {
        list.to_vec()
            .unwrap()
            .into_iter()
            .map(|o| o.as_str().unwrap_or("?").to_string())
            .collect()
    }

    #[test]
    fn insert_shifts_up() {
        let rt = Runtime::new();
        let l = list(&rt, &["a", "b", "c"]);
        l.insert(1, "x").unwrap();
        assert_eq!(strings(&l), vec!["a", "x", "b", "c"]);
        l.insert(0, "first").unwrap();
        l.insert(5, "last").unwrap();
        assert_eq!(strings(&l), vec!["first", "a", "x", "b", "c", "last"]);
        assert_eq!(l.len().unwrap(), 6);
    }

    #[test]
    fn remove_shifts_down_and_clears_the_tail() {
        let rt = Runtime::new();
        let l = list(&rt, &["a", "b", "c", "d"]);
        assert_eq!(l.remove(1).unwrap(), Object::from("b"));
        assert_eq!(strings(&l), vec!["a", "c", "d"]);
        let stale = rt.enter(|state| {
            state.push(Value::Table(l.table().id()));
            state.raw_get_int(-1, 4).unwrap();
            let v = state.to_value(-1).unwrap();
            state.pop(2);
            v
        });
        assert_eq!(stale, Value::Nil);
        assert_eq!(l.remove(2).unwrap(), Object::from("d"));
        assert_eq!(l.len().unwrap(), 2);
    }

    #[test]
    fn bounds_are_checked() {
        let rt = Runtime::new();
        let l = list(&rt, &["a"]);
        assert!(matches!(l.get(1), Err(Error::IndexOutOfRange { index: 1, len: 1 })));
        assert!(matches!(l.set(1, "z"), Err(Error::IndexOutOfRange { .. })));
        assert!(matches!(l.insert(2, "z"), Err(Error::IndexOutOfRange { .. })));
        assert!(matches!(l.remove(1), Err(Error::IndexOutOfRange { .. })));
        assert!(matches!(l.set(0, Object::Nil), Err(Error::NilElement { index: 0 })));
        assert_eq!(rt.enter(|s| s.get_top()), 0);
    }

    #[test]
    fn set_returns_old_value() {
        let rt = Runtime::new();
        let l = list(&rt, &["a", "b"]);
        assert_eq!(l.set(1, 2.0).unwrap(), Object::from("b"));
        assert_eq!(l.get(1).unwrap(), Object::Number(2.0));
    }

    #[test]
    fn scripts_see_the_same_length() {
        let rt = Runtime::new();
        let l = list(&rt, &["a", "b", "c"]);
        l.remove(0).unwrap();
        l.insert(1, "m").unwrap();
        let n = rt.enter(|state| {
            state.push(Value::Table(l.table().id()));
            state.set_global("list").unwrap();
            state.load(b"return #list", "len").unwrap();
            state.call(0, Some(1)).unwrap();
            let v = state.to_value(-1).unwrap();
            state.pop(1);
            v
        });
        assert_eq!(n, Value::Number(3.0));
    }
}
