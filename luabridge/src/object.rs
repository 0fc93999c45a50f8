use std::fmt;

use luabridge_vm::value::format_number;
use luabridge_vm::{Function, LuaError, TableId, UserData, Value};

use crate::error::Result;
use crate::runtime::{Runtime, StackGuard};

/// A table resident in a runtime.
///
/// Valid as long as the runtime lives; tables are never collected before that.
#[derive(Clone)]
pub struct TableRef {
    runtime: Runtime,
    id: TableId,
}

impl TableRef {
    pub fn new(runtime: &Runtime, id: TableId) -> Self {
        Self {
            runtime: runtime.clone(),
            id,
        }
    }

    /// Allocates an empty table.
    pub fn create(runtime: &Runtime) -> Self {
        let id = runtime.enter(|state| state.alloc_table());
        Self::new(runtime, id)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn id(&self) -> TableId {
        self.id
    }
}

impl PartialEq for TableRef {
    fn eq(&self, other: &Self) -> bool {
        self.runtime.ptr_eq(&other.runtime) && self.id == other.id
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: 0x{:08x}", self.id.index())
    }
}

/// A function value, callable from the host.
#[derive(Clone)]
pub struct FunctionRef {
    runtime: Runtime,
    func: Function,
}

impl FunctionRef {
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn name(&self) -> &str {
        self.func.name()
    }

    /// Calls the function and returns its first result.
    pub fn call(&self, args: Vec<Object>) -> Result<Object> {
        let args = args
            .into_iter()
            .map(|a| a.into_value(&self.runtime))
            .collect::<Result<Vec<_>>>()?;
        let callee = Value::Function(self.func.clone());
        self.runtime.enter(|state| {
            let _guard = StackGuard::new(state);
            let results = state.call_value(&callee, args)?;
            let first = results.into_iter().next().unwrap_or_default();
            Ok(Object::from_value(&self.runtime, first))
        })
    }
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        self.runtime.ptr_eq(&other.runtime) && self.func.ptr_eq(&other.func)
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function: 0x{:08x}", self.func.ptr())
    }
}

/// A script value seen from the host.
#[derive(Clone, Default)]
pub enum Object {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Table(TableRef),
    Function(FunctionRef),
    UserData(UserData),
}

impl Object {
    pub fn from_value(runtime: &Runtime, value: Value) -> Object {
        match value {
            Value::Nil => Object::Nil,
            Value::Boolean(b) => Object::Boolean(b),
            Value::Number(n) => Object::Number(n),
            Value::String(s) => Object::String(s.to_string()),
            Value::Table(id) => Object::Table(TableRef::new(runtime, id)),
            Value::Function(func) => Object::Function(FunctionRef {
                runtime: runtime.clone(),
                func,
            }),
            Value::UserData(u) => Object::UserData(u),
        }
    }

    /// Converts back to a runtime value.
    ///
    /// Tables and functions must belong to `runtime`.
    pub fn into_value(self, runtime: &Runtime) -> Result<Value> {
        Ok(match self {
            Object::Nil => Value::Nil,
            Object::Boolean(b) => Value::Boolean(b),
            Object::Number(n) => Value::Number(n),
            Object::String(s) => Value::from(s),
            Object::Table(t) => {
                if !t.runtime.ptr_eq(runtime) {
                    return Err(LuaError::api("table belongs to another runtime").into());
                }
                Value::Table(t.id)
            }
            Object::Function(f) => {
                if !f.runtime.ptr_eq(runtime) {
                    return Err(LuaError::api("function belongs to another runtime").into());
                }
                Value::Function(f.func)
            }
            Object::UserData(u) => Value::UserData(u),
        })
    }

    /// Whether the value can be used in `runtime`. Only tables and functions
    /// are tied to one runtime.
    pub fn belongs_to(&self, runtime: &Runtime) -> bool {
        match self {
            Object::Table(t) => t.runtime.ptr_eq(runtime),
            Object::Function(f) => f.runtime.ptr_eq(runtime),
            _ => true,
        }
    }

    /// Like [`Object::into_value`] without the runtime check.
    pub(crate) fn raw_value(&self) -> Value {
        match self {
            Object::Nil => Value::Nil,
            Object::Boolean(b) => Value::Boolean(*b),
            Object::Number(n) => Value::Number(*n),
            Object::String(s) => Value::string(s),
            Object::Table(t) => Value::Table(t.id),
            Object::Function(f) => Value::Function(f.func.clone()),
            Object::UserData(u) => Value::UserData(u.clone()),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Object::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Nil => "nil",
            Object::Boolean(_) => "boolean",
            Object::Number(_) => "number",
            Object::String(_) => "string",
            Object::Table(_) => "table",
            Object::Function(_) => "function",
            Object::UserData(_) => "userdata",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Object::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Object::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Object::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::Nil, Object::Nil) => true,
            (Object::Boolean(a), Object::Boolean(b)) => a == b,
            (Object::Number(a), Object::Number(b)) => a == b,
            (Object::String(a), Object::String(b)) => a == b,
            (Object::Table(a), Object::Table(b)) => a == b,
            (Object::Function(a), Object::Function(b)) => a == b,
            (Object::UserData(a), Object::UserData(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Nil => write!(f, "Nil"),
            Object::Boolean(b) => write!(f, "Boolean({b})"),
            Object::Number(n) => write!(f, "Number({n})"),
            Object::String(s) => write!(f, "String({s:?})"),
            Object::Table(t) => write!(f, "Table({t:?})"),
            Object::Function(func) => write!(f, "Function({func:?})"),
            Object::UserData(u) => write!(f, "UserData(0x{:08x})", u.ptr()),
        }
    }
}

/// Same text as `tostring` in scripts.
impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Nil => write!(f, "nil"),
            Object::Boolean(b) => write!(f, "{b}"),
            Object::Number(n) => write!(f, "{}", format_number(*n)),
            Object::String(s) => write!(f, "{s}"),
            Object::Table(t) => write!(f, "{t:?}"),
            Object::Function(func) => write!(f, "{func:?}"),
            Object::UserData(u) => write!(f, "userdata: 0x{:08x}", u.ptr()),
        }
    }
}

impl From<bool> for Object {
    fn from(b: bool) -> Self {
        Object::Boolean(b)
    }
}

impl From<f64> for Object {
    fn from(n: f64) -> Self {
        Object::Number(n)
    }
}

impl From<i32> for Object {
    fn from(n: i32) -> Self {
        Object::Number(n as f64)
    }
}

impl From<&str> for Object {
    fn from(s: &str) -> Self {
        Object::String(s.to_string())
    }
}

impl From<String> for Object {
    fn from(s: String) -> Self {
        Object::String(s)
    }
}

impl From<TableRef> for Object {
    fn from(t: TableRef) -> Self {
        Object::Table(t)
    }
}

impl From<UserData> for Object {
    fn from(u: UserData) -> Self {
        Object::UserData(u)
    }
}

impl<T: Into<Object>> From<Option<T>> for Object {
    fn from(v: Option<T>) -> Self {
        v.map_or(Object::Nil, Into::into)
    }
}
