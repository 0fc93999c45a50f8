use std::cell::{Cell, RefCell};
use std::io::Write;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::compiler;
use crate::error::{LuaError, LuaResult};
use crate::exec;
use crate::parser;
use crate::proto::{self, Proto};
use crate::table::Table;
use crate::value::{Closure, Function, NativeFunction, TableId, Value};

/// Destination of `print` and of host streams bound into scripts.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Nested call limit, Lua and host functions alike.
pub const MAX_CALL_DEPTH: usize = 200;

#[derive(Debug, Clone)]
pub(crate) enum FrameKind {
    Lua { source: Arc<str>, main: bool },
    Native,
}

/// Bookkeeping for one active call, used for error positions and tracebacks.
#[derive(Debug)]
pub(crate) struct CallInfo {
    pub(crate) name: Arc<str>,
    pub(crate) kind: FrameKind,
    pub(crate) line: Cell<u32>,
    pub(crate) line_defined: u32,
}

/// A single-threaded interpreter instance.
///
/// Every primitive takes `&self` and borrows internal state only for the
/// duration of the primitive itself, so host functions invoked from a script
/// can keep using the stack protocol. The type is `Send` but not `Sync`; share
/// it behind a lock.
pub struct State {
    stack: RefCell<Vec<Value>>,
    heap: RefCell<Vec<Table>>,
    globals: TableId,
    pub(crate) frames: RefCell<Vec<CallInfo>>,
    pub(crate) depth: Cell<usize>,
    output: RefCell<Option<SharedWriter>>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Creates a state with an empty global table and no library.
    pub fn new() -> Self {
        Self {
            stack: RefCell::new(Vec::with_capacity(32)),
            heap: RefCell::new(vec![Table::new()]),
            globals: TableId(0),
            frames: RefCell::new(Vec::new()),
            depth: Cell::new(0),
            output: RefCell::new(None),
        }
    }

    /// Creates a state with the standard library installed.
    pub fn with_libs() -> Self {
        let state = Self::new();
        state.open_libs();
        state
    }

    pub fn open_libs(&self) {
        crate::stdlib::open(self);
    }

    #[inline]
    pub fn globals(&self) -> TableId {
        self.globals
    }

    // ---- Heap ----

    /// Tables are never freed; the heap only grows until the state drops.
    pub fn alloc_table(&self) -> TableId {
        let mut heap = self.heap.borrow_mut();
        heap.push(Table::new());
        TableId((heap.len() - 1) as u32)
    }

    pub fn alloc_table_with(&self, table: Table) -> TableId {
        let mut heap = self.heap.borrow_mut();
        heap.push(table);
        TableId((heap.len() - 1) as u32)
    }

    fn invalid_table(id: TableId) -> LuaError {
        LuaError::api(format!("invalid table reference {}", id.0))
    }

    /// Runs `f` with shared access to a table.
    pub fn with_table<R>(&self, id: TableId, f: impl FnOnce(&Table) -> R) -> LuaResult<R> {
        let heap = self.heap.borrow();
        let table = heap.get(id.0 as usize).ok_or_else(|| Self::invalid_table(id))?;
        Ok(f(table))
    }

    /// Runs `f` with exclusive access to a table.
    pub fn with_table_mut<R>(
        &self,
        id: TableId,
        f: impl FnOnce(&mut Table) -> LuaResult<R>,
    ) -> LuaResult<R> {
        let mut heap = self.heap.borrow_mut();
        let table = heap
            .get_mut(id.0 as usize)
            .ok_or_else(|| Self::invalid_table(id))?;
        f(table)
    }

    pub fn table_get(&self, id: TableId, key: &Value) -> LuaResult<Value> {
        self.with_table(id, |t| t.get(key))
    }

    pub fn table_set(&self, id: TableId, key: Value, value: Value) -> LuaResult<()> {
        self.with_table_mut(id, |t| t.set(key, value))
    }

    pub fn table_next(&self, id: TableId, key: &Value) -> LuaResult<Option<(Value, Value)>> {
        self.with_table(id, |t| t.next(key))?
    }

    // ---- Stack addressing ----

    /// Converts a 1-based or negative index into a 0-based position.
    fn position(&self, idx: i32) -> LuaResult<usize> {
        let len = self.stack.borrow().len();
        let pos = if idx > 0 {
            idx as usize - 1
        } else if idx < 0 && (idx.unsigned_abs() as usize) <= len {
            len - idx.unsigned_abs() as usize
        } else {
            return Err(LuaError::api(format!("invalid stack index {idx}")));
        };
        if pos >= len {
            return Err(LuaError::api(format!("invalid stack index {idx}")));
        }
        Ok(pos)
    }

    fn table_at(&self, idx: i32) -> LuaResult<TableId> {
        match self.to_value(idx)? {
            Value::Table(id) => Ok(id),
            other => Err(LuaError::api(format!(
                "table expected at index {idx}, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn get_top(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Truncates the stack or pads it with nil.
    pub fn set_top(&self, top: usize) {
        self.stack.borrow_mut().resize(top, Value::Nil);
    }

    pub fn pop(&self, n: usize) {
        let mut stack = self.stack.borrow_mut();
        let len = stack.len().saturating_sub(n);
        stack.truncate(len);
    }

    pub(crate) fn pop_value(&self) -> LuaResult<Value> {
        self.stack
            .borrow_mut()
            .pop()
            .ok_or_else(|| LuaError::api("stack underflow"))
    }

    pub fn push(&self, v: Value) {
        self.stack.borrow_mut().push(v);
    }

    pub fn push_nil(&self) {
        self.push(Value::Nil);
    }

    pub fn push_boolean(&self, b: bool) {
        self.push(Value::Boolean(b));
    }

    pub fn push_number(&self, n: f64) {
        self.push(Value::Number(n));
    }

    pub fn push_string(&self, s: &str) {
        self.push(Value::string(s));
    }

    pub fn push_globals(&self) {
        self.push(Value::Table(self.globals));
    }

    pub fn push_function(&self, f: NativeFunction) {
        self.push(Value::Function(Function::Native(f)));
    }

    /// Creates an empty table and pushes it.
    pub fn new_table(&self) -> TableId {
        let id = self.alloc_table();
        self.push(Value::Table(id));
        id
    }

    pub fn push_copy(&self, idx: i32) -> LuaResult<()> {
        let v = self.to_value(idx)?;
        self.push(v);
        Ok(())
    }

    pub fn to_value(&self, idx: i32) -> LuaResult<Value> {
        let pos = self.position(idx)?;
        Ok(self.stack.borrow()[pos].clone())
    }

    /// Type name of the value at `idx`, `"none"` for an invalid index.
    pub fn type_of(&self, idx: i32) -> &'static str {
        match self.to_value(idx) {
            Ok(v) => v.type_name(),
            Err(_) => "none",
        }
    }

    pub fn is_table(&self, idx: i32) -> bool {
        matches!(self.to_value(idx), Ok(Value::Table(_)))
    }

    pub fn is_function(&self, idx: i32) -> bool {
        matches!(self.to_value(idx), Ok(Value::Function(_)))
    }

    // ---- Table access ----

    /// Pops a key and pushes `t[key]` for the table at `idx`.
    pub fn get_table(&self, idx: i32) -> LuaResult<()> {
        let id = self.table_at(idx)?;
        let key = self.pop_value()?;
        let v = self.table_get(id, &key)?;
        self.push(v);
        Ok(())
    }

    /// Pops a value and a key and stores `t[key] = value`.
    pub fn set_table(&self, idx: i32) -> LuaResult<()> {
        let id = self.table_at(idx)?;
        let value = self.pop_value()?;
        let key = self.pop_value()?;
        self.table_set(id, key, value)
    }

    pub fn get_field(&self, idx: i32, name: &str) -> LuaResult<()> {
        let id = self.table_at(idx)?;
        let v = self.table_get(id, &Value::string(name))?;
        self.push(v);
        Ok(())
    }

    /// Pops a value and stores it as `t[name]`.
    pub fn set_field(&self, idx: i32, name: &str) -> LuaResult<()> {
        let id = self.table_at(idx)?;
        let value = self.pop_value()?;
        self.table_set(id, Value::string(name), value)
    }

    pub fn raw_get_int(&self, idx: i32, n: i64) -> LuaResult<()> {
        let id = self.table_at(idx)?;
        let v = self.with_table(id, |t| t.get_int(n))?;
        self.push(v);
        Ok(())
    }

    /// Pops a value and stores it as `t[n]`.
    pub fn raw_set_int(&self, idx: i32, n: i64) -> LuaResult<()> {
        let id = self.table_at(idx)?;
        let value = self.pop_value()?;
        self.with_table_mut(id, |t| t.set_int(n, value))
    }

    /// Copies `count` elements starting at `src` to `dst` within one table.
    pub fn raw_move(&self, idx: i32, src: i64, count: i64, dst: i64) -> LuaResult<()> {
        let id = self.table_at(idx)?;
        trace!("raw_move: src={src} count={count} dst={dst}");
        self.with_table_mut(id, |t| t.move_range(src, count, dst))
    }

    /// Pops a key and pushes the next key/value pair, returns false at the end.
    pub fn next(&self, idx: i32) -> LuaResult<bool> {
        let id = self.table_at(idx)?;
        let key = self.pop_value()?;
        match self.table_next(id, &key)? {
            Some((k, v)) => {
                self.push(k);
                self.push(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn raw_len(&self, idx: i32) -> LuaResult<usize> {
        match self.to_value(idx)? {
            Value::Table(id) => self.with_table(id, |t| t.length()),
            Value::String(s) => Ok(s.len()),
            other => Err(LuaError::api(format!(
                "length of a {} value",
                other.type_name()
            ))),
        }
    }

    /// Number of non-nil entries in the table at `idx`.
    pub fn table_count(&self, idx: i32) -> LuaResult<usize> {
        let id = self.table_at(idx)?;
        self.with_table(id, |t| t.count())
    }

    pub fn get_global(&self, name: &str) -> LuaResult<()> {
        let v = self.table_get(self.globals, &Value::string(name))?;
        self.push(v);
        Ok(())
    }

    /// Pops a value and stores it as global `name`.
    pub fn set_global(&self, name: &str) -> LuaResult<()> {
        let value = self.pop_value()?;
        self.table_set(self.globals, Value::string(name), value)
    }

    // ---- Calls ----

    /// Calls the function below the `nargs` topmost values.
    ///
    /// The function and arguments are popped. On success the results are
    /// pushed, adjusted to `nresults` when given; on failure nothing is pushed.
    pub fn call(&self, nargs: usize, nresults: Option<usize>) -> LuaResult<()> {
        let top = self.get_top();
        if top < nargs + 1 {
            return Err(LuaError::api("not enough elements in the stack"));
        }
        let (func, args) = {
            let mut stack = self.stack.borrow_mut();
            let args = stack.split_off(top - nargs);
            let func = stack.pop().unwrap_or_default();
            (func, args)
        };
        trace!("call: nargs={nargs} nresults={nresults:?}");
        let mut results = self.call_value(&func, args)?;
        if let Some(n) = nresults {
            results.resize(n, Value::Nil);
        }
        self.stack.borrow_mut().extend(results);
        Ok(())
    }

    /// Calls `func` directly with host-supplied arguments.
    pub fn call_value(&self, func: &Value, args: Vec<Value>) -> LuaResult<Vec<Value>> {
        match func {
            Value::Function(f) => exec::call_function(self, f, args),
            other => Err(LuaError::runtime(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }

    // ---- Chunks ----

    /// Parses source text or a dumped chunk and pushes the resulting function.
    pub fn load(&self, bytes: &[u8], chunk: &str) -> LuaResult<()> {
        let proto = if proto::is_binary(bytes) {
            debug!("load: binary chunk '{chunk}' ({} bytes)", bytes.len());
            proto::undump(bytes, chunk)?
        } else {
            debug!("load: source chunk '{chunk}' ({} bytes)", bytes.len());
            let block = parser::parse(bytes, chunk)?;
            compiler::compile(&block, chunk)?
        };
        self.push_proto(proto);
        Ok(())
    }

    fn push_proto(&self, proto: Proto) {
        let closure = Closure {
            proto: Arc::new(proto),
            upvalues: Vec::new(),
        };
        self.push(Value::Function(Function::Lua(Arc::new(closure))));
    }

    /// Serializes the function on top of the stack.
    pub fn dump(&self) -> LuaResult<Vec<u8>> {
        match self.to_value(-1)? {
            Value::Function(Function::Lua(closure)) => proto::dump(&closure.proto),
            _ => Err(LuaError::Dump),
        }
    }

    // ---- Output ----

    /// Replaces the destination of `print`, returning the previous one.
    pub fn set_output(&self, writer: Option<SharedWriter>) -> Option<SharedWriter> {
        std::mem::replace(&mut *self.output.borrow_mut(), writer)
    }

    pub(crate) fn write_output(&self, bytes: &[u8]) -> std::io::Result<()> {
        let writer = self.output.borrow().clone();
        match writer {
            Some(w) => {
                let mut w = w.lock();
                w.write_all(bytes)?;
                w.flush()
            }
            None => {
                let mut out = std::io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()
            }
        }
    }

    // ---- Errors ----

    /// `"<chunk>:<line>: "` of the function `level` frames below the running one,
    /// empty for host functions and level 0.
    pub fn where_(&self, level: usize) -> String {
        if level == 0 {
            return String::new();
        }
        self.frame_position(level)
    }

    /// Position prefix of the frame `from_top` frames below the innermost one.
    pub(crate) fn frame_position(&self, from_top: usize) -> String {
        let frames = self.frames.borrow();
        let Some(pos) = frames.len().checked_sub(from_top + 1) else {
            return String::new();
        };
        match &frames[pos].kind {
            FrameKind::Lua { source, .. } => format!("{}:{}: ", source, frames[pos].line.get()),
            FrameKind::Native => String::new(),
        }
    }

    /// A runtime error positioned at the caller of the running host function.
    pub fn error(&self, msg: impl AsRef<str>) -> LuaError {
        self.error_at(1, msg)
    }

    pub fn error_at(&self, level: usize, msg: impl AsRef<str>) -> LuaError {
        LuaError::runtime(format!("{}{}", self.where_(level), msg.as_ref()))
    }

    /// Renders the active call frames, innermost first.
    pub fn traceback(&self) -> String {
        let frames = self.frames.borrow();
        let mut out = String::from("stack traceback:");
        for frame in frames.iter().rev() {
            match &frame.kind {
                FrameKind::Native => {
                    out.push_str(&format!("\n\t[C]: in function '{}'", frame.name));
                }
                FrameKind::Lua { source, main: true } => {
                    out.push_str(&format!("\n\t{}:{}: in main chunk", source, frame.line.get()));
                }
                FrameKind::Lua { source, .. } if &*frame.name == "?" => {
                    out.push_str(&format!(
                        "\n\t{}:{}: in function <{}:{}>",
                        source,
                        frame.line.get(),
                        source,
                        frame.line_defined
                    ));
                }
                FrameKind::Lua { source, .. } => {
                    out.push_str(&format!(
                        "\n\t{}:{}: in function '{}'",
                        source,
                        frame.line.get(),
                        frame.name
                    ));
                }
            }
        }
        out
    }
}
