//! Script-side handles for the context's `reader`, `writer` and
//! `errorWriter` streams.

use std::io::{BufRead, Read, Write};
use std::sync::Arc;

use luabridge_vm::{LuaError, LuaResult, NativeFunction, SharedWriter, State, TableId, Value};
use parking_lot::Mutex;

use super::context::{ScriptContext, SharedReader};

type Slot<T> = Arc<Mutex<Option<T>>>;

pub(crate) const READER: &str = "reader";
pub(crate) const WRITER: &str = "writer";
pub(crate) const ERROR_WRITER: &str = "errorWriter";

/// The three stream tables of one runtime.
///
/// Tables are created once; each evaluation only swaps the streams behind
/// them and rebinds the globals.
pub(crate) struct Streams {
    reader: Slot<SharedReader>,
    writer: Slot<SharedWriter>,
    error_writer: Slot<SharedWriter>,
    reader_table: TableId,
    writer_table: TableId,
    error_writer_table: TableId,
}

impl Streams {
    pub(crate) fn install(state: &State) -> Self {
        let reader: Slot<SharedReader> = Arc::new(Mutex::new(None));
        let writer: Slot<SharedWriter> = Arc::new(Mutex::new(None));
        let error_writer: Slot<SharedWriter> = Arc::new(Mutex::new(None));

        let reader_table = state.alloc_table();
        register(state, reader_table, read_function(reader.clone()));
        let writer_table = state.alloc_table();
        register(state, writer_table, write_function(writer.clone()));
        register(state, writer_table, flush_function(writer.clone()));
        let error_writer_table = state.alloc_table();
        register(state, error_writer_table, write_function(error_writer.clone()));
        register(state, error_writer_table, flush_function(error_writer.clone()));

        Self {
            reader,
            writer,
            error_writer,
            reader_table,
            writer_table,
            error_writer_table,
        }
    }

    /// Points the stream tables at the context's streams and binds them as
    /// globals; a missing stream binds nil.
    pub(crate) fn attach(&self, state: &State, ctx: &ScriptContext) -> LuaResult<()> {
        *self.reader.lock() = ctx.reader().cloned();
        *self.writer.lock() = ctx.writer().cloned();
        *self.error_writer.lock() = ctx.error_writer().cloned();

        let globals = state.globals();
        let bind = |name: &str, present: bool, table: TableId| {
            let value = if present { Value::Table(table) } else { Value::Nil };
            state.table_set(globals, Value::from(name), value)
        };
        bind(READER, ctx.reader().is_some(), self.reader_table)?;
        bind(WRITER, ctx.writer().is_some(), self.writer_table)?;
        bind(ERROR_WRITER, ctx.error_writer().is_some(), self.error_writer_table)
    }
}

fn register(state: &State, table: TableId, f: NativeFunction) {
    // string keys on a fresh table can not fail
    let _ = state.table_set(table, Value::string(f.name()), f.into());
}

fn closed(state: &State, fname: &str) -> LuaError {
    state.error(format!("{fname}: stream is closed"))
}

/// `stream:write(...)`, accepting strings and numbers; returns the stream.
fn write_function(slot: Slot<SharedWriter>) -> NativeFunction {
    NativeFunction::new("write", move |state, args| {
        let Some(writer) = slot.lock().clone() else {
            return Err(closed(state, "write"));
        };
        let mut out = Vec::new();
        for (i, arg) in args.iter().enumerate().skip(1) {
            match arg {
                Value::String(_) | Value::Number(_) => out.extend_from_slice(arg.to_string().as_bytes()),
                other => {
                    return Err(state.error(format!(
                        "bad argument #{} to 'write' (string expected, got {})",
                        i + 1,
                        other.type_name()
                    )))
                }
            }
        }
        writer
            .lock()
            .write_all(&out)
            .map_err(|e| state.error(format!("write: {e}")))?;
        Ok(vec![args.into_iter().next().unwrap_or_default()])
    })
}

fn flush_function(slot: Slot<SharedWriter>) -> NativeFunction {
    NativeFunction::new("flush", move |state, _args| {
        let Some(writer) = slot.lock().clone() else {
            return Err(closed(state, "flush"));
        };
        writer
            .lock()
            .flush()
            .map_err(|e| state.error(format!("flush: {e}")))?;
        Ok(Vec::new())
    })
}

/// `reader:read([fmt])` with `"*l"` (default), `"*a"` or a byte count.
/// Returns nil at end of input.
fn read_function(slot: Slot<SharedReader>) -> NativeFunction {
    NativeFunction::new("read", move |state, args| {
        let Some(reader) = slot.lock().clone() else {
            return Err(closed(state, "read"));
        };
        let mut reader = reader.lock();
        let io_error = |e: std::io::Error| state.error(format!("read: {e}"));
        let value = match args.get(1) {
            None | Some(Value::Nil) => read_line(&mut *reader).map_err(io_error)?,
            Some(Value::String(fmt)) if fmt.starts_with("*l") => {
                read_line(&mut *reader).map_err(io_error)?
            }
            Some(Value::String(fmt)) if fmt.starts_with("*a") => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes).map_err(io_error)?;
                Value::from(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(Value::Number(n)) if *n >= 0.0 => {
                let mut bytes = Vec::new();
                (&mut *reader)
                    .take(*n as u64)
                    .read_to_end(&mut bytes)
                    .map_err(io_error)?;
                if bytes.is_empty() && *n > 0.0 {
                    Value::Nil
                } else {
                    Value::from(String::from_utf8_lossy(&bytes).into_owned())
                }
            }
            Some(_) => return Err(state.error("bad argument #1 to 'read' (invalid format)")),
        };
        Ok(vec![value])
    })
}

fn read_line(reader: &mut dyn BufRead) -> std::io::Result<Value> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Ok(Value::Nil);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Ok(Value::from(String::from_utf8_lossy(&line).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn lines_then_nil() {
        let mut input = Cursor::new(b"one\r\ntwo".to_vec());
        assert_eq!(read_line(&mut input).unwrap(), Value::from("one"));
        assert_eq!(read_line(&mut input).unwrap(), Value::from("two"));
        assert_eq!(read_line(&mut input).unwrap(), Value::Nil);
    }
}
