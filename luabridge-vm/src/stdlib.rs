use crate::error::{LuaError, LuaResult};
use crate::state::State;
use crate::value::{NativeFunction, TableId, Value};

type Args = Vec<Value>;

// ---- Argument helpers ----

fn type_or_none(args: &Args, i: usize) -> &'static str {
    args.get(i).map_or("no value", |v| v.type_name())
}

fn bad_arg(state: &State, i: usize, fname: &str, msg: &str) -> LuaError {
    state.error(format!("bad argument #{} to '{}' ({})", i + 1, fname, msg))
}

fn check_any<'a>(state: &State, args: &'a Args, i: usize, fname: &str) -> LuaResult<&'a Value> {
    args.get(i)
        .ok_or_else(|| bad_arg(state, i, fname, "value expected"))
}

fn check_table(state: &State, args: &Args, i: usize, fname: &str) -> LuaResult<TableId> {
    match args.get(i) {
        Some(Value::Table(id)) => Ok(*id),
        _ => Err(bad_arg(
            state,
            i,
            fname,
            &format!("table expected, got {}", type_or_none(args, i)),
        )),
    }
}

fn check_number(state: &State, args: &Args, i: usize, fname: &str) -> LuaResult<f64> {
    args.get(i).and_then(|v| v.to_number()).ok_or_else(|| {
        bad_arg(
            state,
            i,
            fname,
            &format!("number expected, got {}", type_or_none(args, i)),
        )
    })
}

fn opt_number(state: &State, args: &Args, i: usize, fname: &str, default: f64) -> LuaResult<f64> {
    match args.get(i) {
        None | Some(Value::Nil) => Ok(default),
        Some(_) => check_number(state, args, i, fname),
    }
}

fn check_string(state: &State, args: &Args, i: usize, fname: &str) -> LuaResult<String> {
    args.get(i).and_then(|v| v.to_str_coerced()).ok_or_else(|| {
        bad_arg(
            state,
            i,
            fname,
            &format!("string expected, got {}", type_or_none(args, i)),
        )
    })
}

fn register(state: &State, table: TableId, name: &str, f: NativeFunction) {
    // the freshly allocated library tables are always valid
    let _ = state.table_set(table, Value::string(name), Value::from(f));
}

fn native<F>(name: &str, f: F) -> NativeFunction
where
    F: Fn(&State, Args) -> LuaResult<Vec<Value>> + Send + Sync + 'static,
{
    NativeFunction::new(name, f)
}

fn table_length(state: &State, id: TableId) -> LuaResult<i64> {
    state.with_table(id, |t| t.length() as i64)
}

/// Installs the base library and the `table`, `math` and `string` tables.
pub fn open(state: &State) {
    let g = state.globals();

    register(
        state,
        g,
        "print",
        native("print", |state, args| {
            let line = args
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("\t");
            state
                .write_output(format!("{line}\n").as_bytes())
                .map_err(|e| state.error(format!("print: {e}")))?;
            Ok(Vec::new())
        }),
    );

    register(
        state,
        g,
        "error",
        native("error", |state, args| {
            let msg = args.first().cloned().unwrap_or_default();
            let level = opt_number(state, &args, 1, "error", 1.0)? as usize;
            let text = match &msg {
                Value::String(s) => format!("{}{}", state.where_(level), s),
                other => other.to_string(),
            };
            Err(LuaError::runtime(text))
        }),
    );

    register(
        state,
        g,
        "assert",
        native("assert", |state, args| {
            let v = check_any(state, &args, 0, "assert")?;
            if v.truthy() {
                return Ok(args);
            }
            let msg = match args.get(1) {
                Some(m) => m.to_string(),
                None => "assertion failed!".to_string(),
            };
            Err(state.error(msg))
        }),
    );

    register(
        state,
        g,
        "type",
        native("type", |state, args| {
            let v = check_any(state, &args, 0, "type")?;
            Ok(vec![Value::string(v.type_name())])
        }),
    );

    register(
        state,
        g,
        "tostring",
        native("tostring", |state, args| {
            let v = check_any(state, &args, 0, "tostring")?;
            Ok(vec![Value::from(v.to_string())])
        }),
    );

    register(
        state,
        g,
        "tonumber",
        native("tonumber", |state, args| {
            let v = check_any(state, &args, 0, "tonumber")?;
            let base = opt_number(state, &args, 1, "tonumber", 10.0)? as u32;
            if base == 10 {
                return Ok(vec![v.to_number().map(Value::Number).unwrap_or_default()]);
            }
            if !(2..=36).contains(&base) {
                return Err(bad_arg(state, 1, "tonumber", "base out of range"));
            }
            let s = check_string(state, &args, 0, "tonumber")?;
            let parsed = i64::from_str_radix(s.trim(), base).ok();
            Ok(vec![parsed.map(|n| Value::Number(n as f64)).unwrap_or_default()])
        }),
    );

    let next = native("next", |state, args| {
        let t = check_table(state, &args, 0, "next")?;
        let key = args.get(1).cloned().unwrap_or_default();
        match state.table_next(t, &key).map_err(|e| state.error(e.to_string()))? {
            Some((k, v)) => Ok(vec![k, v]),
            None => Ok(vec![Value::Nil]),
        }
    });
    register(state, g, "next", next.clone());

    register(
        state,
        g,
        "pairs",
        native("pairs", move |state, args| {
            let t = check_table(state, &args, 0, "pairs")?;
            Ok(vec![Value::from(next.clone()), Value::Table(t), Value::Nil])
        }),
    );

    let ipairs_step = native("ipairs_step", |state, args| {
        let t = check_table(state, &args, 0, "ipairs")?;
        let i = check_number(state, &args, 1, "ipairs")? + 1.0;
        let v = state.table_get(t, &Value::Number(i))?;
        if v.is_nil() {
            Ok(vec![Value::Nil])
        } else {
            Ok(vec![Value::Number(i), v])
        }
    });
    register(
        state,
        g,
        "ipairs",
        native("ipairs", move |state, args| {
            let t = check_table(state, &args, 0, "ipairs")?;
            Ok(vec![
                Value::from(ipairs_step.clone()),
                Value::Table(t),
                Value::Number(0.0),
            ])
        }),
    );

    register(
        state,
        g,
        "select",
        native("select", |state, mut args| {
            if args.first().and_then(|v| v.as_str()) == Some("#") {
                return Ok(vec![Value::Number((args.len() - 1) as f64)]);
            }
            let n = check_number(state, &args, 0, "select")? as i64;
            let count = args.len() as i64 - 1;
            let from = if n < 0 { count + n } else { n - 1 };
            if n == 0 || from < 0 {
                return Err(bad_arg(state, 0, "select", "index out of range"));
            }
            let from = (from + 1).min(args.len() as i64) as usize;
            Ok(args.split_off(from))
        }),
    );

    register(
        state,
        g,
        "rawget",
        native("rawget", |state, args| {
            let t = check_table(state, &args, 0, "rawget")?;
            let key = check_any(state, &args, 1, "rawget")?;
            Ok(vec![state.table_get(t, key)?])
        }),
    );

    register(
        state,
        g,
        "rawset",
        native("rawset", |state, args| {
            let t = check_table(state, &args, 0, "rawset")?;
            let key = check_any(state, &args, 1, "rawset")?.clone();
            let value = check_any(state, &args, 2, "rawset")?.clone();
            state
                .table_set(t, key, value)
                .map_err(|e| state.error(e.to_string()))?;
            Ok(vec![Value::Table(t)])
        }),
    );

    register(
        state,
        g,
        "rawequal",
        native("rawequal", |state, args| {
            let a = check_any(state, &args, 0, "rawequal")?;
            let b = check_any(state, &args, 1, "rawequal")?;
            Ok(vec![Value::Boolean(a == b)])
        }),
    );

    register(
        state,
        g,
        "unpack",
        native("unpack", |state, args| {
            let t = check_table(state, &args, 0, "unpack")?;
            let i = opt_number(state, &args, 1, "unpack", 1.0)? as i64;
            let j = match args.get(2) {
                None | Some(Value::Nil) => table_length(state, t)?,
                Some(_) => check_number(state, &args, 2, "unpack")? as i64,
            };
            if j - i >= 8000 {
                return Err(state.error("too many results to unpack"));
            }
            state.with_table(t, |tbl| (i..=j).map(|k| tbl.get_int(k)).collect())
        }),
    );

    register(
        state,
        g,
        "pcall",
        native("pcall", |state, mut args| {
            if args.is_empty() {
                return Err(bad_arg(state, 0, "pcall", "value expected"));
            }
            let f = args.remove(0);
            match state.call_value(&f, args) {
                Ok(mut results) => {
                    results.insert(0, Value::Boolean(true));
                    Ok(results)
                }
                Err(e) => Ok(vec![Value::Boolean(false), Value::from(e.message())]),
            }
        }),
    );

    open_table(state);
    open_math(state);
    open_string(state);
}

fn open_table(state: &State) {
    let lib = state.alloc_table();
    let _ = state.table_set(state.globals(), Value::string("table"), Value::Table(lib));

    register(
        state,
        lib,
        "insert",
        native("insert", |state, args| {
            let t = check_table(state, &args, 0, "insert")?;
            let n = table_length(state, t)?;
            match args.len() {
                2 => state.table_set(t, Value::Number((n + 1) as f64), args[1].clone())?,
                3 => {
                    let pos = check_number(state, &args, 1, "insert")? as i64;
                    state.with_table_mut(t, |tbl| {
                        if pos <= n {
                            tbl.move_range(pos, n - pos + 1, pos + 1)?;
                        }
                        tbl.set_int(pos, args[2].clone())
                    })?;
                }
                _ => return Err(state.error("wrong number of arguments to 'insert'")),
            }
            Ok(Vec::new())
        }),
    );

    register(
        state,
        lib,
        "remove",
        native("remove", |state, args| {
            let t = check_table(state, &args, 0, "remove")?;
            let n = table_length(state, t)?;
            let pos = opt_number(state, &args, 1, "remove", n as f64)? as i64;
            if n == 0 {
                return Ok(vec![Value::Nil]);
            }
            let removed = state.with_table_mut(t, |tbl| {
                let v = tbl.get_int(pos);
                if pos < n {
                    tbl.move_range(pos + 1, n - pos, pos)?;
                }
                tbl.set_int(n, Value::Nil)?;
                Ok(v)
            })?;
            Ok(vec![removed])
        }),
    );

    register(
        state,
        lib,
        "concat",
        native("concat", |state, args| {
            let t = check_table(state, &args, 0, "concat")?;
            let sep = match args.get(1) {
                None | Some(Value::Nil) => String::new(),
                Some(_) => check_string(state, &args, 1, "concat")?,
            };
            let i = opt_number(state, &args, 2, "concat", 1.0)? as i64;
            let j = match args.get(3) {
                None | Some(Value::Nil) => table_length(state, t)?,
                Some(_) => check_number(state, &args, 3, "concat")? as i64,
            };
            let mut parts = Vec::new();
            for k in i..=j {
                let v = state.with_table(t, |tbl| tbl.get_int(k))?;
                match v.to_str_coerced() {
                    Some(s) => parts.push(s),
                    None => {
                        return Err(state.error(format!(
                            "invalid value (at index {k}) in table for 'concat'"
                        )))
                    }
                }
            }
            Ok(vec![Value::from(parts.join(&sep))])
        }),
    );
}

fn open_math(state: &State) {
    let lib = state.alloc_table();
    let _ = state.table_set(state.globals(), Value::string("math"), Value::Table(lib));
    let _ = state.table_set(lib, Value::string("huge"), Value::Number(f64::INFINITY));
    let _ = state.table_set(lib, Value::string("pi"), Value::Number(std::f64::consts::PI));

    register(
        state,
        lib,
        "floor",
        native("floor", |state, args| {
            Ok(vec![Value::Number(check_number(state, &args, 0, "floor")?.floor())])
        }),
    );
    register(
        state,
        lib,
        "abs",
        native("abs", |state, args| {
            Ok(vec![Value::Number(check_number(state, &args, 0, "abs")?.abs())])
        }),
    );
    register(
        state,
        lib,
        "max",
        native("max", |state, args| {
            let mut best = check_number(state, &args, 0, "max")?;
            for i in 1..args.len() {
                best = best.max(check_number(state, &args, i, "max")?);
            }
            Ok(vec![Value::Number(best)])
        }),
    );
    register(
        state,
        lib,
        "min",
        native("min", |state, args| {
            let mut best = check_number(state, &args, 0, "min")?;
            for i in 1..args.len() {
                best = best.min(check_number(state, &args, i, "min")?);
            }
            Ok(vec![Value::Number(best)])
        }),
    );
}

/// Byte range of `s` selected by Lua-style `i`, `j` (1-based, negative from the end).
fn sub_range(len: usize, i: i64, j: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if i < 0 { (len + i + 1).max(1) } else { i.max(1) };
    let end = if j < 0 { len + j + 1 } else { j.min(len) };
    if start > end {
        return None;
    }
    Some(((start - 1) as usize, end as usize))
}

fn open_string(state: &State) {
    let lib = state.alloc_table();
    let _ = state.table_set(state.globals(), Value::string("string"), Value::Table(lib));

    register(
        state,
        lib,
        "len",
        native("len", |state, args| {
            let s = check_string(state, &args, 0, "len")?;
            Ok(vec![Value::Number(s.len() as f64)])
        }),
    );
    register(
        state,
        lib,
        "sub",
        native("sub", |state, args| {
            let s = check_string(state, &args, 0, "sub")?;
            let i = opt_number(state, &args, 1, "sub", 1.0)? as i64;
            let j = opt_number(state, &args, 2, "sub", -1.0)? as i64;
            let out = match sub_range(s.len(), i, j) {
                Some((from, to)) => String::from_utf8_lossy(&s.as_bytes()[from..to]).into_owned(),
                None => String::new(),
            };
            Ok(vec![Value::from(out)])
        }),
    );
    register(
        state,
        lib,
        "upper",
        native("upper", |state, args| {
            Ok(vec![Value::from(check_string(state, &args, 0, "upper")?.to_uppercase())])
        }),
    );
    register(
        state,
        lib,
        "lower",
        native("lower", |state, args| {
            Ok(vec![Value::from(check_string(state, &args, 0, "lower")?.to_lowercase())])
        }),
    );
    register(
        state,
        lib,
        "rep",
        native("rep", |state, args| {
            let s = check_string(state, &args, 0, "rep")?;
            let n = check_number(state, &args, 1, "rep")?;
            let n = if n > 0.0 { n as usize } else { 0 };
            Ok(vec![Value::from(s.repeat(n))])
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    fn eval(state: &State, src: &str) -> LuaResult<Vec<Value>> {
        state.load(src.as_bytes(), "lib")?;
        let base = state.get_top() - 1;
        state.call(0, None)?;
        let top = state.get_top();
        let out = ((base + 1) as i32..=top as i32)
            .map(|i| state.to_value(i))
            .collect::<LuaResult<Vec<_>>>();
        state.set_top(base);
        out
    }

    #[test]
    fn error_levels() {
        let state = State::with_libs();
        let err = eval(&state, "\nerror('boom')").unwrap_err();
        assert_eq!(err.to_string(), "lib:2: boom");
        let err = eval(&state, "error('plain', 0)").unwrap_err();
        assert_eq!(err.to_string(), "plain");
        let src = "local function check(x)\n error('bad x', 2)\nend\n\ncheck(1)";
        let err = eval(&state, src).unwrap_err();
        assert_eq!(err.to_string(), "lib:5: bad x");
    }

    #[test]
    fn pcall_catches_and_restores_depth() {
        let state = State::with_libs();
        let out = eval(&state, "return pcall(function() error('x', 0) end)").unwrap();
        assert_eq!(out, vec![Value::Boolean(false), Value::from("x")]);
        assert_eq!(state.depth.get(), 0);
        assert!(state.frames.borrow().is_empty());
    }

    #[test]
    fn table_library() {
        let state = State::with_libs();
        let src = r#"
            local t = { 'a', 'c' }
            table.insert(t, 2, 'b')
            table.insert(t, 'd')
            local removed = table.remove(t, 1)
            return table.concat(t, ','), removed, #t
        "#;
        let out = eval(&state, src).unwrap();
        assert_eq!(out, vec![Value::from("b,c,d"), Value::from("a"), Value::Number(3.0)]);
    }

    #[test]
    fn string_and_math() {
        let state = State::with_libs();
        let src = "return string.sub('hello', 2, -2), ('ab'):rep(3), math.max(3, 9, 4), math.floor(-1.5), tonumber('ff', 16)";
        let out = eval(&state, src).unwrap();
        assert_eq!(out, vec![
            Value::from("ell"),
            Value::from("ababab"),
            Value::Number(9.0),
            Value::Number(-2.0),
            Value::Number(255.0),
        ]);
    }

    #[test]
    fn print_goes_to_output() {
        let state = State::with_libs();
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for Sink {
            fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(b);
                Ok(b.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        state.set_output(Some(Arc::new(Mutex::new(Sink(buf.clone())))));
        eval(&state, "print('a', 1, nil, true)").unwrap();
        assert_eq!(&*buf.lock(), b"a\t1\tnil\ttrue\n");
    }

    #[test]
    fn bad_arguments() {
        let state = State::with_libs();
        let err = eval(&state, "return string.rep()").unwrap_err();
        assert_eq!(
            err.to_string(),
            "lib:1: bad argument #1 to 'rep' (string expected, got no value)"
        );
    }
}
