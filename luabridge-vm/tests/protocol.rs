use anyhow::Result;
use luabridge_vm::{LuaError, NativeFunction, State, Value};
use pretty_assertions::assert_eq;

#[test]
fn host_function_reenters_protocol() -> Result<()> {
    let state = State::with_libs();
    // a host function that builds a table through the stack protocol
    state.push_function(NativeFunction::new("make", |state, args| {
        let top = state.get_top();
        let id = state.new_table();
        for (i, v) in args.into_iter().enumerate() {
            state.push(v);
            state.raw_set_int(-2, i as i64 + 1)?;
        }
        state.set_top(top);
        Ok(vec![Value::Table(id)])
    }));
    state.set_global("make")?;

    state.load(b"local t = make('a', 'b', 'c')\nreturn #t, t[2]", "host")?;
    state.call(0, None)?;
    assert_eq!(state.get_top(), 2);
    assert_eq!(state.to_value(1)?, Value::Number(3.0));
    assert_eq!(state.to_value(2)?, Value::from("b"));
    Ok(())
}

#[test]
fn syntax_error_is_a_load_error() {
    let state = State::with_libs();
    let err = state.load(b"return return", "test9").unwrap_err();
    assert!(err.is_load_error());
    assert_eq!(err.to_string(), "test9:1: unexpected symbol near 'return'");
    assert_eq!(state.get_top(), 0);
}

#[test]
fn failed_call_pushes_nothing() {
    let state = State::with_libs();
    state.push_string("sentinel");
    state.load(b"local a = nil; return a + 1", "arith").unwrap();
    let err = state.call(0, Some(1)).unwrap_err();
    assert!(matches!(err, LuaError::Runtime { .. }));
    assert_eq!(err.to_string(), "arith:1: attempt to perform arithmetic on a nil value");
    assert_eq!(state.get_top(), 1);
}

#[test]
fn dumped_chunks_reload_in_a_fresh_state() -> Result<()> {
    let first = State::with_libs();
    first.load(b"local n = ... return n * 2", "double")?;
    let bytes = first.dump()?;
    assert!(bytes.starts_with(b"\x1bLuB"));

    let second = State::with_libs();
    second.load(&bytes, "ignored")?;
    second.push_number(21.0);
    second.call(1, Some(1))?;
    assert_eq!(second.to_value(-1)?, Value::Number(42.0));
    Ok(())
}

#[test]
fn traversal_tolerates_clearing() -> Result<()> {
    let state = State::with_libs();
    state.load(
        br#"
        local t = { x = 1, y = 2, z = 3, 10, 20 }
        local n = 0
        for k in pairs(t) do t[k] = nil; n = n + 1 end
        return n, next(t)
        "#,
        "clear",
    )?;
    state.call(0, None)?;
    assert_eq!(state.to_value(1)?, Value::Number(5.0));
    assert_eq!(state.to_value(2)?, Value::Nil);
    Ok(())
}

#[test]
fn traceback_lists_frames() {
    let state = State::with_libs();
    state
        .load(b"local function inner()\n  error('deep')\nend\ninner()", "tb")
        .unwrap();
    let err = state.call(0, None).unwrap_err();
    assert_eq!(err.to_string(), "tb:2: deep");
    let tb = err.traceback().unwrap_or_default().to_string();
    assert!(tb.starts_with("stack traceback:"), "{tb}");
    assert!(tb.contains("[C]: in function 'error'"), "{tb}");
    assert!(tb.contains("tb:2: in function 'inner'"), "{tb}");
    assert!(tb.contains("tb:4: in main chunk"), "{tb}");
}
