use std::io::Cursor;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use luabridge::{
    CompiledChunk, EngineConfigBuilder, Encoding, Error, Object, ScriptContext, ScriptEngine,
    SimpleBindings,
};
use luabridge_nls::Decoder;
use luabridge_vm::opcode::{Count, OpCode};
use luabridge_vm::proto::{self, Proto, UpvalDesc};
use luabridge_vm::{LuaError, NativeFunction, Value};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn buffer() -> Arc<Mutex<Vec<u8>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn text(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&buf.lock()).into_owned()
}

#[test]
fn evaluates_expressions() -> Result<()> {
    let engine = ScriptEngine::new();
    assert_eq!(engine.eval("return 1+1")?, Object::Number(2.0));
    assert_eq!(engine.eval("return 'a' .. 'b', 2")?, Object::from("ab"));
    Ok(())
}

#[test]
fn runtime_errors_are_located() {
    let engine = ScriptEngine::new();
    let ctx = ScriptContext::new().with_filename("main.lua");
    let err = engine.eval_with("local x = 1\nerror('boom')", &ctx).unwrap_err();
    let Error::Script(err) = err else {
        panic!("expected a script error, got {err:?}");
    };
    assert!(err.message.contains("boom"));
    assert_eq!(err.source_name.as_deref(), Some("main.lua"));
    assert_eq!(err.line_number, Some(2));
}

#[test]
fn unlocated_runtime_error() {
    let engine = ScriptEngine::new();
    let Err(Error::Script(err)) = engine.eval("error('plain', 0)") else {
        panic!("expected a script error");
    };
    assert_eq!(err.message, "plain");
    assert_eq!(err.source_name, None);
    assert_eq!(err.line_number, None);
}

#[test]
fn script_errors_carry_a_traceback() {
    let engine = ScriptEngine::new();
    let ctx = ScriptContext::new().with_filename("tb");
    let src = "local function inner()\n  error('deep')\nend\ninner()";
    let Err(Error::Script(err)) = engine.eval_with(src, &ctx) else {
        panic!("expected a script error");
    };
    assert_eq!(err.message, "tb:2: deep");
    let traceback = err.traceback.unwrap_or_default();
    assert!(traceback.contains("tb:2: in function 'inner'"), "{traceback}");
}

#[test]
fn syntax_errors_are_load_errors() {
    let engine = ScriptEngine::new();
    let ctx = ScriptContext::new().with_filename("test9");
    let Err(Error::Load(err)) = engine.eval_with("return return", &ctx) else {
        panic!("expected a load error");
    };
    assert_eq!(err.message, "test9:1: unexpected symbol near 'return'");
    assert_eq!(err.source_name.as_deref(), Some("test9"));
    assert_eq!(err.line_number, Some(1));
}

#[test]
fn compiled_chunks_run_repeatedly() -> Result<()> {
    let engine = ScriptEngine::new();
    let chunk = engine.compile("counter = (counter or 0) + 1\nreturn 41")?;
    assert_eq!(chunk.eval(&engine, engine.context())?, Object::Number(41.0));
    assert_eq!(engine.eval_chunk(&chunk, engine.context())?, Object::Number(41.0));
    assert_eq!(engine.eval("return counter")?, Object::Number(2.0));

    let copy = CompiledChunk::from_bytes(chunk.as_bytes().to_vec())?;
    let other = ScriptEngine::new();
    assert_eq!(other.eval_chunk(&copy, other.context())?, Object::Number(41.0));
    assert!(CompiledChunk::from_bytes(b"return 1".to_vec()).is_err());
    Ok(())
}

#[test]
fn compile_reports_syntax_errors() {
    let engine = ScriptEngine::new();
    assert!(matches!(engine.compile("x = = 1"), Err(Error::Load(_))));
}

#[test]
fn dotted_bindings_use_the_trailing_segment() -> Result<()> {
    let engine = ScriptEngine::new();
    let mut scope = SimpleBindings::new();
    scope.put("app.name", "X")?;
    let ctx = ScriptContext::new().with_global_scope(scope);
    assert_eq!(engine.eval_with("return name", &ctx)?, Object::from("X"));
    Ok(())
}

#[test]
fn engine_scope_overrides_global_scope() -> Result<()> {
    let engine = ScriptEngine::new();
    let global = SimpleBindings::try_from_pairs([("v", "global"), ("only", "g")])?;
    let local = engine.create_bindings();
    local.put("v", "engine")?;
    let ctx = ScriptContext::new()
        .with_global_scope(global)
        .with_engine_scope(local);
    assert_eq!(engine.eval_with("return v .. only", &ctx)?, Object::from("engineg"));
    Ok(())
}

#[test]
fn put_and_get_go_through_the_globals() -> Result<()> {
    let mut engine = ScriptEngine::new();
    engine.put("answer", 42.0)?;
    assert_eq!(engine.eval("return answer")?, Object::Number(42.0));
    engine.eval("greeting = 'hi'")?;
    assert_eq!(engine.get("greeting")?, Some(Object::from("hi")));
    assert!(engine.bindings().contains_key("greeting")?);
    Ok(())
}

#[test]
fn argv_is_vararg() -> Result<()> {
    let engine = ScriptEngine::new();
    let ctx = ScriptContext::new().with_argv(vec![2.0.into(), "x".into()]);
    assert_eq!(
        engine.eval_with("local a, b = ...\nreturn b .. a .. select('#', ...)", &ctx)?,
        Object::from("x22")
    );
    Ok(())
}

#[test]
fn invoke_function_and_method() -> Result<()> {
    let engine = ScriptEngine::new();
    let obj = engine.eval(
        r#"
        function add(a, b) return a + b end
        x = 1
        local obj = { n = 3 }
        function obj:times(k) return self.n * k end
        return obj
        "#,
    )?;
    assert_eq!(
        engine.invoke_function("add", vec![2.0.into(), 3.0.into()])?,
        Object::Number(5.0)
    );
    assert_eq!(engine.invoke_method(&obj, "times", vec![2.0.into()])?, Object::Number(6.0));

    let Err(Error::NoSuchMethod(msg)) = engine.invoke_function("nope", vec![]) else {
        panic!("expected NoSuchMethod");
    };
    assert_eq!(msg, "function 'nope' is undefined");
    assert!(matches!(engine.invoke_function("x", vec![]), Err(Error::NoSuchMethod(_))));
    let Err(Error::NoSuchMethod(msg)) = engine.invoke_method(&obj, "missing", vec![]) else {
        panic!("expected NoSuchMethod");
    };
    assert_eq!(msg, "method 'missing' is undefined");
    assert!(matches!(
        engine.invoke_method(&Object::Number(1.0), "times", vec![]),
        Err(Error::NotATable)
    ));
    Ok(())
}

#[test]
fn invoke_surfaces_script_errors() {
    let engine = ScriptEngine::new();
    engine
        .eval("function fail(msg) error(msg) end")
        .unwrap();
    let Err(Error::Script(err)) = engine.invoke_function("fail", vec!["bad".into()]) else {
        panic!("expected a script error");
    };
    assert_eq!(err.message, "null:1: bad");
}

#[test]
fn proxies_work_from_other_threads() -> Result<()> {
    let engine = ScriptEngine::new();
    let obj = engine.eval(
        r#"
        function greet(who) return 'hello ' .. who end
        local counter = { n = 0 }
        function counter:bump() self.n = self.n + 1; return self.n end
        return counter
        "#,
    )?;
    let globals = engine.get_interface(&["greet"]);
    let counter = engine.get_interface_of(&obj, &["bump"])?;

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let globals = globals.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                let greeting = globals.call("greet", vec![format!("t{i}").into()]).unwrap();
                counter.call("bump", vec![]).unwrap();
                greeting
            })
        })
        .collect();
    for (i, h) in handles.into_iter().enumerate() {
        assert_eq!(h.join().unwrap(), Object::from(format!("hello t{i}")));
    }
    assert_eq!(counter.call("bump", vec![])?, Object::Number(5.0));
    assert!(matches!(globals.call("bump", vec![]), Err(Error::NoSuchMethod(_))));
    assert!(matches!(
        engine.get_interface_of(&Object::from("s"), &["bump"]),
        Err(Error::NotATable)
    ));
    Ok(())
}

#[test]
fn context_streams_are_bound() -> Result<()> {
    let engine = ScriptEngine::new();
    let out = buffer();
    let err = buffer();
    let input = Cursor::new(b"line1\nrest of input".to_vec());
    let ctx = ScriptContext::new()
        .with_reader(Arc::new(Mutex::new(input)))
        .with_writer(out.clone())
        .with_error_writer(err.clone());
    let result = engine.eval_with(
        r#"
        print('hi', 1)
        writer:write('a', 2, '\n'):flush()
        errorWriter:write('oops')
        return reader:read() .. '|' .. reader:read('*a')
        "#,
        &ctx,
    )?;
    assert_eq!(result, Object::from("line1|rest of input"));
    assert_eq!(text(&out), "hi\t1\na2\n");
    assert_eq!(text(&err), "oops");

    // a context without streams leaves them unbound
    let bare = ScriptContext::new();
    assert_eq!(engine.eval_with("return writer", &bare)?, Object::Nil);
    Ok(())
}

#[test]
fn reader_sources_are_decoded() -> Result<()> {
    let config = EngineConfigBuilder::new()
        .with_source_encoding(Encoding::ShiftJis)
        .get();
    let engine = ScriptEngine::with_config(config);
    let bytes = Decoder::new(Encoding::ShiftJis).encode("return '日本語'").into_owned();
    assert_eq!(
        engine.eval_reader(Cursor::new(bytes), engine.context())?,
        Object::from("日本語")
    );

    let utf8 = ScriptEngine::new();
    assert!(matches!(
        utf8.eval_reader(Cursor::new(b"return '\xff'".to_vec()), utf8.context()),
        Err(Error::Transcoding(_))
    ));
    Ok(())
}

#[test]
fn bare_engines_have_no_library() {
    let config = EngineConfigBuilder::new().with_open_libs(false).get();
    let engine = ScriptEngine::with_config(config);
    assert_eq!(engine.eval("return print").unwrap(), Object::Nil);
    assert_eq!(engine.eval("return 2 * 21").unwrap(), Object::Number(42.0));
}

#[test]
fn corrupt_chunks_fail_to_load() -> Result<()> {
    let bogus = Proto {
        code: vec![OpCode::GetUpval(0), OpCode::Return(Count::Fixed(1))],
        lines: vec![1, 1],
        upvalues: vec![UpvalDesc::Local(0)],
        num_slots: 1,
        ..Default::default()
    };
    let chunk = CompiledChunk::from_bytes(proto::dump(&bogus)?)?;
    let engine = ScriptEngine::new();
    assert!(matches!(
        engine.eval_chunk(&chunk, engine.context()),
        Err(Error::Load(_))
    ));
    assert_eq!(engine.runtime().enter(|s| s.get_top()), 0);
    Ok(())
}

#[test]
fn long_operator_chains_evaluate() -> Result<()> {
    let engine = ScriptEngine::new();
    let sum = format!("return 1{}", "+1".repeat(2000));
    assert_eq!(engine.eval(&sum)?, Object::Number(2001.0));
    let chain = format!("return false{} or 'last'", " or false".repeat(2000));
    assert_eq!(engine.eval(&chain)?, Object::from("last"));
    Ok(())
}

#[test]
fn host_functions_reenter_the_runtime() -> Result<()> {
    let engine = ScriptEngine::new();
    let globals = engine.bindings();
    let proxy = engine.get_interface(&["inner"]);
    let runtime = engine.runtime().clone();
    let callback = NativeFunction::new("cb", move |_state, _args| {
        let reenter = || -> luabridge::Result<Value> {
            globals.put("seen", 5.0)?;
            proxy.call("inner", vec![])?.into_value(&runtime)
        };
        reenter()
            .map(|v| vec![v])
            .map_err(|e| LuaError::api(e.to_string()))
    });
    engine.runtime().enter(|state| -> Result<()> {
        state.push_function(callback);
        state.set_global("cb")?;
        Ok(())
    })?;

    let result = engine.eval("function inner() return seen + 1 end\nreturn cb() * 2")?;
    assert_eq!(result, Object::Number(12.0));
    assert_eq!(engine.get("seen")?, Some(Object::Number(5.0)));
    assert_eq!(engine.runtime().enter(|s| s.get_top()), 0);
    Ok(())
}
