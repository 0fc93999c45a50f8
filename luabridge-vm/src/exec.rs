use std::cell::Cell;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LuaError, LuaResult};
use crate::opcode::{ArithOp, CompareOp, Count, OpCode};
use crate::proto::{Constant, Proto, UpvalDesc};
use crate::state::{CallInfo, FrameKind, State, MAX_CALL_DEPTH};
use crate::value::{Closure, Function, Upvalue, Value};

/// Pops the call frame and restores the depth counter when a call ends,
/// including by error.
struct FrameGuard<'a> {
    state: &'a State,
}

impl<'a> FrameGuard<'a> {
    fn push(state: &'a State, info: CallInfo) -> Self {
        push_frame(state, info);
        Self { state }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        pop_frames(self.state, 1);
    }
}

fn push_frame(state: &State, info: CallInfo) {
    state.frames.borrow_mut().push(info);
    state.depth.set(state.depth.get() + 1);
}

fn pop_frames(state: &State, n: usize) {
    let mut frames = state.frames.borrow_mut();
    let len = frames.len().saturating_sub(n);
    frames.truncate(len);
    state.depth.set(state.depth.get().saturating_sub(n));
}

fn call_info(func: &Function) -> CallInfo {
    match func {
        Function::Lua(cl) => CallInfo {
            name: cl.proto.name.clone(),
            kind: FrameKind::Lua {
                source: cl.proto.source.clone(),
                main: cl.proto.is_main(),
            },
            line: Cell::new(cl.proto.line_defined),
            line_defined: cl.proto.line_defined,
        },
        Function::Native(nf) => CallInfo {
            name: Arc::from(nf.name()),
            kind: FrameKind::Native,
            line: Cell::new(0),
            line_defined: 0,
        },
    }
}

pub(crate) fn call_function(
    state: &State,
    func: &Function,
    args: Vec<Value>,
) -> LuaResult<Vec<Value>> {
    if state.depth.get() >= MAX_CALL_DEPTH {
        let err = LuaError::runtime(format!("{}stack overflow", state.frame_position(0)));
        return Err(with_traceback(err, state));
    }
    let _guard = FrameGuard::push(state, call_info(func));
    let result = match func {
        Function::Lua(cl) => execute(state, cl.clone(), args),
        Function::Native(nf) => nf.call(state, args),
    };
    // the innermost failing frame records where the error happened
    result.map_err(|e| with_traceback(e, state))
}

fn with_traceback(err: LuaError, state: &State) -> LuaError {
    match err {
        LuaError::Runtime {
            message,
            traceback: None,
        } => LuaError::Runtime {
            message,
            traceback: Some(state.traceback()),
        },
        other => other,
    }
}

fn set_line(state: &State, line: u32) {
    if let Some(frame) = state.frames.borrow().last() {
        frame.line.set(line);
    }
}

/// Positions a runtime error at the instruction being executed.
fn fail(state: &State, proto: &Proto, pc: usize, msg: String) -> LuaError {
    let line = proto.line_at(pc);
    set_line(state, line);
    LuaError::runtime(format!("{}:{}: {}", proto.source, line, msg))
}

fn arith_error(a: &Value, b: &Value) -> String {
    let bad = if a.to_number().is_none() { a } else { b };
    format!("attempt to perform arithmetic on a {} value", bad.type_name())
}

pub(crate) fn arith(op: ArithOp, a: &Value, b: &Value) -> Result<Value, String> {
    let (Some(x), Some(y)) = (a.to_number(), b.to_number()) else {
        return Err(arith_error(a, b));
    };
    Ok(Value::Number(match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Mod => x - (x / y).floor() * y,
        ArithOp::Pow => x.powf(y),
    }))
}

pub(crate) fn compare(op: CompareOp, a: &Value, b: &Value) -> Result<bool, String> {
    use std::cmp::Ordering;
    let ord = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        _ => {
            let (ta, tb) = (a.type_name(), b.type_name());
            return Err(if ta == tb {
                format!("attempt to compare two {ta} values")
            } else {
                format!("attempt to compare {ta} with {tb}")
            });
        }
    };
    // NaN compares false under every operator
    let Some(ord) = ord else {
        return Ok(false);
    };
    Ok(match op {
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    })
}

/// `obj[key]` as seen by scripts: tables index raw, strings index the
/// `string` library so that `s:upper()` works.
pub(crate) fn index(state: &State, obj: &Value, key: &Value) -> Result<Value, String> {
    match obj {
        Value::Table(id) => state.table_get(*id, key).map_err(|e| e.to_string()),
        Value::String(_) => {
            let lib = state
                .table_get(state.globals(), &Value::string("string"))
                .map_err(|e| e.to_string())?;
            match lib {
                Value::Table(id) => state.table_get(id, key).map_err(|e| e.to_string()),
                _ => Ok(Value::Nil),
            }
        }
        other => Err(format!("attempt to index a {} value", other.type_name())),
    }
}

fn new_cell(v: Value) -> Upvalue {
    Arc::new(Mutex::new(v))
}

#[inline]
fn number_in(cell: &Upvalue) -> f64 {
    cell.lock().to_number().unwrap_or(0.0)
}

#[inline]
fn constant_value(k: &Constant) -> Value {
    match k {
        Constant::Number(n) => Value::Number(*n),
        Constant::String(s) => Value::String(s.clone()),
    }
}

/// One running Lua function.
struct Activation {
    cl: Arc<Closure>,
    slots: Vec<Upvalue>,
    stack: Vec<Value>,
    marks: Vec<usize>,
    varargs: Vec<Value>,
    pc: usize,
    /// Results the pending call of this activation asked for.
    want: Count,
}

impl Activation {
    fn new(cl: Arc<Closure>, mut args: Vec<Value>) -> Self {
        let proto = &cl.proto;
        let nparams = proto.num_params as usize;
        let varargs = if proto.is_vararg && args.len() > nparams {
            args.split_off(nparams)
        } else {
            Vec::new()
        };
        args.resize(nparams, Value::Nil);
        let mut slots: Vec<Upvalue> = args.into_iter().map(new_cell).collect();
        slots.resize_with(proto.num_slots as usize, || new_cell(Value::Nil));
        Self {
            cl,
            slots,
            stack: Vec::with_capacity(16),
            marks: Vec::new(),
            varargs,
            pc: 0,
            want: Count::Multi,
        }
    }
}

/// Runs a Lua function. Calls between Lua functions do not recurse on the
/// host stack; only host functions calling back into scripts do.
fn execute(state: &State, cl: Arc<Closure>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let mut acts = vec![Activation::new(cl, args)];
    match run(state, &mut acts) {
        Ok(results) => Ok(results),
        Err(err) => {
            let err = with_traceback(err, state);
            // frames of nested activations; the first one belongs to the caller's guard
            pop_frames(state, acts.len().saturating_sub(1));
            Err(err)
        }
    }
}

fn run(state: &State, acts: &mut Vec<Activation>) -> LuaResult<Vec<Value>> {
    'activation: loop {
        let Some(act) = acts.last_mut() else {
            return Ok(Vec::new());
        };
        let cl = act.cl.clone();
        let proto = &*cl.proto;
        let Activation {
            slots,
            stack,
            marks,
            varargs,
            pc,
            want: pending,
            ..
        } = act;

        macro_rules! pop {
            () => {
                stack.pop().unwrap_or_default()
            };
        }

        loop {
            let Some(&op) = proto.code.get(*pc) else {
                return Err(LuaError::api("instruction pointer out of range"));
            };
            let at = *pc;
            *pc += 1;
            match op {
                OpCode::Nil => stack.push(Value::Nil),
                OpCode::True => stack.push(Value::Boolean(true)),
                OpCode::False => stack.push(Value::Boolean(false)),
                OpCode::Const(k) => stack.push(constant_value(&proto.constants[k as usize])),

                OpCode::GetLocal(s) => {
                    let v = slots[s as usize].lock().clone();
                    stack.push(v);
                }
                OpCode::SetLocal(s) => {
                    let v = pop!();
                    *slots[s as usize].lock() = v;
                }
                OpCode::NewLocal(s) => {
                    let v = pop!();
                    slots[s as usize] = new_cell(v);
                }
                OpCode::GetUpval(u) => {
                    let v = cl.upvalues[u as usize].lock().clone();
                    stack.push(v);
                }
                OpCode::SetUpval(u) => {
                    let v = pop!();
                    *cl.upvalues[u as usize].lock() = v;
                }
                OpCode::GetGlobal(k) => {
                    let key = constant_value(&proto.constants[k as usize]);
                    let v = state.table_get(state.globals(), &key)?;
                    stack.push(v);
                }
                OpCode::SetGlobal(k) => {
                    let key = constant_value(&proto.constants[k as usize]);
                    let v = pop!();
                    state
                        .table_set(state.globals(), key, v)
                        .map_err(|e| fail(state, proto, at, e.to_string()))?;
                }

                OpCode::GetIndex => {
                    let key = pop!();
                    let obj = pop!();
                    let v = index(state, &obj, &key).map_err(|m| fail(state, proto, at, m))?;
                    stack.push(v);
                }
                OpCode::SetIndex => {
                    let v = pop!();
                    let key = pop!();
                    let obj = pop!();
                    let id = match obj {
                        Value::Table(id) => id,
                        other => {
                            let msg = format!("attempt to index a {} value", other.type_name());
                            return Err(fail(state, proto, at, msg));
                        }
                    };
                    state
                        .table_set(id, key, v)
                        .map_err(|e| fail(state, proto, at, e.to_string()))?;
                }
                OpCode::NewTable => stack.push(Value::Table(state.alloc_table())),
                OpCode::InitField => {
                    let v = pop!();
                    let key = pop!();
                    if let Some(Value::Table(id)) = stack.last() {
                        state
                            .table_set(*id, key, v)
                            .map_err(|e| fail(state, proto, at, e.to_string()))?;
                    }
                }
                OpCode::InitIndex(pos) => {
                    let v = pop!();
                    if let Some(Value::Table(id)) = stack.last() {
                        state.table_set(*id, Value::Number(pos as f64), v)?;
                    }
                }
                OpCode::InitList { start } => {
                    let mark = marks.pop().unwrap_or(stack.len()).min(stack.len());
                    let items = stack.split_off(mark);
                    if let Some(Value::Table(id)) = stack.last() {
                        let id = *id;
                        for (i, v) in items.into_iter().enumerate() {
                            state.table_set(id, Value::Number(start as f64 + i as f64), v)?;
                        }
                    }
                }

                OpCode::Arith(aop) => {
                    let b = pop!();
                    let a = pop!();
                    let v = arith(aop, &a, &b).map_err(|m| fail(state, proto, at, m))?;
                    stack.push(v);
                }
                OpCode::Compare(cop) => {
                    let b = pop!();
                    let a = pop!();
                    let v = compare(cop, &a, &b).map_err(|m| fail(state, proto, at, m))?;
                    stack.push(Value::Boolean(v));
                }
                OpCode::Eq => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(Value::Boolean(a == b));
                }
                OpCode::Ne => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(Value::Boolean(a != b));
                }
                OpCode::Concat => {
                    let b = pop!();
                    let a = pop!();
                    match (a.to_str_coerced(), b.to_str_coerced()) {
                        (Some(x), Some(y)) => stack.push(Value::from(x + &y)),
                        (x, _) => {
                            let bad = if x.is_none() { &a } else { &b };
                            let msg = format!("attempt to concatenate a {} value", bad.type_name());
                            return Err(fail(state, proto, at, msg));
                        }
                    }
                }
                OpCode::Neg => {
                    let a = pop!();
                    match a.to_number() {
                        Some(n) => stack.push(Value::Number(-n)),
                        None => return Err(fail(state, proto, at, arith_error(&a, &a))),
                    }
                }
                OpCode::Not => {
                    let a = pop!();
                    stack.push(Value::Boolean(!a.truthy()));
                }
                OpCode::Len => {
                    let a = pop!();
                    let n = match &a {
                        Value::String(s) => s.len(),
                        Value::Table(id) => state.with_table(*id, |t| t.length())?,
                        other => {
                            let msg =
                                format!("attempt to get length of a {} value", other.type_name());
                            return Err(fail(state, proto, at, msg));
                        }
                    };
                    stack.push(Value::Number(n as f64));
                }

                OpCode::Jump(t) => *pc = t as usize,
                OpCode::JumpIfFalse(t) => {
                    if !pop!().truthy() {
                        *pc = t as usize;
                    }
                }
                OpCode::JumpIfNil(t) => {
                    if pop!().is_nil() {
                        *pc = t as usize;
                    }
                }
                OpCode::AndJump(t) => {
                    if stack.last().map_or(true, |v| !v.truthy()) {
                        *pc = t as usize;
                    } else {
                        stack.pop();
                    }
                }
                OpCode::OrJump(t) => {
                    if stack.last().is_some_and(|v| v.truthy()) {
                        *pc = t as usize;
                    } else {
                        stack.pop();
                    }
                }

                OpCode::Pop(n) => {
                    let len = stack.len().saturating_sub(n as usize);
                    stack.truncate(len);
                }
                OpCode::Mark => marks.push(stack.len()),

                OpCode::Call(want) => {
                    let mark = marks.pop().unwrap_or(0).min(stack.len());
                    let mut items = stack.split_off(mark);
                    if items.is_empty() {
                        return Err(fail(state, proto, at, "attempt to call a nil value".into()));
                    }
                    let func = items.remove(0);
                    let f = match func {
                        Value::Function(f) => f,
                        other => {
                            let msg = format!("attempt to call a {} value", other.type_name());
                            return Err(fail(state, proto, at, msg));
                        }
                    };
                    set_line(state, proto.line_at(at));
                    match f {
                        Function::Lua(callee) => {
                            if state.depth.get() >= MAX_CALL_DEPTH {
                                return Err(fail(state, proto, at, "stack overflow".into()));
                            }
                            *pending = want;
                            push_frame(state, call_info(&Function::Lua(callee.clone())));
                            acts.push(Activation::new(callee, items));
                            continue 'activation;
                        }
                        native @ Function::Native(_) => {
                            let mut results = call_function(state, &native, items)?;
                            if let Count::Fixed(n) = want {
                                results.resize(n as usize, Value::Nil);
                            }
                            stack.extend(results);
                        }
                    }
                }
                OpCode::SelfMethod(k) => {
                    let obj = pop!();
                    let key = constant_value(&proto.constants[k as usize]);
                    let method = index(state, &obj, &key).map_err(|m| fail(state, proto, at, m))?;
                    stack.push(method);
                    stack.push(obj);
                }
                OpCode::Closure(p) => {
                    let child = proto.protos[p as usize].clone();
                    let upvalues = child
                        .upvalues
                        .iter()
                        .map(|d| match *d {
                            UpvalDesc::Local(s) => slots[s as usize].clone(),
                            UpvalDesc::Upval(u) => cl.upvalues[u as usize].clone(),
                        })
                        .collect();
                    let closure = Closure {
                        proto: child,
                        upvalues,
                    };
                    stack.push(Value::Function(Function::Lua(Arc::new(closure))));
                }
                OpCode::Vararg(want) => match want {
                    Count::Multi => stack.extend(varargs.iter().cloned()),
                    Count::Fixed(n) => {
                        for i in 0..n as usize {
                            stack.push(varargs.get(i).cloned().unwrap_or_default());
                        }
                    }
                },
                OpCode::Return(count) => {
                    let from = match count {
                        Count::Multi => marks.pop().unwrap_or(0),
                        Count::Fixed(n) => stack.len().saturating_sub(n as usize),
                    };
                    let mut results = stack.split_off(from.min(stack.len()));
                    if acts.len() == 1 {
                        return Ok(results);
                    }
                    acts.pop();
                    pop_frames(state, 1);
                    if let Some(caller) = acts.last_mut() {
                        if let Count::Fixed(n) = caller.want {
                            results.resize(n as usize, Value::Nil);
                        }
                        caller.stack.extend(results);
                    }
                    continue 'activation;
                }

                OpCode::ForPrep(base) => {
                    let b = base as usize;
                    let checks = [
                        "'for' initial value must be a number",
                        "'for' limit must be a number",
                        "'for' step must be a number",
                    ];
                    for (i, msg) in checks.iter().enumerate() {
                        let n = slots[b + i].lock().to_number();
                        match n {
                            Some(n) => *slots[b + i].lock() = Value::Number(n),
                            None => return Err(fail(state, proto, at, msg.to_string())),
                        }
                    }
                }
                OpCode::ForTest { base, exit } => {
                    let b = base as usize;
                    let idx = number_in(&slots[b]);
                    let limit = number_in(&slots[b + 1]);
                    let step = number_in(&slots[b + 2]);
                    let more = if step > 0.0 { idx <= limit } else { idx >= limit };
                    if more {
                        slots[b + 3] = new_cell(Value::Number(idx));
                    } else {
                        *pc = exit as usize;
                    }
                }
                OpCode::ForStep(base) => {
                    let b = base as usize;
                    let step = number_in(&slots[b + 2]);
                    let idx = number_in(&slots[b]);
                    *slots[b].lock() = Value::Number(idx + step);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> LuaResult<Vec<Value>> {
        let state = State::with_libs();
        state.load(src.as_bytes(), "t")?;
        state.call(0, None)?;
        let top = state.get_top();
        (1..=top as i32).map(|i| state.to_value(i)).collect()
    }

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run("return 1 + 2 * 3, 2 ^ 3 ^ 2, 7 % 3, -7 % 3").unwrap(), vec![
            num(7.0),
            num(512.0),
            num(1.0),
            num(2.0)
        ]);
        assert_eq!(run("return '10' + 1, 1 .. 2").unwrap(), vec![
            num(11.0),
            Value::from("12")
        ]);
    }

    #[test]
    fn closures_capture_per_iteration() {
        let src = r#"
            local fs = {}
            for i = 1, 3 do fs[i] = function() return i end end
            return fs[1](), fs[2](), fs[3]()
        "#;
        assert_eq!(run(src).unwrap(), vec![num(1.0), num(2.0), num(3.0)]);
    }

    #[test]
    fn counters_share_upvalues() {
        let src = r#"
            local function counter()
                local n = 0
                return function() n = n + 1; return n end
            end
            local c = counter()
            c(); c()
            return c()
        "#;
        assert_eq!(run(src).unwrap(), vec![num(3.0)]);
    }

    #[test]
    fn varargs_and_multiple_results() {
        let src = r#"
            local function f(...) return select('#', ...), ... end
            local t = { f(1, nil, 3) }
            return select('#', f(1, nil, 3)), t[1], t[4]
        "#;
        assert_eq!(run(src).unwrap(), vec![num(4.0), num(3.0), num(3.0)]);
    }

    #[test]
    fn swap_assignment() {
        assert_eq!(run("local a, b = 1, 2; a, b = b, a; return a, b").unwrap(), vec![
            num(2.0),
            num(1.0)
        ]);
    }

    #[test]
    fn loops_and_break() {
        let src = r#"
            local sum = 0
            for i = 10, 1, -2 do sum = sum + i end
            local n = 0
            while true do n = n + 1; if n == 5 then break end end
            local r = 0
            repeat local stop = r >= 3; r = r + 1 until stop
            return sum, n, r
        "#;
        assert_eq!(run(src).unwrap(), vec![num(30.0), num(5.0), num(4.0)]);
    }

    #[test]
    fn generic_for_over_pairs() {
        let src = r#"
            local t = { a = 1, b = 2, 3 }
            local total = 0
            for k, v in pairs(t) do total = total + v end
            local seq = ''
            for i, v in ipairs({ 'x', 'y' }) do seq = seq .. i .. v end
            return total, seq
        "#;
        assert_eq!(run(src).unwrap(), vec![num(6.0), Value::from("1x2y")]);
    }

    #[test]
    fn methods_and_string_methods() {
        let src = r#"
            local obj = { n = 2 }
            function obj:scale(k) return self.n * k end
            return obj:scale(21), ('abc'):upper()
        "#;
        assert_eq!(run(src).unwrap(), vec![num(42.0), Value::from("ABC")]);
    }

    #[test]
    fn runtime_errors_are_positioned() {
        let err = run("local x\n\nreturn x.y").unwrap_err();
        assert_eq!(err.to_string(), "t:3: attempt to index a nil value");
        assert!(err.traceback().is_some_and(|tb| tb.contains("in main chunk")));

        let err = run("return 1 < 'x'").unwrap_err();
        assert_eq!(err.to_string(), "t:1: attempt to compare number with string");

        let err = run("for i = 'a', 2 do end").unwrap_err();
        assert_eq!(err.to_string(), "t:1: 'for' initial value must be a number");
    }

    #[test]
    fn deep_recursion_overflows() {
        let err = run("local function f() return f() end\nreturn f()").unwrap_err();
        assert!(err.to_string().ends_with("stack overflow"), "{err}");
    }
}
