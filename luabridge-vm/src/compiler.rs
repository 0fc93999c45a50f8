use std::sync::Arc;

use crate::ast::*;
use crate::error::LuaError;
use crate::opcode::{ArithOp, CompareOp, Count, OpCode};
use crate::proto::{Constant, Proto, UpvalDesc};

/// Placeholder target for forward jumps, patched once the target is known.
const PENDING: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
enum Var {
    Local(u16),
    Upval(u16),
    Global,
}

struct BlockScope {
    nactive: usize,
    is_loop: bool,
    breaks: Vec<usize>,
}

struct FuncState {
    proto: Proto,
    actives: Vec<(String, u16)>,
    blocks: Vec<BlockScope>,
    upvals: Vec<(String, UpvalDesc)>,
    line: u32,
}

impl FuncState {
    fn new(name: &str, source: &Arc<str>, line_defined: u32) -> Self {
        Self {
            proto: Proto {
                name: Arc::from(name),
                source: source.clone(),
                line_defined,
                ..Default::default()
            },
            actives: Vec::new(),
            blocks: Vec::new(),
            upvals: Vec::new(),
            line: line_defined.max(1),
        }
    }
}

pub struct Compiler {
    source: Arc<str>,
    funcs: Vec<FuncState>,
}

/// Compiles a parsed chunk into its main prototype.
pub fn compile(block: &Block, chunk: &str) -> Result<Proto, LuaError> {
    let source: Arc<str> = Arc::from(chunk);
    let mut c = Compiler {
        source: source.clone(),
        funcs: vec![FuncState::new("main chunk", &source, 0)],
    };
    c.fs().proto.is_vararg = true;
    c.block(block, false)?;
    c.emit(OpCode::Return(Count::Fixed(0)));
    let fs = c.funcs.pop().ok_or_else(|| LuaError::api("compiler state underflow"))?;
    Ok(fs.proto)
}

impl Compiler {
    // ---- Emission helpers ----

    #[inline]
    fn fs(&mut self) -> &mut FuncState {
        let last = self.funcs.len() - 1;
        &mut self.funcs[last]
    }

    fn set_line(&mut self, line: u32) {
        if line > 0 {
            self.fs().line = line;
        }
    }

    fn emit(&mut self, op: OpCode) -> usize {
        let fs = self.fs();
        fs.proto.code.push(op);
        fs.proto.lines.push(fs.line);
        fs.proto.code.len() - 1
    }

    fn here(&mut self) -> u32 {
        self.fs().proto.code.len() as u32
    }

    fn patch(&mut self, at: usize, target: u32) {
        let code = &mut self.fs().proto.code;
        code[at] = match code[at] {
            OpCode::Jump(_) => OpCode::Jump(target),
            OpCode::JumpIfFalse(_) => OpCode::JumpIfFalse(target),
            OpCode::JumpIfNil(_) => OpCode::JumpIfNil(target),
            OpCode::AndJump(_) => OpCode::AndJump(target),
            OpCode::OrJump(_) => OpCode::OrJump(target),
            OpCode::ForTest { base, .. } => OpCode::ForTest { base, exit: target },
            other => other,
        };
    }

    fn patch_here(&mut self, at: usize) {
        let target = self.here();
        self.patch(at, target);
    }

    fn error(&mut self, msg: &str) -> LuaError {
        let line = self.fs().line;
        LuaError::Syntax(format!("{}:{}: {}", self.source, line, msg))
    }

    fn constant(&mut self, k: Constant) -> Result<u32, LuaError> {
        let consts = &self.fs().proto.constants;
        let found = consts.iter().position(|c| match (c, &k) {
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a == b,
            _ => false,
        });
        if let Some(i) = found {
            return Ok(i as u32);
        }
        if consts.len() >= u32::MAX as usize - 1 {
            return Err(self.error("constant table overflow"));
        }
        let consts = &mut self.fs().proto.constants;
        consts.push(k);
        Ok((consts.len() - 1) as u32)
    }

    fn string_constant(&mut self, s: &str) -> Result<u32, LuaError> {
        self.constant(Constant::String(Arc::from(s)))
    }

    // ---- Scopes and variables ----

    fn new_slot(&mut self) -> Result<u16, LuaError> {
        let n = self.fs().proto.num_slots;
        if n == u16::MAX {
            return Err(self.error("too many local variables"));
        }
        self.fs().proto.num_slots = n + 1;
        Ok(n)
    }

    fn activate(&mut self, name: &str, slot: u16) {
        self.fs().actives.push((name.to_string(), slot));
    }

    fn enter_block(&mut self, is_loop: bool) {
        let nactive = self.fs().actives.len();
        self.fs().blocks.push(BlockScope {
            nactive,
            is_loop,
            breaks: Vec::new(),
        });
    }

    fn leave_block(&mut self) {
        if let Some(scope) = self.fs().blocks.pop() {
            self.fs().actives.truncate(scope.nactive);
            for at in scope.breaks {
                self.patch_here(at);
            }
        }
    }

    fn resolve_in(&mut self, level: usize, name: &str) -> Option<Var> {
        let fs = &self.funcs[level];
        if let Some((_, slot)) = fs.actives.iter().rev().find(|(n, _)| n == name) {
            return Some(Var::Local(*slot));
        }
        if let Some(i) = fs.upvals.iter().position(|(n, _)| n == name) {
            return Some(Var::Upval(i as u16));
        }
        if level == 0 {
            return None;
        }
        let desc = match self.resolve_in(level - 1, name)? {
            Var::Local(s) => UpvalDesc::Local(s),
            Var::Upval(u) => UpvalDesc::Upval(u),
            Var::Global => return None,
        };
        let fs = &mut self.funcs[level];
        fs.upvals.push((name.to_string(), desc));
        Some(Var::Upval((fs.upvals.len() - 1) as u16))
    }

    fn resolve(&mut self, name: &str) -> Var {
        let level = self.funcs.len() - 1;
        self.resolve_in(level, name).unwrap_or(Var::Global)
    }

    fn load_var(&mut self, name: &str) -> Result<(), LuaError> {
        match self.resolve(name) {
            Var::Local(s) => self.emit(OpCode::GetLocal(s)),
            Var::Upval(u) => self.emit(OpCode::GetUpval(u)),
            Var::Global => {
                let k = self.string_constant(name)?;
                self.emit(OpCode::GetGlobal(k))
            }
        };
        Ok(())
    }

    fn store_var(&mut self, name: &str) -> Result<(), LuaError> {
        match self.resolve(name) {
            Var::Local(s) => self.emit(OpCode::SetLocal(s)),
            Var::Upval(u) => self.emit(OpCode::SetUpval(u)),
            Var::Global => {
                let k = self.string_constant(name)?;
                self.emit(OpCode::SetGlobal(k))
            }
        };
        Ok(())
    }

    // ---- Statements ----

    fn block(&mut self, block: &Block, is_loop: bool) -> Result<(), LuaError> {
        self.enter_block(is_loop);
        self.statements(block)?;
        self.leave_block();
        Ok(())
    }

    fn statements(&mut self, block: &Block) -> Result<(), LuaError> {
        for (stmt, line) in &block.stmts {
            self.set_line(*line);
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<(), LuaError> {
        match stmt {
            Stmt::Local { names, exprs } => {
                self.adjusted_list(exprs, names.len())?;
                let mut slots = Vec::with_capacity(names.len());
                for _ in names {
                    slots.push(self.new_slot()?);
                }
                for slot in slots.iter().rev() {
                    self.emit(OpCode::NewLocal(*slot));
                }
                for (name, slot) in names.iter().zip(slots) {
                    self.activate(name, slot);
                }
            }
            Stmt::LocalFunction { name, body } => {
                let slot = self.new_slot()?;
                self.activate(name, slot);
                self.emit(OpCode::Nil);
                self.emit(OpCode::NewLocal(slot));
                self.function(body, name)?;
                self.emit(OpCode::SetLocal(slot));
            }
            Stmt::Function { name, body } => self.function_stmt(name, body)?,
            Stmt::Assign {
                targets,
                exprs,
                line,
            } => {
                self.set_line(*line);
                self.assignment(targets, exprs)?;
            }
            Stmt::Call(call) => self.expr(call, Count::Fixed(0))?,
            Stmt::Do(block) => self.block(block, false)?,
            Stmt::While { cond, body } => {
                let top = self.here();
                self.expr1(cond)?;
                let exit = self.emit(OpCode::JumpIfFalse(PENDING));
                self.enter_block(true);
                self.statements(body)?;
                self.emit(OpCode::Jump(top));
                self.patch_here(exit);
                self.leave_block();
            }
            Stmt::Repeat { body, cond } => {
                let top = self.here();
                self.enter_block(true);
                self.statements(body)?;
                // the condition sees the body's locals
                self.expr1(cond)?;
                self.emit(OpCode::JumpIfFalse(top));
                self.leave_block();
            }
            Stmt::If { branches, orelse } => {
                let mut ends = Vec::new();
                for (cond, body) in branches {
                    self.expr1(cond)?;
                    let next = self.emit(OpCode::JumpIfFalse(PENDING));
                    self.block(body, false)?;
                    ends.push(self.emit(OpCode::Jump(PENDING)));
                    self.patch_here(next);
                }
                if let Some(body) = orelse {
                    self.block(body, false)?;
                }
                for at in ends {
                    self.patch_here(at);
                }
            }
            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            } => {
                self.set_line(*line);
                self.enter_block(true);
                self.expr1(start)?;
                self.expr1(limit)?;
                match step {
                    Some(step) => self.expr1(step)?,
                    None => {
                        let k = self.constant(Constant::Number(1.0))?;
                        self.emit(OpCode::Const(k));
                    }
                }
                let base = self.new_slot()?;
                self.new_slot()?;
                self.new_slot()?;
                let var_slot = self.new_slot()?;
                self.emit(OpCode::NewLocal(base + 2));
                self.emit(OpCode::NewLocal(base + 1));
                self.emit(OpCode::NewLocal(base));
                self.emit(OpCode::ForPrep(base));
                let top = self.here();
                let test = self.emit(OpCode::ForTest {
                    base,
                    exit: PENDING,
                });
                self.enter_block(false);
                self.activate(var, var_slot);
                self.statements(body)?;
                self.leave_block();
                self.set_line(*line);
                self.emit(OpCode::ForStep(base));
                self.emit(OpCode::Jump(top));
                self.patch_here(test);
                self.leave_block();
            }
            Stmt::GenericFor {
                names,
                exprs,
                body,
                line,
            } => {
                self.set_line(*line);
                self.enter_block(true);
                self.adjusted_list(exprs, 3)?;
                let base = self.new_slot()?;
                self.new_slot()?;
                self.new_slot()?;
                let mut vars = Vec::with_capacity(names.len());
                for _ in names {
                    vars.push(self.new_slot()?);
                }
                self.emit(OpCode::NewLocal(base + 2));
                self.emit(OpCode::NewLocal(base + 1));
                self.emit(OpCode::NewLocal(base));
                let top = self.here();
                self.emit(OpCode::Mark);
                self.emit(OpCode::GetLocal(base));
                self.emit(OpCode::GetLocal(base + 1));
                self.emit(OpCode::GetLocal(base + 2));
                self.emit(OpCode::Call(Count::Fixed(vars.len() as u16)));
                for slot in vars.iter().rev() {
                    self.emit(OpCode::NewLocal(*slot));
                }
                self.emit(OpCode::GetLocal(vars[0]));
                let exit = self.emit(OpCode::JumpIfNil(PENDING));
                self.emit(OpCode::GetLocal(vars[0]));
                self.emit(OpCode::SetLocal(base + 2));
                self.enter_block(false);
                for (name, slot) in names.iter().zip(&vars) {
                    self.activate(name, *slot);
                }
                self.statements(body)?;
                self.leave_block();
                self.emit(OpCode::Jump(top));
                self.patch_here(exit);
                self.leave_block();
            }
            Stmt::Break(line) => {
                self.set_line(*line);
                let at = self.emit(OpCode::Jump(PENDING));
                let found = match self.fs().blocks.iter_mut().rev().find(|b| b.is_loop) {
                    Some(scope) => {
                        scope.breaks.push(at);
                        true
                    }
                    None => false,
                };
                if !found {
                    return Err(self.error("no loop to break"));
                }
            }
            Stmt::Return { exprs, line } => {
                self.set_line(*line);
                match exprs.last() {
                    Some(last) if last.is_multi() => {
                        self.emit(OpCode::Mark);
                        for e in &exprs[..exprs.len() - 1] {
                            self.expr1(e)?;
                        }
                        self.expr(last, Count::Multi)?;
                        self.emit(OpCode::Return(Count::Multi));
                    }
                    _ => {
                        for e in exprs {
                            self.expr1(e)?;
                        }
                        self.emit(OpCode::Return(Count::Fixed(exprs.len() as u16)));
                    }
                }
            }
        }
        Ok(())
    }

    fn function_stmt(&mut self, name: &FuncName, body: &FuncBody) -> Result<(), LuaError> {
        let mut path: Vec<&str> = name.fields.iter().map(|s| s.as_str()).collect();
        if let Some(m) = &name.method {
            path.push(m);
        }
        let Some((last, fields)) = path.split_last() else {
            self.function(body, &name.base)?;
            return self.store_var(&name.base);
        };
        self.load_var(&name.base)?;
        for field in fields {
            let k = self.string_constant(field)?;
            self.emit(OpCode::Const(k));
            self.emit(OpCode::GetIndex);
        }
        let k = self.string_constant(last)?;
        self.emit(OpCode::Const(k));
        self.function(body, last)?;
        self.set_line(body.line);
        self.emit(OpCode::SetIndex);
        Ok(())
    }

    fn assignment(&mut self, targets: &[Expr], exprs: &[Expr]) -> Result<(), LuaError> {
        if let [target] = targets {
            match target {
                Expr::Name(name) => {
                    self.adjusted_list(exprs, 1)?;
                    return self.store_var(name);
                }
                Expr::Index { obj, key, line } => {
                    self.expr1(obj)?;
                    self.expr1(key)?;
                    self.adjusted_list(exprs, 1)?;
                    self.set_line(*line);
                    self.emit(OpCode::SetIndex);
                    return Ok(());
                }
                _ => return Err(self.error("syntax error")),
            }
        }

        // Evaluate every table and key first, then all values, then store.
        let mut places = Vec::with_capacity(targets.len());
        for target in targets {
            match target {
                Expr::Index { obj, key, line } => {
                    self.expr1(obj)?;
                    let obj_slot = self.new_slot()?;
                    self.emit(OpCode::NewLocal(obj_slot));
                    self.expr1(key)?;
                    let key_slot = self.new_slot()?;
                    self.emit(OpCode::NewLocal(key_slot));
                    places.push(Some((obj_slot, key_slot, *line)));
                }
                Expr::Name(_) => places.push(None),
                _ => return Err(self.error("syntax error")),
            }
        }
        self.adjusted_list(exprs, targets.len())?;
        let mut values = Vec::with_capacity(targets.len());
        for _ in targets {
            values.push(self.new_slot()?);
        }
        for slot in values.iter().rev() {
            self.emit(OpCode::NewLocal(*slot));
        }
        for ((target, place), value) in targets.iter().zip(places).zip(values).rev() {
            match (target, place) {
                (_, Some((obj_slot, key_slot, line))) => {
                    self.emit(OpCode::GetLocal(obj_slot));
                    self.emit(OpCode::GetLocal(key_slot));
                    self.emit(OpCode::GetLocal(value));
                    self.set_line(line);
                    self.emit(OpCode::SetIndex);
                }
                (Expr::Name(name), None) => {
                    self.emit(OpCode::GetLocal(value));
                    self.store_var(name)?;
                }
                _ => return Err(self.error("syntax error")),
            }
        }
        Ok(())
    }

    /// Compiles a nested function and emits the closure instruction.
    fn function(&mut self, body: &FuncBody, name: &str) -> Result<(), LuaError> {
        let source = self.source.clone();
        let mut fs = FuncState::new(name, &source, body.line);
        fs.proto.is_vararg = body.is_vararg;
        fs.proto.num_params = body.params.len() as u16;
        self.funcs.push(fs);
        for param in &body.params {
            let slot = self.new_slot()?;
            self.activate(param, slot);
        }
        self.block(&body.body, false)?;
        self.set_line(body.end_line);
        self.emit(OpCode::Return(Count::Fixed(0)));

        let mut fs = self
            .funcs
            .pop()
            .ok_or_else(|| LuaError::api("compiler state underflow"))?;
        fs.proto.upvalues = fs.upvals.into_iter().map(|(_, d)| d).collect();
        let parent = self.fs();
        parent.proto.protos.push(Arc::new(fs.proto));
        let idx = (parent.proto.protos.len() - 1) as u32;
        self.emit(OpCode::Closure(idx));
        Ok(())
    }

    // ---- Expressions ----

    /// Pushes exactly `n` values from `exprs`, truncating or padding with nil.
    fn adjusted_list(&mut self, exprs: &[Expr], n: usize) -> Result<(), LuaError> {
        if exprs.is_empty() {
            for _ in 0..n {
                self.emit(OpCode::Nil);
            }
            return Ok(());
        }
        let last = exprs.len() - 1;
        for (i, e) in exprs.iter().enumerate() {
            let remaining = n.saturating_sub(i);
            if i == last && e.is_multi() {
                self.expr(e, Count::Fixed(remaining as u16))?;
            } else {
                self.expr1(e)?;
                if i >= n {
                    self.emit(OpCode::Pop(1));
                }
            }
            if i == last && !e.is_multi() {
                for _ in 1..remaining {
                    self.emit(OpCode::Nil);
                }
            }
        }
        Ok(())
    }

    /// Pushes call arguments, letting a trailing call or `...` expand.
    fn arguments(&mut self, args: &[Expr]) -> Result<(), LuaError> {
        let last = args.len().saturating_sub(1);
        for (i, e) in args.iter().enumerate() {
            if i == last && e.is_multi() {
                self.expr(e, Count::Multi)?;
            } else {
                self.expr1(e)?;
            }
        }
        Ok(())
    }

    #[inline]
    fn expr1(&mut self, e: &Expr) -> Result<(), LuaError> {
        self.expr(e, Count::Fixed(1))
    }

    fn expr(&mut self, e: &Expr, want: Count) -> Result<(), LuaError> {
        match e {
            Expr::Call { func, args, line } => {
                self.set_line(*line);
                self.emit(OpCode::Mark);
                self.expr1(func)?;
                self.arguments(args)?;
                self.set_line(*line);
                self.emit(OpCode::Call(want));
                return Ok(());
            }
            Expr::Method {
                obj,
                name,
                args,
                line,
            } => {
                self.set_line(*line);
                self.emit(OpCode::Mark);
                self.expr1(obj)?;
                let k = self.string_constant(name)?;
                self.emit(OpCode::SelfMethod(k));
                self.arguments(args)?;
                self.set_line(*line);
                self.emit(OpCode::Call(want));
                return Ok(());
            }
            Expr::Vararg => {
                if !self.fs().proto.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                self.emit(OpCode::Vararg(want));
                return Ok(());
            }
            _ => {}
        }

        self.single(e)?;
        match want {
            Count::Fixed(0) => {
                self.emit(OpCode::Pop(1));
            }
            Count::Fixed(n) => {
                for _ in 1..n {
                    self.emit(OpCode::Nil);
                }
            }
            Count::Multi => {}
        }
        Ok(())
    }

    /// Compiles an expression that yields exactly one value.
    fn single(&mut self, e: &Expr) -> Result<(), LuaError> {
        match e {
            Expr::Nil => {
                self.emit(OpCode::Nil);
            }
            Expr::True => {
                self.emit(OpCode::True);
            }
            Expr::False => {
                self.emit(OpCode::False);
            }
            Expr::Number(n) => {
                let k = self.constant(Constant::Number(*n))?;
                self.emit(OpCode::Const(k));
            }
            Expr::Str(s) => {
                let k = self.constant(Constant::String(s.clone()))?;
                self.emit(OpCode::Const(k));
            }
            Expr::Function(body) => self.function(body, "?")?,
            Expr::Name(name) => self.load_var(name)?,
            Expr::Index { obj, key, line } => {
                self.expr1(obj)?;
                self.expr1(key)?;
                self.set_line(*line);
                self.emit(OpCode::GetIndex);
            }
            Expr::Table(fields) => self.table(fields)?,
            Expr::Binary { .. } | Expr::And(..) | Expr::Or(..) => self.operator_chain(e)?,
            Expr::Unary { op, expr, line } => {
                self.expr1(expr)?;
                self.set_line(*line);
                self.emit(match op {
                    UnOp::Neg => OpCode::Neg,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                });
            }
            Expr::Paren(inner) => self.expr1(inner)?,
            Expr::Call { .. } | Expr::Method { .. } | Expr::Vararg => {
                self.expr(e, Count::Fixed(1))?
            }
        }
        Ok(())
    }

    /// Compiles `a op b op c ...` walking the left spine with a loop, so
    /// long operator chains do not grow the native stack.
    fn operator_chain(&mut self, e: &Expr) -> Result<(), LuaError> {
        let mut spine = Vec::new();
        let mut leftmost = e;
        loop {
            let (link, lhs) = match leftmost {
                Expr::Binary { op, lhs, rhs, line } => (Link::Binary(*op, &**rhs, *line), lhs),
                Expr::And(lhs, rhs) => (Link::And(&**rhs), lhs),
                Expr::Or(lhs, rhs) => (Link::Or(&**rhs), lhs),
                _ => break,
            };
            spine.push(link);
            leftmost = &**lhs;
        }
        self.expr1(leftmost)?;
        for link in spine.into_iter().rev() {
            match link {
                Link::Binary(op, rhs, line) => {
                    self.expr1(rhs)?;
                    self.set_line(line);
                    self.emit(binary_opcode(op));
                }
                Link::And(rhs) => {
                    let skip = self.emit(OpCode::AndJump(PENDING));
                    self.expr1(rhs)?;
                    self.patch_here(skip);
                }
                Link::Or(rhs) => {
                    let skip = self.emit(OpCode::OrJump(PENDING));
                    self.expr1(rhs)?;
                    self.patch_here(skip);
                }
            }
        }
        Ok(())
    }

    fn table(&mut self, fields: &[TableField]) -> Result<(), LuaError> {
        self.emit(OpCode::NewTable);
        let mut pos: u32 = 1;
        let last = fields.len().saturating_sub(1);
        for (i, field) in fields.iter().enumerate() {
            match field {
                TableField::Keyed(k, v) => {
                    self.expr1(k)?;
                    self.expr1(v)?;
                    self.emit(OpCode::InitField);
                }
                TableField::Item(e) if i == last && e.is_multi() => {
                    self.emit(OpCode::Mark);
                    self.expr(e, Count::Multi)?;
                    self.emit(OpCode::InitList { start: pos });
                }
                TableField::Item(e) => {
                    self.expr1(e)?;
                    self.emit(OpCode::InitIndex(pos));
                    pos += 1;
                }
            }
        }
        Ok(())
    }
}

/// One operator of a left-leaning chain with its right operand.
enum Link<'e> {
    Binary(BinOp, &'e Expr, u32),
    And(&'e Expr),
    Or(&'e Expr),
}

fn binary_opcode(op: BinOp) -> OpCode {
    match op {
        BinOp::Add => OpCode::Arith(ArithOp::Add),
        BinOp::Sub => OpCode::Arith(ArithOp::Sub),
        BinOp::Mul => OpCode::Arith(ArithOp::Mul),
        BinOp::Div => OpCode::Arith(ArithOp::Div),
        BinOp::Mod => OpCode::Arith(ArithOp::Mod),
        BinOp::Pow => OpCode::Arith(ArithOp::Pow),
        BinOp::Concat => OpCode::Concat,
        BinOp::Eq => OpCode::Eq,
        BinOp::Ne => OpCode::Ne,
        BinOp::Lt => OpCode::Compare(CompareOp::Lt),
        BinOp::Le => OpCode::Compare(CompareOp::Le),
        BinOp::Gt => OpCode::Compare(CompareOp::Gt),
        BinOp::Ge => OpCode::Compare(CompareOp::Ge),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn compile_src(src: &str) -> Result<Proto, LuaError> {
        let block = parse(src.as_bytes(), "c")?;
        compile(&block, "c")
    }

    #[test]
    fn every_function_ends_with_return() {
        let proto = compile_src("local function f(a) return a end").unwrap();
        assert_eq!(proto.code.last(), Some(&OpCode::Return(Count::Fixed(0))));
        assert_eq!(
            proto.protos[0].code.last(),
            Some(&OpCode::Return(Count::Fixed(0)))
        );
        assert_eq!(proto.protos[0].num_params, 1);
    }

    #[test]
    fn upvalues_resolve_through_levels() {
        let proto =
            compile_src("local x = 1\nlocal function f() return function() return x end end")
                .unwrap();
        let f = &proto.protos[0];
        assert_eq!(f.upvalues, vec![UpvalDesc::Local(0)]);
        assert_eq!(f.protos[0].upvalues, vec![UpvalDesc::Upval(0)]);
    }

    #[test]
    fn misplaced_break_and_vararg() {
        let err = compile_src("\nbreak").unwrap_err();
        assert_eq!(err.to_string(), "c:2: no loop to break");
        let err = compile_src("function f() return ... end").unwrap_err();
        assert_eq!(
            err.to_string(),
            "c:1: cannot use '...' outside a vararg function"
        );
    }

    #[test]
    fn lines_follow_statements() {
        let proto = compile_src("local a = 1\n\nlocal b = 2").unwrap();
        assert_eq!(proto.code.len(), proto.lines.len());
        assert!(proto.lines.contains(&3));
    }

    #[test]
    fn long_operator_chains_compile() {
        let src = format!("return 1{}", " + 1".repeat(3000));
        let proto = compile_src(&src).unwrap();
        let adds = proto
            .code
            .iter()
            .filter(|op| **op == OpCode::Arith(ArithOp::Add))
            .count();
        assert_eq!(adds, 3000);

        let src = format!("return x{} or 1", " and x".repeat(3000));
        assert!(compile_src(&src).is_ok());
    }
}
