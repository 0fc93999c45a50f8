use serde::{Deserialize, Serialize};

/// How many values an instruction consumes or produces.
///
/// `Multi` means "everything above the innermost mark", which is how calls and
/// `...` pass variable-length lists around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Count {
    Fixed(u16),
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

/// Instructions of the stack machine.
///
/// Operands are indices into the owning prototype (constants, slots,
/// upvalues, child prototypes) or absolute jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    Nil,
    True,
    False,
    Const(u32),

    GetLocal(u16),
    SetLocal(u16),
    /// Gives a slot a fresh cell so closures from earlier iterations keep theirs.
    NewLocal(u16),
    GetUpval(u16),
    SetUpval(u16),
    GetGlobal(u32),
    SetGlobal(u32),

    /// `obj key -> value`
    GetIndex,
    /// `obj key value ->`
    SetIndex,
    NewTable,
    /// `table key value -> table`
    InitField,
    /// `table value -> table`, stores at the given array position
    InitIndex(u32),
    /// `table [mark] values... -> table`, stores from `start` upwards
    InitList { start: u32 },

    Arith(ArithOp),
    Compare(CompareOp),
    Eq,
    Ne,
    Concat,
    Neg,
    Not,
    Len,

    Jump(u32),
    /// Pops the condition.
    JumpIfFalse(u32),
    /// Pops the value, jumps when it is `nil`.
    JumpIfNil(u32),
    /// Keeps the value and jumps when it is falsy, pops it otherwise.
    AndJump(u32),
    /// Keeps the value and jumps when it is truthy, pops it otherwise.
    OrJump(u32),

    Pop(u16),
    /// Remembers the operand stack height.
    Mark,

    /// `[mark] func args... -> results`
    Call(Count),
    /// `obj -> method obj`
    SelfMethod(u32),
    Closure(u32),
    Vararg(Count),
    Return(Count),

    /// Validates and normalizes `start limit step` in slots `base..base+3`.
    ForPrep(u16),
    /// Jumps to `exit` when the loop in `base` is done, otherwise copies the
    /// control value into the visible loop variable at `base+3`.
    ForTest { base: u16, exit: u32 },
    ForStep(u16),
}
