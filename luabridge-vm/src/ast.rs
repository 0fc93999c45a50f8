use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

#[derive(Debug, Clone)]
pub struct FuncBody {
    pub params: Vec<String>,
    pub is_vararg: bool,
    pub body: Block,
    pub line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone)]
pub enum TableField {
    /// `[k] = v` and `name = v`
    Keyed(Expr, Expr),
    /// positional item
    Item(Expr),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Nil,
    True,
    False,
    Number(f64),
    Str(Arc<str>),
    Vararg,
    Function(Box<FuncBody>),
    Name(String),
    Index {
        obj: Box<Expr>,
        key: Box<Expr>,
        line: u32,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        line: u32,
    },
    Method {
        obj: Box<Expr>,
        name: Arc<str>,
        args: Vec<Expr>,
        line: u32,
    },
    Table(Vec<TableField>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: u32,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
        line: u32,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// Parenthesized expression, truncated to one value.
    Paren(Box<Expr>),
}

impl Expr {
    /// Calls and `...` may produce any number of values.
    pub fn is_multi(&self) -> bool {
        matches!(self, Expr::Call { .. } | Expr::Method { .. } | Expr::Vararg)
    }
}

#[derive(Debug, Clone)]
pub struct FuncName {
    pub base: String,
    pub fields: Vec<String>,
    pub method: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Local {
        names: Vec<String>,
        exprs: Vec<Expr>,
    },
    LocalFunction {
        name: String,
        body: Box<FuncBody>,
    },
    Function {
        name: FuncName,
        body: Box<FuncBody>,
    },
    Assign {
        targets: Vec<Expr>,
        exprs: Vec<Expr>,
        line: u32,
    },
    Call(Expr),
    Do(Block),
    While {
        cond: Expr,
        body: Block,
    },
    Repeat {
        body: Block,
        cond: Expr,
    },
    If {
        branches: Vec<(Expr, Block)>,
        orelse: Option<Block>,
    },
    NumericFor {
        var: String,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
        line: u32,
    },
    GenericFor {
        names: Vec<String>,
        exprs: Vec<Expr>,
        body: Block,
        line: u32,
    },
    Break(u32),
    Return {
        exprs: Vec<Expr>,
        line: u32,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub stmts: Vec<(Stmt, u32)>,
}
