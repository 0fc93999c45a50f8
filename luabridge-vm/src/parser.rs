use std::sync::Arc;

use crate::ast::*;
use crate::error::LuaError;
use crate::lexer::{Lexer, Token};

const UNARY_PRIORITY: u8 = 8;
/// Nesting limit for blocks and expressions.
const MAX_NESTING: u32 = 200;

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    tok: Token,
    line: u32,
    ahead: Option<(Token, u32)>,
    depth: u32,
}

fn binary_op(tok: &Token) -> Option<(BinOp, u8, u8)> {
    Some(match tok {
        Token::Plus => (BinOp::Add, 6, 6),
        Token::Minus => (BinOp::Sub, 6, 6),
        Token::Star => (BinOp::Mul, 7, 7),
        Token::Slash => (BinOp::Div, 7, 7),
        Token::Percent => (BinOp::Mod, 7, 7),
        Token::Caret => (BinOp::Pow, 10, 9),
        Token::Concat => (BinOp::Concat, 5, 4),
        Token::Eq => (BinOp::Eq, 3, 3),
        Token::Ne => (BinOp::Ne, 3, 3),
        Token::Lt => (BinOp::Lt, 3, 3),
        Token::Le => (BinOp::Le, 3, 3),
        Token::Gt => (BinOp::Gt, 3, 3),
        Token::Ge => (BinOp::Ge, 3, 3),
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a [u8], chunk: &str) -> Result<Self, LuaError> {
        let mut lexer = Lexer::new(src, chunk);
        let tok = lexer.next_token()?;
        let line = lexer.line();
        Ok(Self {
            lexer,
            tok,
            line,
            ahead: None,
            depth: 0,
        })
    }

    /// Parses a whole chunk.
    pub fn parse_chunk(mut self) -> Result<Block, LuaError> {
        let block = self.block()?;
        if self.tok != Token::Eof {
            return Err(self.error_near("'<eof>' expected"));
        }
        Ok(block)
    }

    // ---- Token helpers ----

    fn advance(&mut self) -> Result<Token, LuaError> {
        let (next, line) = match self.ahead.take() {
            Some(pair) => pair,
            None => {
                let t = self.lexer.next_token()?;
                (t, self.lexer.line())
            }
        };
        self.line = line;
        Ok(std::mem::replace(&mut self.tok, next))
    }

    fn lookahead(&mut self) -> Result<&Token, LuaError> {
        if self.ahead.is_none() {
            let t = self.lexer.next_token()?;
            self.ahead = Some((t, self.lexer.line()));
        }
        match &self.ahead {
            Some((t, _)) => Ok(t),
            None => Err(self.error_near("unexpected symbol")),
        }
    }

    fn error_near(&self, msg: &str) -> LuaError {
        LuaError::Syntax(format!(
            "{}:{}: {} near '{}'",
            self.lexer.chunk(),
            self.line,
            msg,
            self.tok.describe()
        ))
    }

    fn check(&self, tok: &Token) -> bool {
        &self.tok == tok
    }

    fn test_next(&mut self, tok: &Token) -> Result<bool, LuaError> {
        if self.check(tok) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: Token) -> Result<(), LuaError> {
        if self.check(&tok) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error_near(&format!("'{}' expected", tok.describe())))
        }
    }

    fn expect_match(&mut self, what: Token, who: Token, line: u32) -> Result<(), LuaError> {
        if self.check(&what) {
            self.advance()?;
            return Ok(());
        }
        if line == self.line {
            Err(self.error_near(&format!("'{}' expected", what.describe())))
        } else {
            Err(self.error_near(&format!(
                "'{}' expected (to close '{}' at line {})",
                what.describe(),
                who.describe(),
                line
            )))
        }
    }

    fn name(&mut self) -> Result<String, LuaError> {
        match &self.tok {
            Token::Name(n) => {
                let n = n.clone();
                self.advance()?;
                Ok(n)
            }
            _ => Err(self.error_near("<name> expected")),
        }
    }

    fn enter(&mut self) -> Result<(), LuaError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error_near("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ---- Statements ----

    fn block_follow(&self) -> bool {
        matches!(
            self.tok,
            Token::Else | Token::Elseif | Token::End | Token::Until | Token::Eof
        )
    }

    fn block(&mut self) -> Result<Block, LuaError> {
        self.enter()?;
        let mut block = Block::default();
        while !self.block_follow() {
            let line = self.line;
            if self.check(&Token::Return) {
                let stmt = self.return_stmt()?;
                block.stmts.push((stmt, line));
                break;
            }
            if self.check(&Token::Break) {
                self.advance()?;
                block.stmts.push((Stmt::Break(line), line));
                self.test_next(&Token::Semi)?;
                break;
            }
            let stmt = self.statement()?;
            block.stmts.push((stmt, line));
            self.test_next(&Token::Semi)?;
        }
        self.leave();
        Ok(block)
    }

    fn return_stmt(&mut self) -> Result<Stmt, LuaError> {
        let line = self.line;
        self.advance()?;
        let exprs = if self.block_follow() || self.check(&Token::Semi) {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.test_next(&Token::Semi)?;
        Ok(Stmt::Return { exprs, line })
    }

    fn statement(&mut self) -> Result<Stmt, LuaError> {
        let line = self.line;
        match self.tok {
            Token::If => self.if_stmt(line),
            Token::While => {
                self.advance()?;
                let cond = self.expr()?;
                self.expect(Token::Do)?;
                let body = self.block()?;
                self.expect_match(Token::End, Token::While, line)?;
                Ok(Stmt::While { cond, body })
            }
            Token::Do => {
                self.advance()?;
                let body = self.block()?;
                self.expect_match(Token::End, Token::Do, line)?;
                Ok(Stmt::Do(body))
            }
            Token::For => self.for_stmt(line),
            Token::Repeat => {
                self.advance()?;
                let body = self.block()?;
                self.expect_match(Token::Until, Token::Repeat, line)?;
                let cond = self.expr()?;
                Ok(Stmt::Repeat { body, cond })
            }
            Token::Function => {
                self.advance()?;
                let mut fname = FuncName {
                    base: self.name()?,
                    fields: Vec::new(),
                    method: None,
                };
                while self.test_next(&Token::Dot)? {
                    fname.fields.push(self.name()?);
                }
                if self.test_next(&Token::Colon)? {
                    fname.method = Some(self.name()?);
                }
                let body = self.func_body(fname.method.is_some(), line)?;
                Ok(Stmt::Function {
                    name: fname,
                    body: Box::new(body),
                })
            }
            Token::Local => {
                self.advance()?;
                if self.test_next(&Token::Function)? {
                    let name = self.name()?;
                    let body = self.func_body(false, line)?;
                    return Ok(Stmt::LocalFunction {
                        name,
                        body: Box::new(body),
                    });
                }
                let mut names = vec![self.name()?];
                while self.test_next(&Token::Comma)? {
                    names.push(self.name()?);
                }
                let exprs = if self.test_next(&Token::Assign)? {
                    self.expr_list()?
                } else {
                    Vec::new()
                };
                Ok(Stmt::Local { names, exprs })
            }
            _ => self.expr_stat(line),
        }
    }

    fn if_stmt(&mut self, line: u32) -> Result<Stmt, LuaError> {
        let mut branches = Vec::new();
        self.advance()?;
        let cond = self.expr()?;
        self.expect(Token::Then)?;
        branches.push((cond, self.block()?));
        let mut orelse = None;
        loop {
            if self.test_next(&Token::Elseif)? {
                let cond = self.expr()?;
                self.expect(Token::Then)?;
                branches.push((cond, self.block()?));
            } else if self.test_next(&Token::Else)? {
                orelse = Some(self.block()?);
                self.expect_match(Token::End, Token::If, line)?;
                break;
            } else {
                self.expect_match(Token::End, Token::If, line)?;
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    fn for_stmt(&mut self, line: u32) -> Result<Stmt, LuaError> {
        self.advance()?;
        let first = self.name()?;
        match self.tok {
            Token::Assign => {
                self.advance()?;
                let start = self.expr()?;
                self.expect(Token::Comma)?;
                let limit = self.expr()?;
                let step = if self.test_next(&Token::Comma)? {
                    Some(self.expr()?)
                } else {
                    None
                };
                self.expect(Token::Do)?;
                let body = self.block()?;
                self.expect_match(Token::End, Token::For, line)?;
                Ok(Stmt::NumericFor {
                    var: first,
                    start,
                    limit,
                    step,
                    body,
                    line,
                })
            }
            Token::Comma | Token::In => {
                let mut names = vec![first];
                while self.test_next(&Token::Comma)? {
                    names.push(self.name()?);
                }
                self.expect(Token::In)?;
                let exprs = self.expr_list()?;
                self.expect(Token::Do)?;
                let body = self.block()?;
                self.expect_match(Token::End, Token::For, line)?;
                Ok(Stmt::GenericFor {
                    names,
                    exprs,
                    body,
                    line,
                })
            }
            _ => Err(self.error_near("'=' or 'in' expected")),
        }
    }

    fn expr_stat(&mut self, line: u32) -> Result<Stmt, LuaError> {
        let first = self.suffixed_expr()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.test_next(&Token::Comma)? {
                targets.push(self.suffixed_expr()?);
            }
            for t in &targets {
                if !matches!(t, Expr::Name(_) | Expr::Index { .. }) {
                    return Err(self.error_near("syntax error"));
                }
            }
            self.expect(Token::Assign)?;
            let exprs = self.expr_list()?;
            return Ok(Stmt::Assign {
                targets,
                exprs,
                line,
            });
        }
        match first {
            Expr::Call { .. } | Expr::Method { .. } => Ok(Stmt::Call(first)),
            _ => Err(self.error_near("syntax error")),
        }
    }

    fn func_body(&mut self, is_method: bool, line: u32) -> Result<FuncBody, LuaError> {
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        self.expect(Token::LParen)?;
        if !self.check(&Token::RParen) {
            loop {
                match &self.tok {
                    Token::Name(_) => params.push(self.name()?),
                    Token::Dots => {
                        self.advance()?;
                        is_vararg = true;
                        break;
                    }
                    _ => return Err(self.error_near("<name> expected")),
                }
                if !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        let body = self.block()?;
        let end_line = self.line;
        self.expect_match(Token::End, Token::Function, line)?;
        Ok(FuncBody {
            params,
            is_vararg,
            body,
            line,
            end_line,
        })
    }

    // ---- Expressions ----

    fn expr_list(&mut self) -> Result<Vec<Expr>, LuaError> {
        let mut list = vec![self.expr()?];
        while self.test_next(&Token::Comma)? {
            list.push(self.expr()?);
        }
        Ok(list)
    }

    pub fn expr(&mut self) -> Result<Expr, LuaError> {
        self.sub_expr(0)
    }

    fn sub_expr(&mut self, limit: u8) -> Result<Expr, LuaError> {
        self.enter()?;
        let unary = match self.tok {
            Token::Not => Some(UnOp::Not),
            Token::Minus => Some(UnOp::Neg),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        };
        let mut lhs = if let Some(op) = unary {
            let line = self.line;
            self.advance()?;
            let operand = self.sub_expr(UNARY_PRIORITY)?;
            match (op, operand) {
                (UnOp::Neg, Expr::Number(n)) => Expr::Number(-n),
                (op, operand) => Expr::Unary {
                    op,
                    expr: Box::new(operand),
                    line,
                },
            }
        } else {
            self.simple_expr()?
        };
        loop {
            let is_and = self.check(&Token::And);
            let is_or = self.check(&Token::Or);
            if is_and || is_or {
                let prio = if is_and { 2 } else { 1 };
                if prio <= limit {
                    break;
                }
                self.advance()?;
                let rhs = self.sub_expr(prio)?;
                lhs = if is_and {
                    Expr::And(Box::new(lhs), Box::new(rhs))
                } else {
                    Expr::Or(Box::new(lhs), Box::new(rhs))
                };
                continue;
            }
            let (op, left, right) = match binary_op(&self.tok) {
                Some(p) => p,
                None => break,
            };
            if left <= limit {
                break;
            }
            let line = self.line;
            self.advance()?;
            let rhs = self.sub_expr(right)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        self.leave();
        Ok(lhs)
    }

    fn simple_expr(&mut self) -> Result<Expr, LuaError> {
        let e = match &self.tok {
            Token::Number(n) => Expr::Number(*n),
            Token::Str(s) => Expr::Str(Arc::from(String::from_utf8_lossy(s).as_ref())),
            Token::Nil => Expr::Nil,
            Token::True => Expr::True,
            Token::False => Expr::False,
            Token::Dots => Expr::Vararg,
            Token::LBrace => return self.table_constructor(),
            Token::Function => {
                let line = self.line;
                self.advance()?;
                let body = self.func_body(false, line)?;
                return Ok(Expr::Function(Box::new(body)));
            }
            _ => return self.suffixed_expr(),
        };
        self.advance()?;
        Ok(e)
    }

    fn primary_expr(&mut self) -> Result<Expr, LuaError> {
        match &self.tok {
            Token::Name(_) => Ok(Expr::Name(self.name()?)),
            Token::LParen => {
                let line = self.line;
                self.advance()?;
                let inner = self.expr()?;
                self.expect_match(Token::RParen, Token::LParen, line)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            _ => Err(self.error_near("unexpected symbol")),
        }
    }

    fn suffixed_expr(&mut self) -> Result<Expr, LuaError> {
        let mut e = self.primary_expr()?;
        loop {
            let line = self.line;
            match &self.tok {
                Token::Dot => {
                    self.advance()?;
                    let name = self.name()?;
                    e = Expr::Index {
                        obj: Box::new(e),
                        key: Box::new(Expr::Str(Arc::from(name.as_str()))),
                        line,
                    };
                }
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expr()?;
                    self.expect(Token::RBracket)?;
                    e = Expr::Index {
                        obj: Box::new(e),
                        key: Box::new(key),
                        line,
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let name = self.name()?;
                    let args = self.call_args()?;
                    e = Expr::Method {
                        obj: Box::new(e),
                        name: Arc::from(name.as_str()),
                        args,
                        line,
                    };
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    let args = self.call_args()?;
                    e = Expr::Call {
                        func: Box::new(e),
                        args,
                        line,
                    };
                }
                _ => return Ok(e),
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, LuaError> {
        match &self.tok {
            Token::Str(s) => {
                let e = Expr::Str(Arc::from(String::from_utf8_lossy(s).as_ref()));
                self.advance()?;
                Ok(vec![e])
            }
            Token::LBrace => Ok(vec![self.table_constructor()?]),
            Token::LParen => {
                let line = self.line;
                self.advance()?;
                if self.test_next(&Token::RParen)? {
                    return Ok(Vec::new());
                }
                let args = self.expr_list()?;
                self.expect_match(Token::RParen, Token::LParen, line)?;
                Ok(args)
            }
            _ => Err(self.error_near("function arguments expected")),
        }
    }

    fn table_constructor(&mut self) -> Result<Expr, LuaError> {
        let line = self.line;
        self.expect(Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            match &self.tok {
                Token::Name(n) => {
                    let n = n.clone();
                    if self.lookahead()? == &Token::Assign {
                        self.advance()?;
                        self.advance()?;
                        let value = self.expr()?;
                        fields.push(TableField::Keyed(Expr::Str(Arc::from(n.as_str())), value));
                    } else {
                        fields.push(TableField::Item(self.expr()?));
                    }
                }
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expr()?;
                    self.expect(Token::RBracket)?;
                    self.expect(Token::Assign)?;
                    let value = self.expr()?;
                    fields.push(TableField::Keyed(key, value));
                }
                _ => fields.push(TableField::Item(self.expr()?)),
            }
            if !(self.test_next(&Token::Comma)? || self.test_next(&Token::Semi)?) {
                break;
            }
        }
        self.expect_match(Token::RBrace, Token::LBrace, line)?;
        Ok(Expr::Table(fields))
    }
}

/// Parses `src` into a block, tagging diagnostics with `chunk`.
pub fn parse(src: &[u8], chunk: &str) -> Result<Block, LuaError> {
    Parser::new(src, chunk)?.parse_chunk()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(src: &str) -> String {
        parse(src.as_bytes(), "test").unwrap_err().to_string()
    }

    #[test]
    fn precedence() {
        let block = parse(b"return 1 + 2 * 3 ^ 2 .. 'x'", "t").unwrap();
        let (stmt, _) = &block.stmts[0];
        match stmt {
            Stmt::Return { exprs, .. } => match &exprs[0] {
                Expr::Binary { op, .. } => assert_eq!(*op, BinOp::Concat),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_carry_location() {
        assert_eq!(err("x = = 1"), "test:1: unexpected symbol near '='");
        assert_eq!(err("\nlocal 1"), "test:2: <name> expected near '1'");
        assert_eq!(
            err("function f()\nreturn 1\n"),
            "test:3: 'end' expected (to close 'function' at line 1) near '<eof>'"
        );
        assert_eq!(err("x"), "test:1: syntax error near '<eof>'");
    }

    #[test]
    fn method_definitions_get_self() {
        let block = parse(b"function a.b:c(x) end", "t").unwrap();
        match &block.stmts[0].0 {
            Stmt::Function { name, body } => {
                assert_eq!(name.base, "a");
                assert_eq!(name.fields, vec!["b".to_string()]);
                assert_eq!(name.method.as_deref(), Some("c"));
                assert_eq!(body.params, vec!["self".to_string(), "x".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
