use crate::error::LuaError;
use crate::value::parse_number;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Number(f64),
    Str(Vec<u8>),

    // keywords
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    // symbols
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Colon,
    Comma,
    Dot,
    Concat,
    Dots,

    Eof,
}

impl Token {
    /// Text shown in `near '<tok>'` diagnostics.
    pub fn describe(&self) -> String {
        let s = match self {
            Token::Name(n) => return n.clone(),
            Token::Number(n) => return crate::value::format_number(*n),
            Token::Str(s) => return String::from_utf8_lossy(s).into_owned(),
            Token::And => "and",
            Token::Break => "break",
            Token::Do => "do",
            Token::Else => "else",
            Token::Elseif => "elseif",
            Token::End => "end",
            Token::False => "false",
            Token::For => "for",
            Token::Function => "function",
            Token::If => "if",
            Token::In => "in",
            Token::Local => "local",
            Token::Nil => "nil",
            Token::Not => "not",
            Token::Or => "or",
            Token::Repeat => "repeat",
            Token::Return => "return",
            Token::Then => "then",
            Token::True => "true",
            Token::Until => "until",
            Token::While => "while",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Caret => "^",
            Token::Hash => "#",
            Token::Eq => "==",
            Token::Ne => "~=",
            Token::Le => "<=",
            Token::Ge => ">=",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Assign => "=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Semi => ";",
            Token::Colon => ":",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Concat => "..",
            Token::Dots => "...",
            Token::Eof => "<eof>",
        };
        s.to_string()
    }
}

fn keyword(name: &str) -> Option<Token> {
    Some(match name {
        "and" => Token::And,
        "break" => Token::Break,
        "do" => Token::Do,
        "else" => Token::Else,
        "elseif" => Token::Elseif,
        "end" => Token::End,
        "false" => Token::False,
        "for" => Token::For,
        "function" => Token::Function,
        "if" => Token::If,
        "in" => Token::In,
        "local" => Token::Local,
        "nil" => Token::Nil,
        "not" => Token::Not,
        "or" => Token::Or,
        "repeat" => Token::Repeat,
        "return" => Token::Return,
        "then" => Token::Then,
        "true" => Token::True,
        "until" => Token::Until,
        "while" => Token::While,
        _ => return None,
    })
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    chunk: String,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a [u8], chunk: &str) -> Self {
        let mut lexer = Self {
            src,
            pos: 0,
            line: 1,
            chunk: chunk.to_string(),
        };
        // skip a leading shebang line
        if lexer.src.starts_with(b"#") {
            while let Some(c) = lexer.peek() {
                if c == b'\n' {
                    break;
                }
                lexer.pos += 1;
            }
        }
        lexer
    }

    #[inline]
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn chunk(&self) -> &str {
        &self.chunk
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, off: usize) -> Option<u8> {
        self.src.get(self.pos + off).copied()
    }

    fn error(&self, msg: &str, near: Option<&str>) -> LuaError {
        match near {
            Some(tok) => LuaError::Syntax(format!(
                "{}:{}: {} near '{}'",
                self.chunk, self.line, msg, tok
            )),
            None => LuaError::Syntax(format!("{}:{}: {}", self.chunk, self.line, msg)),
        }
    }

    fn newline(&mut self) {
        let c = self.src[self.pos];
        self.pos += 1;
        // \r\n and \n\r count once
        if let Some(n) = self.peek() {
            if (n == b'\n' || n == b'\r') && n != c {
                self.pos += 1;
            }
        }
        self.line += 1;
    }

    fn skip_trivia(&mut self) -> Result<(), LuaError> {
        loop {
            match self.peek() {
                Some(b'\n') | Some(b'\r') => self.newline(),
                Some(b' ') | Some(b'\t') | Some(0x0b) | Some(0x0c) => self.pos += 1,
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.pos += 2;
                    if self.peek() == Some(b'[') {
                        if let Some(level) = self.long_bracket_level() {
                            self.read_long(level, "unfinished long comment")?;
                            continue;
                        }
                    }
                    while let Some(c) = self.peek() {
                        if c == b'\n' || c == b'\r' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// At a `[`, returns the level of a long bracket `[==[` without consuming it.
    fn long_bracket_level(&self) -> Option<usize> {
        let mut i = 1;
        while self.peek_at(i) == Some(b'=') {
            i += 1;
        }
        if self.peek_at(i) == Some(b'[') {
            Some(i - 1)
        } else {
            None
        }
    }

    fn read_long(&mut self, level: usize, unfinished: &str) -> Result<Vec<u8>, LuaError> {
        self.pos += level + 2;
        // a newline right after the opening bracket is skipped
        if matches!(self.peek(), Some(b'\n') | Some(b'\r')) {
            self.newline();
        }
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error(unfinished, Some("<eof>"))),
                Some(b']') => {
                    let mut i = 1;
                    while self.peek_at(i) == Some(b'=') {
                        i += 1;
                    }
                    if i - 1 == level && self.peek_at(i) == Some(b']') {
                        self.pos += i + 1;
                        return Ok(out);
                    }
                    out.push(b']');
                    self.pos += 1;
                }
                Some(b'\n') | Some(b'\r') => {
                    out.push(b'\n');
                    self.newline();
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn read_string(&mut self, quote: u8) -> Result<Vec<u8>, LuaError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            let c = match self.peek() {
                None => {
                    let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                    return Err(self.error("unfinished string", Some(&text)));
                }
                Some(c) => c,
            };
            match c {
                b'\n' | b'\r' => {
                    let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                    return Err(self.error("unfinished string", Some(&text)));
                }
                b'\\' => {
                    self.pos += 1;
                    let e = match self.peek() {
                        None => continue,
                        Some(e) => e,
                    };
                    match e {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'v' => out.push(0x0b),
                        b'\\' => out.push(b'\\'),
                        b'"' => out.push(b'"'),
                        b'\'' => out.push(b'\''),
                        b'\n' | b'\r' => {
                            out.push(b'\n');
                            self.newline();
                            continue;
                        }
                        b'0'..=b'9' => {
                            let mut v: u32 = 0;
                            let mut digits = 0;
                            while digits < 3 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'9') => {
                                        v = v * 10 + (d - b'0') as u32;
                                        self.pos += 1;
                                        digits += 1;
                                    }
                                    _ => break,
                                }
                            }
                            if v > 255 {
                                return Err(self.error("escape sequence too large", None));
                            }
                            out.push(v as u8);
                            continue;
                        }
                        other => out.push(other),
                    }
                    self.pos += 1;
                }
                c if c == quote => {
                    self.pos += 1;
                    return Ok(out);
                }
                c => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<f64, LuaError> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.pos += 2;
        }
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' => {
                    let is_exp = c == b'e' || c == b'E';
                    self.pos += 1;
                    if is_exp && matches!(self.peek(), Some(b'+') | Some(b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        parse_number(&text).ok_or_else(|| self.error("malformed number", Some(&text)))
    }

    pub fn next_token(&mut self) -> Result<Token, LuaError> {
        self.skip_trivia()?;
        let c = match self.peek() {
            None => return Ok(Token::Eof),
            Some(c) => c,
        };
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == b'_' {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
            return Ok(keyword(&name).unwrap_or(Token::Name(name)));
        }
        if c.is_ascii_digit() || (c == b'.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
        {
            return self.read_number().map(Token::Number);
        }
        let two = |lexer: &mut Self, next: u8, yes: Token, no: Token| {
            if lexer.peek_at(1) == Some(next) {
                lexer.pos += 2;
                yes
            } else {
                lexer.pos += 1;
                no
            }
        };
        let tok = match c {
            b'"' | b'\'' => return self.read_string(c).map(Token::Str),
            b'[' => {
                if let Some(level) = self.long_bracket_level() {
                    return self.read_long(level, "unfinished long string").map(Token::Str);
                }
                self.pos += 1;
                Token::LBracket
            }
            b'=' => two(self, b'=', Token::Eq, Token::Assign),
            b'<' => two(self, b'=', Token::Le, Token::Lt),
            b'>' => two(self, b'=', Token::Ge, Token::Gt),
            b'~' => {
                if self.peek_at(1) == Some(b'=') {
                    self.pos += 2;
                    Token::Ne
                } else {
                    return Err(self.error("unexpected symbol", Some("~")));
                }
            }
            b'.' => {
                if self.peek_at(1) == Some(b'.') {
                    if self.peek_at(2) == Some(b'.') {
                        self.pos += 3;
                        Token::Dots
                    } else {
                        self.pos += 2;
                        Token::Concat
                    }
                } else {
                    self.pos += 1;
                    Token::Dot
                }
            }
            _ => {
                self.pos += 1;
                match c {
                    b'+' => Token::Plus,
                    b'-' => Token::Minus,
                    b'*' => Token::Star,
                    b'/' => Token::Slash,
                    b'%' => Token::Percent,
                    b'^' => Token::Caret,
                    b'#' => Token::Hash,
                    b'(' => Token::LParen,
                    b')' => Token::RParen,
                    b'{' => Token::LBrace,
                    b'}' => Token::RBrace,
                    b']' => Token::RBracket,
                    b';' => Token::Semi,
                    b':' => Token::Colon,
                    b',' => Token::Comma,
                    other => {
                        let text = (other as char).to_string();
                        return Err(self.error("unexpected symbol", Some(&text)));
                    }
                }
            }
        };
        Ok(tok)
    }
}
