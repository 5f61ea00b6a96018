//! Reader and writer for the data-mode subset of the configuration
//! language used by `cue.mod/module.cue`.
//!
//! The subset covers what a manifest can contain: struct literals with
//! identifier or quoted-string labels (including the `a: b: v` shorthand),
//! strings, booleans, numbers, null, lists, and `//` comments. Separators
//! are commas or newlines. Everything parses into a `serde_json::Value`
//! so the schema layer can stay in serde.

use serde_json::{Map, Number, Value};

use crate::errors::Result;

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Number),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Newline,
    Eof,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Lexer<'a> {
        Lexer { src, pos: 0 }
    }

    fn line_col(&self, pos: usize) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for c in self.src[..pos].chars() {
            if c == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    fn err(&self, pos: usize, msg: impl std::fmt::Display) -> anyhow::Error {
        let (line, col) = self.line_col(pos);
        anyhow::anyhow!("{}:{}: {}", line, col, msg)
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    // Skips spaces, tabs, carriage returns and comments; stops at '\n'.
    fn skip_space(&mut self) {
        loop {
            match self.peek_char() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.bump();
                }
                Some('/') if self.src[self.pos..].starts_with("//") => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> Result<(usize, Token)> {
        self.skip_space();
        let start = self.pos;
        let c = match self.peek_char() {
            None => return Ok((start, Token::Eof)),
            Some(c) => c,
        };
        let tok = match c {
            '\n' => {
                self.bump();
                Token::Newline
            }
            '{' => {
                self.bump();
                Token::LBrace
            }
            '}' => {
                self.bump();
                Token::RBrace
            }
            '[' => {
                self.bump();
                Token::LBracket
            }
            ']' => {
                self.bump();
                Token::RBracket
            }
            ':' => {
                self.bump();
                Token::Colon
            }
            ',' => {
                self.bump();
                Token::Comma
            }
            '"' => Token::Str(self.lex_string()?),
            c if c == '-' || c.is_ascii_digit() => Token::Num(self.lex_number()?),
            c if c == '_' || c == '#' || c.is_alphabetic() => Token::Ident(self.lex_ident()),
            c => return Err(self.err(start, format_args!("unexpected character {:?}", c))),
        };
        Ok((start, tok))
    }

    fn lex_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '_' || c == '#' || c.is_alphanumeric() {
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn lex_string(&mut self) -> Result<String> {
        let start = self.pos;
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            let c = match self.bump() {
                None => return Err(self.err(start, "unterminated string literal")),
                Some(c) => c,
            };
            match c {
                '"' => return Ok(out),
                '\n' => return Err(self.err(start, "newline in string literal")),
                '\\' => {
                    let esc = self
                        .bump()
                        .ok_or_else(|| self.err(start, "unterminated escape sequence"))?;
                    match esc {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        '/' => out.push('/'),
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'u' => {
                            let mut code = 0u32;
                            for _ in 0..4 {
                                let d = self
                                    .bump()
                                    .and_then(|c| c.to_digit(16))
                                    .ok_or_else(|| self.err(start, "invalid \\u escape"))?;
                                code = code * 16 + d;
                            }
                            let c = char::from_u32(code)
                                .ok_or_else(|| self.err(start, "invalid \\u escape"))?;
                            out.push(c);
                        }
                        c => {
                            return Err(
                                self.err(start, format_args!("unknown escape sequence \\{}", c))
                            )
                        }
                    }
                }
                c => out.push(c),
            }
        }
    }

    fn lex_number(&mut self) -> Result<Number> {
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.bump();
        }
        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            match c {
                '0'..='9' => {
                    self.bump();
                }
                '.' | 'e' | 'E' | '+' | '-' => {
                    is_float = true;
                    self.bump();
                }
                _ => break,
            }
        }
        let text = &self.src[start..self.pos];
        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Number::from(i));
            }
        }
        let f: f64 = text
            .parse()
            .map_err(|_| self.err(start, format_args!("invalid number literal {:?}", text)))?;
        Number::from_f64(f).ok_or_else(|| self.err(start, "number out of range"))
    }
}

struct Parser<'a> {
    lex: Lexer<'a>,
    tok: Token,
    tok_pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Result<Parser<'a>> {
        let mut lex = Lexer::new(src);
        let (pos, tok) = lex.next_token()?;
        Ok(Parser {
            lex,
            tok,
            tok_pos: pos,
        })
    }

    fn advance(&mut self) -> Result<()> {
        let (pos, tok) = self.lex.next_token()?;
        self.tok = tok;
        self.tok_pos = pos;
        Ok(())
    }

    fn skip_newlines(&mut self) -> Result<()> {
        while self.tok == Token::Newline {
            self.advance()?;
        }
        Ok(())
    }

    fn err(&self, msg: impl std::fmt::Display) -> anyhow::Error {
        self.lex.err(self.tok_pos, msg)
    }

    // label ":" (value | label ":" ...)
    fn parse_field(&mut self, into: &mut Map<String, Value>) -> Result<()> {
        let label = match std::mem::replace(&mut self.tok, Token::Eof) {
            Token::Ident(s) | Token::Str(s) => s,
            tok => {
                self.tok = tok;
                return Err(self.err("expected field label"));
            }
        };
        self.advance()?;
        if self.tok != Token::Colon {
            return Err(self.err(format_args!("expected ':' after label {:?}", label)));
        }
        self.advance()?;

        // A label directly after ':' means the `a: b: v` shorthand.
        let is_shorthand = matches!(&self.tok, Token::Ident(s) if s != "true" && s != "false" && s != "null")
            || matches!(&self.tok, Token::Str(_) if self.peek_is_colon());
        let value = if is_shorthand && self.peek_is_colon() {
            let mut inner = Map::new();
            self.parse_field(&mut inner)?;
            Value::Object(inner)
        } else {
            self.parse_value()?
        };
        merge_field(into, &label, value).map_err(|e| self.err(e))
    }

    // Looks ahead one token without consuming the current one.
    fn peek_is_colon(&self) -> bool {
        let mut lex = Lexer {
            src: self.lex.src,
            pos: self.lex.pos,
        };
        matches!(lex.next_token(), Ok((_, Token::Colon)))
    }

    fn parse_value(&mut self) -> Result<Value> {
        self.skip_newlines()?;
        let v = match std::mem::replace(&mut self.tok, Token::Eof) {
            Token::Str(s) => {
                self.advance()?;
                Value::String(s)
            }
            Token::Num(n) => {
                self.advance()?;
                Value::Number(n)
            }
            Token::Ident(s) => match s.as_str() {
                "true" => {
                    self.advance()?;
                    Value::Bool(true)
                }
                "false" => {
                    self.advance()?;
                    Value::Bool(false)
                }
                "null" => {
                    self.advance()?;
                    Value::Null
                }
                _ => return Err(self.err(format_args!("unexpected identifier {:?} in value position", s))),
            },
            Token::LBrace => {
                self.advance()?;
                let m = self.parse_struct_body(Token::RBrace)?;
                Value::Object(m)
            }
            Token::LBracket => {
                self.advance()?;
                let mut items = Vec::new();
                self.skip_newlines()?;
                while self.tok != Token::RBracket {
                    items.push(self.parse_value()?);
                    self.skip_newlines()?;
                    if self.tok == Token::Comma {
                        self.advance()?;
                        self.skip_newlines()?;
                    } else if self.tok != Token::RBracket {
                        return Err(self.err("expected ',' or ']' in list"));
                    }
                }
                self.advance()?;
                Value::Array(items)
            }
            tok => {
                self.tok = tok;
                return Err(self.err("expected value"));
            }
        };
        Ok(v)
    }

    fn parse_struct_body(&mut self, end: Token) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        loop {
            self.skip_newlines()?;
            if self.tok == end {
                self.advance()?;
                return Ok(map);
            }
            if self.tok == Token::Eof {
                if end == Token::Eof {
                    return Ok(map);
                }
                return Err(self.err("unexpected end of file in struct"));
            }
            self.parse_field(&mut map)?;
            match self.tok {
                Token::Comma => self.advance()?,
                Token::Newline => self.advance()?,
                ref t if *t == end => {}
                Token::Eof if end == Token::Eof => {}
                _ => return Err(self.err("expected ',' or newline after field")),
            }
        }
    }
}

fn merge_field(
    into: &mut Map<String, Value>,
    label: &str,
    value: Value,
) -> std::result::Result<(), String> {
    match into.get_mut(label) {
        None => {
            into.insert(label.to_string(), value);
            Ok(())
        }
        Some(Value::Object(existing)) => {
            if let Value::Object(new) = value {
                for (k, v) in new {
                    merge_field(existing, &k, v)?;
                }
                Ok(())
            } else {
                Err(format!("conflicting values for field {:?}", label))
            }
        }
        Some(_) => Err(format!("duplicate field {:?}", label)),
    }
}

/// Parses data-mode manifest text into a JSON object value.
pub fn parse(src: &str) -> Result<Value> {
    let mut p = Parser::new(src)?;
    let map = p.parse_struct_body(Token::Eof)?;
    if p.tok != Token::Eof {
        return Err(p.err("trailing input after manifest"));
    }
    Ok(Value::Object(map))
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).expect("string serialization cannot fail")
}

fn write_label(out: &mut String, label: &str) {
    if is_ident(label) {
        out.push_str(label);
    } else {
        out.push_str(&quote(label));
    }
}

fn write_value(out: &mut String, v: &Value, indent: usize) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&quote(s)),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item, indent);
            }
            out.push(']');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{\n");
            for (k, v) in map {
                for _ in 0..=indent {
                    out.push('\t');
                }
                write_label(out, k);
                out.push_str(": ");
                write_value(out, v, indent + 1);
                out.push('\n');
            }
            for _ in 0..indent {
                out.push('\t');
            }
            out.push('}');
        }
    }
}

/// Writes one top-level field in manifest style.
pub fn write_field(out: &mut String, label: &str, v: &Value) {
    write_label(out, label);
    out.push_str(": ");
    write_value(out, v, 0);
    out.push('\n');
}

/// Reads a dotted path like `language.version` out of a parsed value.
pub fn lookup<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = v;
    for elem in path {
        cur = cur.as_object()?.get(*elem)?;
    }
    Some(cur)
}
