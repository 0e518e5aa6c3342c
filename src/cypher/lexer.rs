//! Hand-rolled Cypher lexer.

use std::iter::Peekable;
use std::str::Chars;

use crate::error::{NornicError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Match,
    Where,
    Return,
    Create,
    Merge,
    Set,
    Remove,
    Delete,
    Detach,
    Drop,
    Constraint,
    Index,
    For,
    Require,
    Is,
    Not,
    Null,
    Unique,
    Node,
    Key,
    And,
    Or,
    Xor,
    As,
    Limit,
    Call,
    Yield,
    If,
    Exists,
    On,
    True,
    False,
    Distinct,

    Ident(String),
    Integer(i64),
    Float(f64),
    Str(String),
    Param(String),

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    DoubleColon,
    Comma,
    Dot,
    Pipe,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    /// `->`
    ArrowRight,
    /// `<-`... consumed as `Lt` + `Minus` would be ambiguous, so the lexer
    /// emits a dedicated token.
    ArrowLeft,
}

fn keyword(word: &str) -> Option<Token> {
    match word.to_ascii_uppercase().as_str() {
        "MATCH" => Some(Token::Match),
        "WHERE" => Some(Token::Where),
        "RETURN" => Some(Token::Return),
        "CREATE" => Some(Token::Create),
        "MERGE" => Some(Token::Merge),
        "SET" => Some(Token::Set),
        "REMOVE" => Some(Token::Remove),
        "DELETE" => Some(Token::Delete),
        "DETACH" => Some(Token::Detach),
        "DROP" => Some(Token::Drop),
        "CONSTRAINT" => Some(Token::Constraint),
        "INDEX" => Some(Token::Index),
        "FOR" => Some(Token::For),
        "REQUIRE" => Some(Token::Require),
        "IS" => Some(Token::Is),
        "NOT" => Some(Token::Not),
        "NULL" => Some(Token::Null),
        "UNIQUE" => Some(Token::Unique),
        "NODE" => Some(Token::Node),
        "KEY" => Some(Token::Key),
        "AND" => Some(Token::And),
        "OR" => Some(Token::Or),
        "XOR" => Some(Token::Xor),
        "AS" => Some(Token::As),
        "LIMIT" => Some(Token::Limit),
        "CALL" => Some(Token::Call),
        "YIELD" => Some(Token::Yield),
        "IF" => Some(Token::If),
        "EXISTS" => Some(Token::Exists),
        "ON" => Some(Token::On),
        "TRUE" => Some(Token::True),
        "FALSE" => Some(Token::False),
        "DISTINCT" => Some(Token::Distinct),
        _ => None,
    }
}

pub fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => push_simple(&mut chars, &mut tokens, Token::LParen),
            ')' => push_simple(&mut chars, &mut tokens, Token::RParen),
            '{' => push_simple(&mut chars, &mut tokens, Token::LBrace),
            '}' => push_simple(&mut chars, &mut tokens, Token::RBrace),
            '[' => push_simple(&mut chars, &mut tokens, Token::LBracket),
            ']' => push_simple(&mut chars, &mut tokens, Token::RBracket),
            ',' => push_simple(&mut chars, &mut tokens, Token::Comma),
            '.' => push_simple(&mut chars, &mut tokens, Token::Dot),
            '|' => push_simple(&mut chars, &mut tokens, Token::Pipe),
            '+' => push_simple(&mut chars, &mut tokens, Token::Plus),
            '*' => push_simple(&mut chars, &mut tokens, Token::Star),
            '=' => push_simple(&mut chars, &mut tokens, Token::Eq),
            ':' => {
                chars.next();
                if chars.peek() == Some(&':') {
                    chars.next();
                    tokens.push(Token::DoubleColon);
                } else {
                    tokens.push(Token::Colon);
                }
            }
            '-' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::ArrowRight);
                } else {
                    tokens.push(Token::Minus);
                }
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('-') => {
                        chars.next();
                        tokens.push(Token::ArrowLeft);
                    }
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Le);
                    }
                    Some('>') => {
                        chars.next();
                        tokens.push(Token::Neq);
                    }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Neq);
                } else {
                    return Err(NornicError::Syntax("unexpected '!'".into()));
                }
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    // line comment
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                } else {
                    tokens.push(Token::Slash);
                }
            }
            '$' => {
                chars.next();
                let name = read_word(&mut chars);
                if name.is_empty() {
                    return Err(NornicError::Syntax("empty parameter name".into()));
                }
                tokens.push(Token::Param(name));
            }
            '\'' | '"' => {
                tokens.push(Token::Str(read_string(&mut chars)?));
            }
            '`' => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('`') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(NornicError::Syntax(
                                "unterminated backquoted identifier".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Ident(name));
            }
            c if c.is_ascii_digit() => {
                tokens.push(read_number(&mut chars)?);
            }
            c if c.is_alphabetic() || c == '_' => {
                let word = read_word(&mut chars);
                tokens.push(keyword(&word).unwrap_or(Token::Ident(word)));
            }
            other => {
                return Err(NornicError::Syntax(format!(
                    "unexpected character {other:?}"
                )));
            }
        }
    }
    Ok(tokens)
}

fn push_simple(chars: &mut Peekable<Chars<'_>>, tokens: &mut Vec<Token>, token: Token) {
    chars.next();
    tokens.push(token);
}

fn read_word(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

fn read_number(chars: &mut Peekable<Chars<'_>>) -> Result<Token> {
    let mut text = String::new();
    let mut is_float = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            chars.next();
        } else if c == '.' {
            // Lookahead: `1.foo` is property access on a literal, not a float.
            let mut ahead = chars.clone();
            ahead.next();
            match ahead.peek() {
                Some(d) if d.is_ascii_digit() => {
                    is_float = true;
                    text.push(c);
                    chars.next();
                }
                _ => break,
            }
        } else if c == 'e' || c == 'E' {
            is_float = true;
            text.push(c);
            chars.next();
            if let Some(&sign @ ('+' | '-')) = chars.peek() {
                text.push(sign);
                chars.next();
            }
        } else {
            break;
        }
    }
    if is_float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| NornicError::Syntax(format!("bad float literal {text}")))
    } else {
        text.parse::<i64>()
            .map(Token::Integer)
            .map_err(|_| NornicError::Syntax(format!("bad integer literal {text}")))
    }
}

fn read_string(chars: &mut Peekable<Chars<'_>>) -> Result<String> {
    let quote = chars.next().unwrap_or('\'');
    let mut out = String::new();
    loop {
        match chars.next() {
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('\\') => out.push('\\'),
                Some(c) if c == quote => out.push(c),
                Some(c) => {
                    out.push('\\');
                    out.push(c);
                }
                None => return Err(NornicError::Syntax("unterminated string".into())),
            },
            Some(c) if c == quote => return Ok(out),
            Some(c) => out.push(c),
            None => return Err(NornicError::Syntax("unterminated string".into())),
        }
    }
}
