//! Transform tokenizer
//!
//! Token set: numbers (`[0-9]+(\.[0-9]+)?`), booleans, single- or
//! double-quoted strings with `\n \r \t \\ \" \'` escapes, identifiers
//! (`[A-Za-z_][A-Za-z_0-9]*`), the keywords `if get set has and or not`,
//! comparison operators, arithmetic operators, `$`, parentheses, commas
//! and the stage separators `|` / `:`. Whitespace is insignificant.

use crate::core::{Error, Result};
use std::fmt;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl fmt::Display for CompOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompOp::Lt => "<",
            CompOp::Le => "<=",
            CompOp::Gt => ">",
            CompOp::Ge => ">=",
            CompOp::Eq => "==",
            CompOp::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// One lexical token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Numeric literal
    Number(f64),
    /// `true` / `false`
    Bool(bool),
    /// Quoted string with escapes resolved
    Str(String),
    /// Identifier (function name or path segment)
    Ident(String),
    /// `$`
    This,
    /// `if`
    If,
    /// `get`
    Get,
    /// `set`
    Set,
    /// `has`
    Has,
    /// `and`
    And,
    /// `or`
    Or,
    /// `not`
    Not,
    /// Comparison operator
    Comp(CompOp),
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// Stage separator `|` or `:`
    Pipe,
    /// `,`
    Comma,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Bool(b) => write!(f, "{b}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Ident(s) => f.write_str(s),
            Token::This => f.write_str("$"),
            Token::If => f.write_str("if"),
            Token::Get => f.write_str("get"),
            Token::Set => f.write_str("set"),
            Token::Has => f.write_str("has"),
            Token::And => f.write_str("and"),
            Token::Or => f.write_str("or"),
            Token::Not => f.write_str("not"),
            Token::Comp(op) => write!(f, "{op}"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Pipe => f.write_str("|"),
            Token::Comma => f.write_str(","),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Eof => f.write_str("<EOF>"),
        }
    }
}

fn lex_error(token: impl Into<String>, message: impl Into<String>) -> Error {
    Error::TransformParse {
        token: token.into(),
        message: message.into(),
    }
}

/// Tokenize a transform source string
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '$' => {
                tokens.push(Token::This);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' | ':' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '<' | '>' => {
                let eq = bytes.get(i + 1) == Some(&b'=');
                let op = match (c, eq) {
                    ('<', true) => CompOp::Le,
                    ('<', false) => CompOp::Lt,
                    ('>', true) => CompOp::Ge,
                    (_, false) => CompOp::Gt,
                    _ => unreachable!(),
                };
                tokens.push(Token::Comp(op));
                i += if eq { 2 } else { 1 };
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Comp(CompOp::Eq));
                    i += 2;
                } else {
                    return Err(lex_error("=", "unknown token, expected '=='"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Comp(CompOp::Ne));
                    i += 2;
                } else {
                    return Err(lex_error("!", "unknown token, expected '!='"));
                }
            }
            '"' | '\'' => {
                let (s, consumed) = lex_string(&input[i..], c)?;
                tokens.push(Token::Str(s));
                i += consumed;
            }
            '0'..='9' => {
                let (n, consumed) = lex_number(&input[i..])?;
                tokens.push(Token::Number(n));
                i += consumed;
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(keyword_or_ident(&input[start..i]));
            }
            other => {
                return Err(lex_error(other.to_string(), "unknown token"));
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn keyword_or_ident(word: &str) -> Token {
    match word {
        "true" => Token::Bool(true),
        "false" => Token::Bool(false),
        "if" => Token::If,
        "get" => Token::Get,
        "set" => Token::Set,
        "has" => Token::Has,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        _ => Token::Ident(word.to_string()),
    }
}

fn lex_number(input: &str) -> Result<(f64, usize)> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if bytes.get(i) == Some(&b'.') && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    let text = &input[..i];
    let n = text
        .parse()
        .map_err(|_| lex_error(text, "malformed number"))?;
    Ok((n, i))
}

fn lex_string(input: &str, quote: char) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut chars = input.char_indices();
    chars.next(); // opening quote

    while let Some((pos, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((out, pos + c.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, 't')) => out.push('\t'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, '"')) => out.push('"'),
                Some((_, '\'')) => out.push('\''),
                Some((_, other)) => {
                    return Err(lex_error(
                        format!("\\{other}"),
                        "unknown escape sequence",
                    ));
                }
                None => break,
            },
            other => out.push(other),
        }
    }
    Err(lex_error(input, "unterminated string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_pipeline() {
        let tokens = tokenize("if get() < 5 : get() >= 3").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::If,
                Token::Get,
                Token::LParen,
                Token::RParen,
                Token::Comp(CompOp::Lt),
                Token::Number(5.0),
                Token::Pipe,
                Token::Get,
                Token::LParen,
                Token::RParen,
                Token::Comp(CompOp::Ge),
                Token::Number(3.0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_and_fractions() {
        assert_eq!(tokenize("3.14").unwrap()[0], Token::Number(3.14));
        assert_eq!(tokenize("42").unwrap()[0], Token::Number(42.0));
        // A trailing '.' is not part of the number and lexes as garbage
        assert!(tokenize("3.").is_err());
    }

    #[test]
    fn test_string_quoting_and_escapes() {
        assert_eq!(
            tokenize(r#""a\tb""#).unwrap()[0],
            Token::Str("a\tb".to_string())
        );
        assert_eq!(
            tokenize(r#"'don\'t'"#).unwrap()[0],
            Token::Str("don't".to_string())
        );
        assert!(tokenize("\"unterminated").is_err());
    }

    #[test]
    fn test_unknown_token() {
        let err = tokenize("a # b").unwrap_err();
        match err {
            Error::TransformParse { token, .. } => assert_eq!(token, "#"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_keywords_are_not_idents() {
        let tokens = tokenize("if iffy").unwrap();
        assert_eq!(tokens[0], Token::If);
        assert_eq!(tokens[1], Token::Ident("iffy".to_string()));
    }
}
