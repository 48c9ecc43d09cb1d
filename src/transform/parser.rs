//! Recursive-descent transform parser
//!
//! Grammar (precedence low to high):
//!
//! ```text
//! pipeline := stage (("|" | ":") stage)*
//! stage    := "if" expr | expr
//! expr     := or
//! or       := and ("or" and)*
//! and      := not ("and" not)*
//! not      := "not" not | cmp
//! cmp      := add (COMPOP add)?
//! add      := mul (("+" | "-") mul)*
//! mul      := unary (("*" | "/") unary)*
//! unary    := "-" unary | atom
//! atom     := number | bool | string | "$" | "(" expr ")"
//!           | "get" "(" path? ")" | "set" "(" path? "," expr ")"
//!           | "has" "(" string ")" | identifier ("(" args? ")")?
//! ```
//!
//! Named functions are resolved against the registry while parsing, so an
//! unknown name fails the parse rather than the evaluation.

use crate::core::{Error, Result};
use crate::transform::ast::{ArithOp, Expr, Pipeline, Stage};
use crate::transform::functions;
use crate::transform::lexer::Token;

/// Token-stream parser
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Wrap a token stream produced by the lexer
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_ahead(&self) -> &Token {
        self.tokens.get(self.pos + 1).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        self.pos += 1;
        tok
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::TransformParse {
            token: self.peek().to_string(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<()> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    /// Parse a whole pipeline and require the input to be consumed
    pub fn parse_pipeline(mut self) -> Result<Pipeline> {
        let mut stages = vec![self.parse_stage()?];
        while *self.peek() == Token::Pipe {
            self.advance();
            stages.push(self.parse_stage()?);
        }
        self.expect(&Token::Eof, "end of transform")?;
        Ok(Pipeline::new(stages))
    }

    fn parse_stage(&mut self) -> Result<Stage> {
        if *self.peek() == Token::If {
            self.advance();
            Ok(Stage::Filter(self.parse_expr()?))
        } else {
            Ok(Stage::Map(self.parse_expr()?))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Logic(false, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while *self.peek() == Token::And {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::Logic(true, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if *self.peek() == Token::Not {
            self.advance();
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_cmp()
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let left = self.parse_add()?;
        if let Token::Comp(op) = *self.peek() {
            self.advance();
            let right = self.parse_add()?;
            return Ok(Expr::Comp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Token::Plus => ArithOp::Add,
                Token::Minus => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mul()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => ArithOp::Mul,
                Token::Slash => ArithOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if *self.peek() == Token::Minus {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Bool(b) => Ok(Expr::Bool(b)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::This => Ok(Expr::This),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Get => {
                self.expect(&Token::LParen, "'(' after get")?;
                let path = self.parse_path()?;
                self.expect(&Token::RParen, "')' after get path")?;
                if path.is_empty() {
                    Ok(Expr::This)
                } else {
                    Ok(Expr::Get(path))
                }
            }
            Token::Set => {
                self.expect(&Token::LParen, "'(' after set")?;
                let path = self.parse_path()?;
                if *self.peek() == Token::Comma {
                    self.advance();
                }
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen, "')' after set expression")?;
                Ok(Expr::Set(path, Box::new(expr)))
            }
            Token::Has => {
                self.expect(&Token::LParen, "'(' after has")?;
                let key = match self.advance() {
                    Token::Str(s) => s,
                    _ => {
                        self.pos -= 1;
                        return Err(self.error("expected a quoted key in has()"));
                    }
                };
                self.expect(&Token::RParen, "')' after has key")?;
                Ok(Expr::Has(key))
            }
            Token::Ident(name) => {
                let mut args = Vec::new();
                if *self.peek() == Token::LParen {
                    self.advance();
                    if *self.peek() != Token::RParen {
                        args.push(self.parse_expr()?);
                        while *self.peek() == Token::Comma {
                            self.advance();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Token::RParen, "')' after arguments")?;
                }
                let func = functions::lookup(&name).ok_or_else(|| Error::TransformParse {
                    token: name.clone(),
                    message: "unknown function".to_string(),
                })?;
                Ok(Expr::Call(name, func, args))
            }
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected token '{other}'")))
            }
        }
    }

    /// `path := identifier ("," identifier)*`, greedy: an identifier is a
    /// path segment only while a comma keeps the path going
    fn parse_path(&mut self) -> Result<Vec<String>> {
        let mut path = Vec::new();
        loop {
            match (self.peek(), self.peek_ahead()) {
                (Token::Ident(name), Token::Comma) => {
                    path.push(name.clone());
                    self.advance();
                    self.advance();
                }
                (Token::Ident(name), Token::RParen) => {
                    path.push(name.clone());
                    self.advance();
                    return Ok(path);
                }
                _ => return Ok(path),
            }
        }
    }
}
