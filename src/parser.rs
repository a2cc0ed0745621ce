//! Recursive descent parser for the guard-expression sublanguage.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! expr     := or
//! or       := and ( ("||" | "or") and )*
//! and      := not ( ("&&" | "and") not )*
//! not      := ("!" | "not") not | cmp
//! cmp      := add ( ("==" | "!=" | "<" | "<=" | ">" | ">=") add )?
//! add      := mul ( ("+" | "-") mul )*
//! mul      := unary ( ("*" | "/" | "%") unary )*
//! unary    := "-" unary | primary
//! primary  := literal | path | call | "(" expr ")"
//! call     := ("len" | "is_null") "(" expr ")"
//! path     := root ( "." ident | "[" (int | string) "]" )*
//! root     := "inputs" | "vars" | "globals" | "node" "[" string-or-ident "]" "." "outputs"
//! ```
//!
//! Every identifier must be rooted at one of the four run-context
//! namespaces; anything else is a parse error, which keeps the language
//! closed over the data the dispatcher actually provides.

use thiserror::Error;

use crate::lexer::{lex, LexError, Span, SpannedToken, Token};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token at {span}: {message}")]
    Unexpected { span: Span, message: String },

    #[error("unknown reference root '{0}': expected inputs, vars, globals, or node[..].outputs")]
    UnknownRoot(String),
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Path(PathExpr),
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Call { func: Builtin, arg: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    IsNull,
}

/// A reference into the run context, e.g. `inputs.sender` or
/// `node[fetch].outputs.id`.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub root: PathRoot,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathRoot {
    Inputs,
    Vars,
    Globals,
    /// `node[<id>].outputs`
    NodeOutputs(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(i64),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse an expression source string into an AST.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(tok) = parser.peek() {
        return Err(ParseError::Unexpected {
            span: tok.span,
            message: "trailing input after expression".into(),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<SpannedToken, ParseError> {
        let tok = self.tokens.get(self.pos).cloned().ok_or(ParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek().map(|t| &t.token) == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ParseError> {
        let tok = self.next()?;
        if tok.token == expected {
            Ok(())
        } else {
            Err(ParseError::Unexpected {
                span: tok.span,
                message: format!("expected {what}"),
            })
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) || self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::AndAnd) || self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Bang) || self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_add()?;
        let op = match self.peek().map(|t| &t.token) {
            Some(Token::EqEq) => Some(BinaryOp::Eq),
            Some(Token::NotEq) => Some(BinaryOp::Ne),
            Some(Token::Less) => Some(BinaryOp::Lt),
            Some(Token::LessEq) => Some(BinaryOp::Le),
            Some(Token::Greater) => Some(BinaryOp::Gt),
            Some(Token::GreaterEq) => Some(BinaryOp::Ge),
            _ => None,
        };
        let Some(op) = op else { return Ok(left) };
        self.pos += 1;
        let right = self.parse_add()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_add(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek().map(|t| &t.token) {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|t| &t.token) {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let tok = self.next()?;
        match tok.token {
            Token::Int(i) => Ok(Expr::Literal(Literal::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Literal::Float(f))),
            Token::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            Token::True => Ok(Expr::Literal(Literal::Bool(true))),
            Token::False => Ok(Expr::Literal(Literal::Bool(false))),
            Token::Null => Ok(Expr::Literal(Literal::Null)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "closing ')'")?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "len" | "is_null" => {
                    let func = if name == "len" { Builtin::Len } else { Builtin::IsNull };
                    self.expect(Token::LParen, "'(' after builtin")?;
                    let arg = self.parse_or()?;
                    self.expect(Token::RParen, "closing ')'")?;
                    Ok(Expr::Call {
                        func,
                        arg: Box::new(arg),
                    })
                }
                _ => self.parse_path(name, tok.span),
            },
            other => Err(ParseError::Unexpected {
                span: tok.span,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }

    fn parse_path(&mut self, root_name: String, span: Span) -> Result<Expr, ParseError> {
        let root = match root_name.as_str() {
            "inputs" => PathRoot::Inputs,
            "vars" => PathRoot::Vars,
            "globals" => PathRoot::Globals,
            "node" => {
                self.expect(Token::LBracket, "'[' after 'node'")?;
                let id_tok = self.next()?;
                let node_id = match id_tok.token {
                    Token::Ident(id) => id,
                    Token::Str(id) => id,
                    _ => {
                        return Err(ParseError::Unexpected {
                            span: id_tok.span,
                            message: "expected node id".into(),
                        })
                    }
                };
                self.expect(Token::RBracket, "closing ']'")?;
                self.expect(Token::Dot, "'.' after node[..]")?;
                let outputs = self.next()?;
                match outputs.token {
                    Token::Ident(ref name) if name == "outputs" => {}
                    _ => {
                        return Err(ParseError::Unexpected {
                            span: outputs.span,
                            message: "expected 'outputs' after node[..]".into(),
                        })
                    }
                }
                PathRoot::NodeOutputs(node_id)
            }
            _ => {
                let _ = span;
                return Err(ParseError::UnknownRoot(root_name));
            }
        };

        let mut segments = Vec::new();
        loop {
            if self.eat(&Token::Dot) {
                let tok = self.next()?;
                match tok.token {
                    Token::Ident(key) => segments.push(Segment::Key(key)),
                    _ => {
                        return Err(ParseError::Unexpected {
                            span: tok.span,
                            message: "expected field name after '.'".into(),
                        })
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let negate = self.eat(&Token::Minus);
                let tok = self.next()?;
                match tok.token {
                    Token::Int(i) => segments.push(Segment::Index(if negate { -i } else { i })),
                    Token::Str(key) if !negate => segments.push(Segment::Key(key)),
                    _ => {
                        return Err(ParseError::Unexpected {
                            span: tok.span,
                            message: "expected integer or string index".into(),
                        })
                    }
                }
                self.expect(Token::RBracket, "closing ']'")?;
            } else {
                break;
            }
        }
        Ok(Expr::Path(PathExpr { root, segments }))
    }
}
