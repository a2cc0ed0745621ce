//! Lexer for the guard-expression sublanguage.
//!
//! Uses logos for tokenization. The language is a small, total,
//! side-effect-free expression grammar: literals, dotted/indexed paths
//! rooted at the run context namespaces, comparisons, boolean connectives,
//! arithmetic, and the `len`/`is_null` builtins.

use std::fmt;

use logos::Logos;
use thiserror::Error;

/// Source span (byte offsets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A token with its span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug, Error, PartialEq)]
#[error("unexpected character at byte {offset}")]
pub struct LexError {
    pub offset: usize,
}

/// Token types for the expression language.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    // Keywords
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,

    // Literals
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Operators
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
}

/// Strip the surrounding quotes and process escapes.
fn unescape(raw: &str) -> Option<String> {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Some(out)
}

/// Tokenize an expression source string.
pub fn lex(input: &str) -> Result<Vec<SpannedToken>, LexError> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(input);
    while let Some(result) = lexer.next() {
        let span = Span::new(lexer.span().start, lexer.span().end);
        match result {
            Ok(token) => tokens.push(SpannedToken { token, span }),
            Err(_) => return Err(LexError { offset: span.start }),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        lex(input).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn lexes_path_expression() {
        assert_eq!(
            kinds("inputs.subject"),
            vec![
                Token::Ident("inputs".into()),
                Token::Dot,
                Token::Ident("subject".into()),
            ]
        );
    }

    #[test]
    fn lexes_comparison() {
        assert_eq!(
            kinds("vars.count >= 3"),
            vec![
                Token::Ident("vars".into()),
                Token::Dot,
                Token::Ident("count".into()),
                Token::GreaterEq,
                Token::Int(3),
            ]
        );
    }

    #[test]
    fn lexes_string_literals_with_escapes() {
        assert_eq!(kinds(r#""a\"b""#), vec![Token::Str("a\"b".into())]);
        assert_eq!(kinds("'plain'"), vec![Token::Str("plain".into())]);
    }

    #[test]
    fn lexes_floats_and_ints() {
        assert_eq!(kinds("1.5 2"), vec![Token::Float(1.5), Token::Int(2)]);
    }

    #[test]
    fn rejects_unknown_characters() {
        let err = lex("vars.x @ 1").unwrap_err();
        assert_eq!(err.offset, 7);
    }
}
