//! Label expressions for task placement constraints.
//!
//! A task may declare where it can run as a boolean expression over
//! label atoms: `linux && docker`, `(x86 || arm) && !windows`. Nodes
//! expose a set of labels (their own name plus configured and
//! contributed tokens); an expression matches a node when it
//! evaluates to true over that set.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Parsed label expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelExpr {
    Atom(String),
    Not(Box<LabelExpr>),
    And(Box<LabelExpr>, Box<LabelExpr>),
    Or(Box<LabelExpr>, Box<LabelExpr>),
}

impl LabelExpr {
    /// Parse an expression. Grammar, loosest-binding first:
    /// `or := and ('||' and)*`, `and := unary ('&&' unary)*`,
    /// `unary := '!' unary | '(' or ')' | atom`.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::LabelParse(format!(
                "unexpected trailing input in {input:?}"
            )));
        }
        Ok(expr)
    }

    /// Single-atom expression.
    pub fn atom(name: impl Into<String>) -> Self {
        LabelExpr::Atom(name.into())
    }

    /// Evaluate against a node's label set.
    pub fn matches(&self, labels: &HashSet<String>) -> bool {
        match self {
            LabelExpr::Atom(name) => labels.contains(name),
            LabelExpr::Not(inner) => !inner.matches(labels),
            LabelExpr::And(a, b) => a.matches(labels) && b.matches(labels),
            LabelExpr::Or(a, b) => a.matches(labels) || b.matches(labels),
        }
    }

    /// Atoms referenced anywhere in the expression.
    pub fn atoms(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            LabelExpr::Atom(name) => out.push(name),
            LabelExpr::Not(inner) => inner.collect_atoms(out),
            LabelExpr::And(a, b) | LabelExpr::Or(a, b) => {
                a.collect_atoms(out);
                b.collect_atoms(out);
            }
        }
    }
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelExpr::Atom(name) => write!(f, "{name}"),
            LabelExpr::Not(inner) => write!(f, "!{inner}"),
            LabelExpr::And(a, b) => write!(f, "({a} && {b})"),
            LabelExpr::Or(a, b) => write!(f, "({a} || {b})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Atom(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(Error::LabelParse(format!("expected '&&' in {input:?}")));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(Error::LabelParse(format!("expected '||' in {input:?}")));
                }
                tokens.push(Token::Or);
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                        atom.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Atom(atom));
            }
            c => {
                return Err(Error::LabelParse(format!(
                    "unexpected character {c:?} in {input:?}"
                )));
            }
        }
    }

    if tokens.is_empty() {
        return Err(Error::LabelParse("empty expression".to_string()));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<LabelExpr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = LabelExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<LabelExpr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = LabelExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<LabelExpr> {
        match self.next() {
            Some(Token::Not) => Ok(LabelExpr::Not(Box::new(self.parse_unary()?))),
            Some(Token::Open) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(expr),
                    _ => Err(Error::LabelParse("unbalanced parentheses".to_string())),
                }
            }
            Some(Token::Atom(name)) => Ok(LabelExpr::Atom(name)),
            other => Err(Error::LabelParse(format!("unexpected token: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_atom() {
        let expr = LabelExpr::parse("linux").unwrap();
        assert!(expr.matches(&labels(&["linux", "docker"])));
        assert!(!expr.matches(&labels(&["windows"])));
    }

    #[test]
    fn test_and_or_precedence() {
        // && binds tighter than ||
        let expr = LabelExpr::parse("a || b && c").unwrap();
        assert!(expr.matches(&labels(&["a"])));
        assert!(expr.matches(&labels(&["b", "c"])));
        assert!(!expr.matches(&labels(&["b"])));
    }

    #[test]
    fn test_not_and_parens() {
        let expr = LabelExpr::parse("(x86 || arm) && !windows").unwrap();
        assert!(expr.matches(&labels(&["x86", "linux"])));
        assert!(!expr.matches(&labels(&["x86", "windows"])));
        assert!(!expr.matches(&labels(&["linux"])));
    }

    #[test]
    fn test_parse_errors() {
        assert!(LabelExpr::parse("").is_err());
        assert!(LabelExpr::parse("a &&").is_err());
        assert!(LabelExpr::parse("(a || b").is_err());
        assert!(LabelExpr::parse("a & b").is_err());
    }

    #[test]
    fn test_atoms() {
        let expr = LabelExpr::parse("a && (b || !c)").unwrap();
        assert_eq!(expr.atoms(), vec!["a", "b", "c"]);
    }
}
