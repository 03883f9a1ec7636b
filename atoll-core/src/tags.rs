//! Scheduling tag filters
//!
//! A filter is a boolean formula over atomic tag-presence predicates,
//! e.g. `gpu & !prod | preemptible`. Operations and pools use filters to
//! restrict themselves to node subsets. The empty filter matches everything.
//!
//! Filters are hashed once at construction so per-tree filter indexes can be
//! deduplicated, and registered in a reference-counted directory that the
//! preschedule walk iterates.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Errors from parsing a tag formula
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("Unexpected character {0:?} at position {1}")]
    UnexpectedCharacter(char, usize),

    #[error("Unexpected end of formula")]
    UnexpectedEnd,

    #[error("Unbalanced parentheses")]
    UnbalancedParentheses,

    #[error("Trailing input after formula: {0:?}")]
    TrailingInput(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Expr {
    Tag(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn evaluate(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            Expr::Tag(tag) => tags.contains(tag),
            Expr::Not(inner) => !inner.evaluate(tags),
            Expr::And(lhs, rhs) => lhs.evaluate(tags) && rhs.evaluate(tags),
            Expr::Or(lhs, rhs) => lhs.evaluate(tags) || rhs.evaluate(tags),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(position, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/' => {
                let mut tag = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/' {
                        tag.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Tag(tag));
            }
            c => return Err(FormulaError::UnexpectedCharacter(c, position)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    // or := and ('|' and)*
    fn parse_or(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // and := unary ('&' unary)*
    fn parse_and(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // unary := '!' unary | '(' or ')' | tag
    fn parse_unary(&mut self) -> Result<Expr, FormulaError> {
        match self.advance() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                if self.advance() != Some(Token::Close) {
                    return Err(FormulaError::UnbalancedParentheses);
                }
                Ok(inner)
            }
            Some(Token::Tag(tag)) => Ok(Expr::Tag(tag)),
            Some(Token::Close) => Err(FormulaError::UnbalancedParentheses),
            Some(Token::And) | Some(Token::Or) => Err(FormulaError::UnexpectedEnd),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

/// Boolean formula over tag-presence atoms
#[derive(Debug, Clone)]
pub struct BooleanFormula {
    source: String,
    expr: Option<Expr>,
}

impl BooleanFormula {
    /// Parse a formula; an empty or all-whitespace source is the constant
    /// `true`.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        if source.trim().is_empty() {
            return Ok(Self {
                source: String::new(),
                expr: None,
            });
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let expr = parser.parse_or()?;
        if parser.position != parser.tokens.len() {
            return Err(FormulaError::TrailingInput(source[..].to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            expr: Some(expr),
        })
    }

    /// Evaluate against a node's tag set
    pub fn evaluate(&self, tags: &BTreeSet<String>) -> bool {
        match &self.expr {
            None => true,
            Some(expr) => expr.evaluate(tags),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl PartialEq for BooleanFormula {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Eq for BooleanFormula {}

/// A scheduling filter: a boolean formula plus its memoized hash
#[derive(Debug, Clone)]
pub struct SchedulingTagFilter {
    formula: BooleanFormula,
    hash: u64,
}

impl SchedulingTagFilter {
    /// The filter matching every node
    pub fn empty() -> Self {
        Self::from_formula(BooleanFormula {
            source: String::new(),
            expr: None,
        })
    }

    /// Parse a filter from its formula source
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        Ok(Self::from_formula(BooleanFormula::parse(source)?))
    }

    fn from_formula(formula: BooleanFormula) -> Self {
        let mut hasher = DefaultHasher::new();
        formula.expr.hash(&mut hasher);
        let hash = hasher.finish();
        Self { formula, hash }
    }

    /// True if a node carrying `tags` passes the filter
    pub fn can_schedule(&self, tags: &BTreeSet<String>) -> bool {
        self.formula.evaluate(tags)
    }

    pub fn is_empty(&self) -> bool {
        self.formula.is_empty()
    }

    /// The memoized structural hash, used to key per-tree filter indexes
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn formula(&self) -> &BooleanFormula {
        &self.formula
    }
}

impl PartialEq for SchedulingTagFilter {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.formula == other.formula
    }
}

impl Eq for SchedulingTagFilter {}

impl std::fmt::Display for SchedulingTagFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.formula.source())
    }
}

impl Serialize for SchedulingTagFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.formula.source())
    }
}

impl<'de> Deserialize<'de> for SchedulingTagFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        SchedulingTagFilter::parse(&source).map_err(serde::de::Error::custom)
    }
}

/// Reference-counted directory of registered filters.
///
/// Each tree registers the filters of its pools and operations here so the
/// preschedule path can iterate the distinct filters once per snapshot
/// instead of once per element.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    entries: Mutex<HashMap<u64, (SchedulingTagFilter, usize)>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter, bumping its reference count
    pub fn register(&self, filter: &SchedulingTagFilter) {
        let mut entries = self.entries.lock();
        entries
            .entry(filter.hash())
            .and_modify(|(_, count)| *count += 1)
            .or_insert_with(|| (filter.clone(), 1));
    }

    /// Drop one reference; the entry disappears when the count hits zero
    pub fn unregister(&self, filter: &SchedulingTagFilter) {
        let mut entries = self.entries.lock();
        if let Some((_, count)) = entries.get_mut(&filter.hash()) {
            *count -= 1;
            if *count == 0 {
                entries.remove(&filter.hash());
            }
        }
    }

    /// Snapshot of the distinct registered filters
    pub fn filters(&self) -> Vec<SchedulingTagFilter> {
        self.entries
            .lock()
            .values()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|tag| tag.to_string()).collect()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = SchedulingTagFilter::empty();
        assert!(filter.is_empty());
        assert!(filter.can_schedule(&tags(&[])));
        assert!(filter.can_schedule(&tags(&["anything"])));
    }

    #[test]
    fn test_single_tag() {
        let filter = SchedulingTagFilter::parse("gpu").unwrap();
        assert!(filter.can_schedule(&tags(&["gpu", "prod"])));
        assert!(!filter.can_schedule(&tags(&["prod"])));
    }

    #[test]
    fn test_operators_and_precedence() {
        // `&` binds tighter than `|`
        let filter = SchedulingTagFilter::parse("a & b | c").unwrap();
        assert!(filter.can_schedule(&tags(&["a", "b"])));
        assert!(filter.can_schedule(&tags(&["c"])));
        assert!(!filter.can_schedule(&tags(&["a"])));

        let grouped = SchedulingTagFilter::parse("a & (b | c)").unwrap();
        assert!(grouped.can_schedule(&tags(&["a", "c"])));
        assert!(!grouped.can_schedule(&tags(&["c"])));
    }

    #[test]
    fn test_negation() {
        let filter = SchedulingTagFilter::parse("gpu & !prod").unwrap();
        assert!(filter.can_schedule(&tags(&["gpu"])));
        assert!(!filter.can_schedule(&tags(&["gpu", "prod"])));
    }

    #[test]
    fn test_parse_errors() {
        assert!(SchedulingTagFilter::parse("a &").is_err());
        assert!(SchedulingTagFilter::parse("(a | b").is_err());
        assert!(SchedulingTagFilter::parse("a b").is_err());
        assert!(SchedulingTagFilter::parse("a ^ b").is_err());
    }

    #[test]
    fn test_hash_is_structural() {
        let a = SchedulingTagFilter::parse("gpu & !prod").unwrap();
        let b = SchedulingTagFilter::parse("gpu   &  !prod").unwrap();
        let c = SchedulingTagFilter::parse("gpu | prod").unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_registry_refcounts() {
        let registry = FilterRegistry::new();
        let filter = SchedulingTagFilter::parse("gpu").unwrap();
        registry.register(&filter);
        registry.register(&filter);
        assert_eq!(registry.len(), 1);
        registry.unregister(&filter);
        assert_eq!(registry.len(), 1);
        registry.unregister(&filter);
        assert!(registry.is_empty());
    }
}
