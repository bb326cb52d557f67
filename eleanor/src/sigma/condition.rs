//! Recursive-descent parser and evaluator for Sigma condition expressions
//! (`selection1 and not selection2`, `1 of selection*`, `(a or b) and c`).
//!
//! Standard boolean operator precedence applies: `not` binds tighter than
//! `and`, which binds tighter than `or`. Sigma itself leaves precedence
//! unspecified, so this follows the conventional ordering rather than a
//! naive left-to-right token walk.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum ConditionExpr {
    Selection(String),
    /// `1 of selectionname*` / `all of selectionname*` style quantifiers.
    OfPattern { quantifier: Quantifier, pattern: String },
    Not(Box<ConditionExpr>),
    And(Box<ConditionExpr>, Box<ConditionExpr>),
    Or(Box<ConditionExpr>, Box<ConditionExpr>),
}

#[derive(Debug, Clone, Copy)]
pub enum Quantifier {
    Count(usize),
    All,
}

#[derive(Debug, thiserror::Error)]
pub enum ConditionParseError {
    #[error("unexpected end of condition expression")]
    UnexpectedEnd,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("expected closing parenthesis")]
    MissingCloseParen,
}

struct Tokenizer<'a> {
    tokens: std::iter::Peekable<std::vec::IntoIter<&'a str>>,
}

fn tokenize(input: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    let mut token_start: Option<usize> = None;

    let flush = |tokens: &mut Vec<&str>, start: &mut Option<usize>, end: usize, s: &str| {
        if let Some(st) = start.take() {
            if end > st {
                tokens.push(&s[st..end]);
            }
        }
    };

    while let Some(&(idx, ch)) = chars.peek() {
        if ch.is_whitespace() {
            flush(&mut tokens, &mut token_start, idx, input);
            chars.next();
        } else if ch == '(' || ch == ')' {
            flush(&mut tokens, &mut token_start, idx, input);
            tokens.push(&input[idx..idx + 1]);
            chars.next();
        } else {
            if token_start.is_none() {
                token_start = Some(idx);
            }
            chars.next();
        }
    }
    flush(&mut tokens, &mut token_start, input.len(), input);
    tokens
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            tokens: tokenize(input).into_iter().peekable(),
        }
    }

    fn peek(&mut self) -> Option<&&str> {
        self.tokens.peek()
    }

    fn next(&mut self) -> Option<&'a str> {
        self.tokens.next()
    }
}

pub fn parse_condition(input: &str) -> Result<ConditionExpr, ConditionParseError> {
    let mut tok = Tokenizer::new(input);
    let expr = parse_or(&mut tok)?;
    if tok.peek().is_some() {
        return Err(ConditionParseError::UnexpectedToken(tok.next().unwrap().to_string()));
    }
    Ok(expr)
}

fn parse_or(tok: &mut Tokenizer) -> Result<ConditionExpr, ConditionParseError> {
    let mut left = parse_and(tok)?;
    while let Some(&t) = tok.peek() {
        if t.eq_ignore_ascii_case("or") {
            tok.next();
            let right = parse_and(tok)?;
            left = ConditionExpr::Or(Box::new(left), Box::new(right));
        } else {
            break;
        }
    }
    Ok(left)
}

fn parse_and(tok: &mut Tokenizer) -> Result<ConditionExpr, ConditionParseError> {
    let mut left = parse_not(tok)?;
    while let Some(&t) = tok.peek() {
        if t.eq_ignore_ascii_case("and") {
            tok.next();
            let right = parse_not(tok)?;
            left = ConditionExpr::And(Box::new(left), Box::new(right));
        } else {
            break;
        }
    }
    Ok(left)
}

fn parse_not(tok: &mut Tokenizer) -> Result<ConditionExpr, ConditionParseError> {
    if let Some(&t) = tok.peek() {
        if t.eq_ignore_ascii_case("not") {
            tok.next();
            let inner = parse_not(tok)?;
            return Ok(ConditionExpr::Not(Box::new(inner)));
        }
    }
    parse_atom(tok)
}

fn parse_atom(tok: &mut Tokenizer) -> Result<ConditionExpr, ConditionParseError> {
    let t = tok.next().ok_or(ConditionParseError::UnexpectedEnd)?;

    if t == "(" {
        let inner = parse_or(tok)?;
        match tok.next() {
            Some(")") => return Ok(inner),
            _ => return Err(ConditionParseError::MissingCloseParen),
        }
    }

    if t.eq_ignore_ascii_case("all") || t == "1" || t.chars().all(|c| c.is_ascii_digit()) {
        if let Some(&next) = tok.peek() {
            if next.eq_ignore_ascii_case("of") {
                tok.next();
                let pattern = tok.next().ok_or(ConditionParseError::UnexpectedEnd)?;
                let quantifier = if t.eq_ignore_ascii_case("all") {
                    Quantifier::All
                } else {
                    Quantifier::Count(t.parse().unwrap_or(1))
                };
                return Ok(ConditionExpr::OfPattern {
                    quantifier,
                    pattern: pattern.to_string(),
                });
            }
        }
    }

    Ok(ConditionExpr::Selection(t.to_string()))
}

/// Evaluates a parsed condition against a map of selection-name to whether
/// that named selection matched the current event.
pub fn evaluate(expr: &ConditionExpr, selection_results: &HashMap<String, bool>) -> bool {
    match expr {
        ConditionExpr::Selection(name) => *selection_results.get(name).unwrap_or(&false),
        ConditionExpr::Not(inner) => !evaluate(inner, selection_results),
        ConditionExpr::And(l, r) => evaluate(l, selection_results) && evaluate(r, selection_results),
        ConditionExpr::Or(l, r) => evaluate(l, selection_results) || evaluate(r, selection_results),
        ConditionExpr::OfPattern { quantifier, pattern } => {
            let pattern_lower = pattern.to_lowercase();
            let matches: Vec<bool> = selection_results
                .iter()
                .filter(|(name, _)| pattern == "them" || super::matcher::wildcard_match(&name.to_lowercase(), &pattern_lower))
                .map(|(_, v)| *v)
                .collect();
            match quantifier {
                Quantifier::All => !matches.is_empty() && matches.iter().all(|v| *v),
                Quantifier::Count(n) => matches.iter().filter(|v| **v).count() >= *n,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(pairs: &[(&str, bool)]) -> HashMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn precedence_not_before_and_before_or() {
        let expr = parse_condition("a or b and not c").unwrap();
        // a=false, b=true, c=true -> (not c)=false, b and false=false, a or false=false
        let r = results(&[("a", false), ("b", true), ("c", true)]);
        assert!(!evaluate(&expr, &r));

        // a=true -> short circuits true regardless
        let r2 = results(&[("a", true), ("b", false), ("c", false)]);
        assert!(evaluate(&expr, &r2));
    }

    #[test]
    fn parenthesized_grouping_overrides_precedence() {
        let expr = parse_condition("(a or b) and c").unwrap();
        let r = results(&[("a", true), ("b", false), ("c", false)]);
        assert!(!evaluate(&expr, &r));
    }

    #[test]
    fn of_pattern_quantifiers() {
        let expr = parse_condition("1 of selection_*").unwrap();
        let r = results(&[("selection_a", false), ("selection_b", true)]);
        assert!(evaluate(&expr, &r));

        let expr_all = parse_condition("all of selection_*").unwrap();
        assert!(!evaluate(&expr_all, &r));
    }

    #[test]
    fn of_pattern_uses_fnmatch_not_a_prefix_check() {
        // A suffix glob like `*_keyword` must only match names ending in
        // `_keyword`, which a naive `starts_with` on the stripped pattern
        // would get wrong (it would match everything).
        let expr = parse_condition("1 of *_keyword").unwrap();
        let r = results(&[("sel_keyword", true), ("other_selection", false)]);
        assert!(evaluate(&expr, &r));

        let expr_none = parse_condition("1 of *_keyword").unwrap();
        let r2 = results(&[("keyword_sel", false), ("other_selection", false)]);
        assert!(!evaluate(&expr_none, &r2));
    }
}
