//! Optional backend conversion: compiles a `SigmaRule`'s condition and
//! selections into a pure, cacheable closure once, rather than
//! re-parsing the condition string on every event. Matches the shape
//! `event_matches_rule` already computes, but front-loads the parse cost
//! for rules evaluated on a hot path (the real-time processor).

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::NormalizedEvent;

use super::condition::{parse_condition, ConditionExpr, Quantifier};
use super::matcher::{event_matches_compiled, wildcard_match};
use super::rule::SigmaRule;

pub struct CompiledRule {
    pub rule: SigmaRule,
    condition: ConditionExpr,
}

pub type MatchFn = Arc<dyn Fn(&NormalizedEvent) -> bool + Send + Sync>;

impl CompiledRule {
    pub fn compile(rule: SigmaRule) -> Result<Self, super::condition::ConditionParseError> {
        let condition = parse_condition(&rule.detection.condition)?;
        Ok(Self { rule, condition })
    }

    /// Re-evaluates selections per-event (selections reference live event
    /// fields so can't be precompiled away entirely) but reuses the
    /// already-parsed condition tree instead of re-parsing it each time.
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        event_matches_compiled(event, &self.rule, &self.condition)
    }

    pub fn as_match_fn(self: Arc<Self>) -> MatchFn {
        Arc::new(move |event| self.matches(event))
    }
}

/// A backend target for rendering a Sigma rule to a native query string
/// (e.g. a SIEM's own search syntax). This is the secondary, optional
/// capability from the rule-conversion side of the engine — distinct from
/// `CompiledRule`, which precompiles a rule for the real-time match path.
pub trait SigmaBackend {
    /// Stable identifier used as the cache key's second component, e.g.
    /// `"lucene"`.
    fn id(&self) -> &'static str;

    /// Renders a rule to this backend's query language. Must be pure: the
    /// same rule content and the same backend must always render to the
    /// same string, since `ConversionCache` assumes exactly that.
    fn render(&self, rule: &SigmaRule) -> Result<String, ConversionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("condition parse error: {0}")]
    Condition(#[from] super::condition::ConditionParseError),
    #[error("selection {0:?} is neither a mapping nor a list of mappings")]
    UnsupportedSelectionShape(String),
}

/// Renders Sigma rules to a Lucene-style query string (the query syntax
/// used by Elasticsearch/OpenSearch `query_string` queries), the backend
/// named as the spec's own example target.
pub struct LuceneBackend;

impl LuceneBackend {
    fn render_value(field: &str, modifier_key: &str, value: &str) -> String {
        let escaped = escape_lucene_term(value);
        match modifier_key {
            "contains" => format!("{field}:*{escaped}*"),
            "startswith" => format!("{field}:{escaped}*"),
            "endswith" => format!("{field}:*{escaped}"),
            "re" => format!("{field}:/{value}/"),
            _ if value.contains('*') || value.contains('?') => format!("{field}:{escaped}"),
            _ => format!("{field}:\"{escaped}\""),
        }
    }

    fn render_selection_map(map: &serde_yaml::Mapping) -> Result<String, ConversionError> {
        let mut clauses = Vec::new();
        for (key, value) in map {
            let Some(raw_key) = key.as_str() else { continue };
            let (field, modifier_key) = match raw_key.split_once('|') {
                Some((f, m)) => (f, m),
                None => (raw_key, ""),
            };

            if matches!(value, serde_yaml::Value::Null) {
                clauses.push(format!("NOT _exists_:{field}"));
                continue;
            }

            let values: Vec<String> = match value {
                serde_yaml::Value::Sequence(seq) => seq.iter().map(value_to_term_string).collect(),
                other => vec![value_to_term_string(other)],
            };

            let rendered: Vec<String> = values.iter().map(|v| Self::render_value(field, modifier_key, v)).collect();
            if rendered.len() == 1 {
                clauses.push(rendered.into_iter().next().unwrap());
            } else {
                clauses.push(format!("({})", rendered.join(" OR ")));
            }
        }
        Ok(format!("({})", clauses.join(" AND ")))
    }

    fn render_selection(selection: &serde_yaml::Value, name: &str) -> Result<String, ConversionError> {
        match selection {
            serde_yaml::Value::Mapping(map) => Self::render_selection_map(map),
            serde_yaml::Value::Sequence(items) => {
                let rendered: Result<Vec<String>, ConversionError> = items
                    .iter()
                    .map(|item| match item {
                        serde_yaml::Value::Mapping(map) => Self::render_selection_map(map),
                        _ => Err(ConversionError::UnsupportedSelectionShape(name.to_string())),
                    })
                    .collect();
                Ok(format!("({})", rendered?.join(" OR ")))
            }
            _ => Err(ConversionError::UnsupportedSelectionShape(name.to_string())),
        }
    }

    fn render_expr(expr: &ConditionExpr, rule: &SigmaRule) -> Result<String, ConversionError> {
        match expr {
            ConditionExpr::Selection(name) => match rule.detection.selections.get(name) {
                Some(selection) => Self::render_selection(selection, name),
                None => Err(ConversionError::UnsupportedSelectionShape(name.clone())),
            },
            ConditionExpr::Not(inner) => Ok(format!("NOT ({})", Self::render_expr(inner, rule)?)),
            ConditionExpr::And(l, r) => Ok(format!("({}) AND ({})", Self::render_expr(l, rule)?, Self::render_expr(r, rule)?)),
            ConditionExpr::Or(l, r) => Ok(format!("({}) OR ({})", Self::render_expr(l, rule)?, Self::render_expr(r, rule)?)),
            ConditionExpr::OfPattern { quantifier, pattern } => {
                let names: Vec<&String> = rule
                    .detection
                    .selections
                    .keys()
                    .filter(|name| pattern == "them" || wildcard_match(name, pattern))
                    .collect();
                let rendered: Result<Vec<String>, ConversionError> =
                    names.iter().map(|name| Self::render_selection(&rule.detection.selections[*name], name)).collect();
                let rendered = rendered?;
                match quantifier {
                    Quantifier::All => Ok(format!("({})", rendered.join(" AND "))),
                    // Lucene has no native "N of" operator; a 1-of quantifier
                    // is an exact OR, anything above that has no single-clause
                    // translation so it's approximated as an OR (over-matches
                    // rather than silently dropping the rule).
                    Quantifier::Count(_) => Ok(format!("({})", rendered.join(" OR "))),
                }
            }
        }
    }
}

impl SigmaBackend for LuceneBackend {
    fn id(&self) -> &'static str {
        "lucene"
    }

    fn render(&self, rule: &SigmaRule) -> Result<String, ConversionError> {
        let expr = parse_condition(&rule.detection.condition)?;
        Self::render_expr(&expr, rule)
    }
}

fn value_to_term_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

fn escape_lucene_term(value: &str) -> String {
    const SPECIAL: &[char] = &['+', '-', '&', '|', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', ':', '\\'];
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Caches rule-to-query conversions keyed by `(rule id, backend id)`. Per
/// spec.md §4.4, conversion is pure (same rule + same backend id always
/// renders the same string), so once a rule is loaded into a read-only
/// registry its conversions never need to be recomputed.
#[derive(Default)]
pub struct ConversionCache {
    cache: DashMap<(String, &'static str), Arc<str>>,
}

impl ConversionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached conversion if present, otherwise renders it with
    /// `backend`, caches, and returns it.
    pub fn convert(&self, rule: &SigmaRule, backend: &dyn SigmaBackend) -> Result<Arc<str>, ConversionError> {
        let key = (rule.id.clone(), backend.id());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        let rendered: Arc<str> = backend.render(rule)?.into();
        self.cache.insert(key, rendered.clone());
        Ok(rendered)
    }
}

#[cfg(test)]
mod backend_tests {
    use super::*;
    use crate::sigma::rule::{Detection, LogSource};
    use std::collections::HashMap as Map;

    fn rule_with(condition: &str, selections: Vec<(&str, serde_yaml::Value)>) -> SigmaRule {
        SigmaRule {
            id: "lucene-test".to_string(),
            title: "lucene test rule".to_string(),
            description: None,
            level: "high".to_string(),
            tags: vec![],
            logsource: LogSource::default(),
            detection: Detection {
                condition: condition.to_string(),
                selections: selections.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<Map<_, _>>(),
            },
            falsepositives: vec![],
        }
    }

    fn mapping(pairs: &[(&str, &str)]) -> serde_yaml::Value {
        let mut m = serde_yaml::Mapping::new();
        for (k, v) in pairs {
            m.insert(serde_yaml::Value::String(k.to_string()), serde_yaml::Value::String(v.to_string()));
        }
        serde_yaml::Value::Mapping(m)
    }

    #[test]
    fn renders_contains_modifier_as_wildcard_wrapped_term() {
        let rule = rule_with("selection", vec![("selection", mapping(&[("process_name|contains", "powershell")]))]);
        let query = LuceneBackend.render(&rule).unwrap();
        assert_eq!(query, "(process_name:*powershell*)");
    }

    #[test]
    fn renders_and_condition_as_conjunction_of_selections() {
        let rule = rule_with(
            "sel1 and sel2",
            vec![("sel1", mapping(&[("field_a", "x")])), ("sel2", mapping(&[("field_b", "y")]))],
        );
        let query = LuceneBackend.render(&rule).unwrap();
        assert_eq!(query, "((field_a:\"x\")) AND ((field_b:\"y\"))");
    }

    #[test]
    fn conversion_cache_is_pure_and_reused() {
        let rule = rule_with("selection", vec![("selection", mapping(&[("field_a", "x")]))]);
        let cache = ConversionCache::new();
        let first = cache.convert(&rule, &LuceneBackend).unwrap();
        let second = cache.convert(&rule, &LuceneBackend).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
