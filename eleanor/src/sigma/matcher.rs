//! Evaluates a Sigma detection block's named selections against a
//! `NormalizedEvent`. Field-NAME modifiers (`field|contains`,
//! `field|startswith`, `field|endswith`, `field|re`) are parsed off the
//! selection's field keys, matching the Sigma spec's own modifier syntax
//! rather than sniffing wildcard characters out of the pattern value.
//! Matching is case-insensitive by default; Sigma doesn't standardize a
//! case-sensitive modifier, so none is implemented here.

use std::collections::HashMap;

use crate::core::NormalizedEvent;

use super::condition::{evaluate, parse_condition};
use super::rule::SigmaRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldModifier {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

/// Sigma's `*`/`?` wildcard matching (fnmatch-style): `*` matches any run
/// of characters, `?` matches exactly one.
pub(crate) fn wildcard_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let mut dp = vec![vec![false; pattern.len() + 1]; text.len() + 1];
    dp[0][0] = true;
    for (j, &pc) in pattern.iter().enumerate() {
        if pc == '*' {
            dp[0][j + 1] = dp[0][j];
        }
    }
    for i in 0..text.len() {
        for j in 0..pattern.len() {
            dp[i + 1][j + 1] = match pattern[j] {
                '*' => dp[i][j + 1] || dp[i + 1][j],
                '?' => dp[i][j],
                c => dp[i][j] && c == text[i],
            };
        }
    }
    dp[text.len()][pattern.len()]
}

fn split_field_modifier(raw_key: &str) -> (&str, FieldModifier) {
    match raw_key.split_once('|') {
        Some((field, "contains")) => (field, FieldModifier::Contains),
        Some((field, "startswith")) => (field, FieldModifier::StartsWith),
        Some((field, "endswith")) => (field, FieldModifier::EndsWith),
        Some((field, "re")) => (field, FieldModifier::Regex),
        _ => (raw_key, FieldModifier::Equals),
    }
}

fn value_matches(modifier: FieldModifier, field_value: &str, pattern: &str) -> bool {
    let field_lower = field_value.to_lowercase();
    let pattern_lower = pattern.to_lowercase();
    match modifier {
        FieldModifier::Equals if pattern.contains('*') || pattern.contains('?') => wildcard_match(&field_lower, &pattern_lower),
        FieldModifier::Equals => field_lower == pattern_lower,
        FieldModifier::Contains => field_lower.contains(&pattern_lower),
        FieldModifier::StartsWith => field_lower.starts_with(&pattern_lower),
        FieldModifier::EndsWith => field_lower.ends_with(&pattern_lower),
        FieldModifier::Regex => regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(field_value))
            .unwrap_or(false),
    }
}

/// A single selection block is either a map (AND over its `field op
/// pattern` clauses) or a list of maps (OR over each map).
fn selection_matches(event: &NormalizedEvent, selection: &serde_yaml::Value) -> bool {
    match selection {
        serde_yaml::Value::Sequence(items) => items.iter().any(|item| selection_map_matches(event, item)),
        map @ serde_yaml::Value::Mapping(_) => selection_map_matches(event, map),
        _ => false,
    }
}

/// AND over all `field op pattern` clauses in a single selection map. A
/// `null` pattern matches only an absent/`None` field value; any other
/// pattern against an absent field fails the clause.
fn selection_map_matches(event: &NormalizedEvent, selection: &serde_yaml::Value) -> bool {
    let Some(map) = selection.as_mapping() else {
        return false;
    };

    for (key, value) in map {
        let Some(raw_key) = key.as_str() else { continue };
        let (field, modifier) = split_field_modifier(raw_key);

        let field_value = event.get_field(field);

        if matches!(value, serde_yaml::Value::Null) {
            if field_value.is_some() {
                return false;
            }
            continue;
        }

        let Some(field_value) = field_value else {
            return false;
        };
        let field_str = match &field_value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let candidates: Vec<String> = match value {
            serde_yaml::Value::Sequence(seq) => seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            serde_yaml::Value::String(s) => vec![s.clone()],
            other => vec![serde_yaml::to_string(other).unwrap_or_default()],
        };

        let any_match = candidates.iter().any(|c| value_matches(modifier, &field_str, c));
        if !any_match {
            return false;
        }
    }
    true
}

/// Evaluates all of a rule's named selections against an event, then
/// combines them per the rule's parsed condition expression. Parses the
/// condition fresh each call; `event_matches_compiled` is the hot-path
/// variant that reuses an already-parsed tree.
pub fn event_matches_rule(event: &NormalizedEvent, rule: &SigmaRule) -> bool {
    let expr = match parse_condition(&rule.detection.condition) {
        Ok(expr) => expr,
        Err(e) => {
            tracing::warn!(rule_id = %rule.id, error = %e, "sigma rule has unparseable condition, skipping");
            return false;
        }
    };
    event_matches_compiled(event, rule, &expr)
}

/// Same evaluation as `event_matches_rule` but takes an already-parsed
/// condition tree, so the per-event hot path never re-parses the condition
/// string. Selections still have to be re-evaluated per event since they
/// reference live event fields.
pub fn event_matches_compiled(event: &NormalizedEvent, rule: &SigmaRule, expr: &super::condition::ConditionExpr) -> bool {
    let mut results: HashMap<String, bool> = HashMap::new();
    for (name, selection) in &rule.detection.selections {
        results.insert(name.clone(), selection_matches(event, selection));
    }
    evaluate(expr, &results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigma::rule::{Detection, LogSource};
    use serde_json::json;
    use serde_yaml::Value as YamlValue;
    use std::collections::HashMap as Map;

    fn rule_with(condition: &str, selections: Vec<(&str, YamlValue)>) -> SigmaRule {
        SigmaRule {
            id: "test".to_string(),
            title: "test rule".to_string(),
            description: None,
            level: "high".to_string(),
            tags: vec!["attack.t1059".to_string()],
            logsource: LogSource::default(),
            detection: Detection {
                condition: condition.to_string(),
                selections: selections.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<Map<_, _>>(),
            },
            falsepositives: vec![],
        }
    }

    #[test]
    fn contains_modifier_matches_substring_case_insensitively() {
        let mut selection = serde_yaml::Mapping::new();
        selection.insert(YamlValue::String("process_name|contains".to_string()), YamlValue::String("POWERSHELL".to_string()));
        let rule = rule_with("selection", vec![("selection", YamlValue::Mapping(selection))]);

        let mut event = NormalizedEvent::new("test", chrono::Utc::now(), json!({}));
        event.process_name = Some("C:\\Windows\\System32\\powershell.exe".to_string());

        assert!(event_matches_rule(&event, &rule));
    }

    #[test]
    fn re_modifier_matches_case_insensitively() {
        let mut selection = serde_yaml::Mapping::new();
        selection.insert(
            YamlValue::String("process_name|re".to_string()),
            YamlValue::String(r"POWERSHELL\.EXE$".to_string()),
        );
        let rule = rule_with("selection", vec![("selection", YamlValue::Mapping(selection))]);

        let mut event = NormalizedEvent::new("test", chrono::Utc::now(), json!({}));
        event.process_name = Some("C:\\Windows\\System32\\powershell.exe".to_string());

        assert!(event_matches_rule(&event, &rule));
    }

    #[test]
    fn mitre_techniques_extracted_from_tags() {
        let rule = rule_with("selection", vec![]);
        assert_eq!(rule.mitre_techniques(), vec!["T1059".to_string()]);
    }
}
