//! The correlation engine: batch and real-time evaluation of the four
//! pattern types (sequence, temporal join, aggregation, spike), grounded in
//! `original_source/backend/app/services/correlation_engine.py`.
//!
//! Batch mode queries an `EventSource` (the outer, out-of-scope search
//! index) for each event definition within the rule's window and builds
//! in-memory entity -> events maps; real-time mode uses a lightweight
//! `field:value[*]` ANDed matcher against the single triggering event and
//! upserts persisted state.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::core::NormalizedEvent;
use crate::core::time::{check_threshold, parse_duration, parse_threshold};
use crate::err::Result;

use super::rules::{CorrelationKindConfig, CorrelationRule};
use super::state::{CorrelationState, CorrelationStateStatus, CorrelationStateStore};

/// A match emitted by either the batch or real-time path, ready to be
/// turned into an `Alert` by the real-time processor.
#[derive(Debug, Clone)]
pub struct CorrelationMatch {
    pub rule_id: String,
    pub entity_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub matched_event_ids: Vec<String>,
    pub event_counts: BTreeMap<String, i64>,
    /// Set only for spike matches; `None` (finite baseline) or
    /// `Some(f64::INFINITY)` when the baseline average was zero.
    pub ratio: Option<f64>,
}

/// The out-of-scope search index this core depends on only through this
/// trait boundary (§1: concrete search backends are external collaborators).
/// `query` follows the index's own query language in batch mode.
pub trait EventSource {
    fn query_window(&self, query: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<NormalizedEvent>>;
}

/// Builds an `entity_key` of the form `field:value` from a single join
/// field, matching the original's `f"{field}:{value}"` convention (e.g.
/// `user.name:bob`).
fn entity_key_for(event: &NormalizedEvent, field: &str) -> Option<String> {
    let value = event.get_field(field)?;
    let plain = match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    Some(format!("{field}:{plain}"))
}

fn group_key_for(event: &NormalizedEvent, group_by: &[String]) -> String {
    if group_by.is_empty() {
        return "__global__".to_string();
    }
    group_by
        .iter()
        .map(|f| {
            let v = event
                .get_field(f)
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "__missing__".to_string());
            format!("{f}:{v}")
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// The limited real-time matcher: ANDed `field:value` / `field:value*`
/// clauses, case-insensitive, split on (case-insensitive) ` and `. Anything
/// more complex is deferred to batch mode.
pub fn simple_query_matches(query: &str, event: &NormalizedEvent) -> bool {
    let lower = query.to_lowercase();
    let clauses: Vec<&str> = split_and(&lower, query);
    clauses.iter().all(|clause| clause_matches(clause, event))
}

/// Splits on the literal word `and` (case-insensitive) without touching
/// the original casing of the operands, returning the original-cased
/// substrings so field values aren't accidentally lowercased before the
/// per-clause comparison (which lowercases itself).
fn split_and<'a>(lower: &str, original: &'a str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let needle = " and ";
    let mut i = 0usize;
    while i + needle.len() <= lower.len() {
        if &lower[i..i + needle.len()] == needle {
            parts.push(original[start..i].trim());
            start = i + needle.len();
            i += needle.len();
        } else {
            i += 1;
        }
    }
    parts.push(original[start..].trim());
    parts
}

fn clause_matches(clause: &str, event: &NormalizedEvent) -> bool {
    let Some((field, pattern)) = clause.split_once(':') else {
        return false;
    };
    let field = field.trim();
    let pattern = pattern.trim();
    let Some(value) = event.get_field(field) else {
        return false;
    };
    let value_str = match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
    .to_lowercase();

    if let Some(prefix) = pattern.strip_suffix('*') {
        value_str.starts_with(&prefix.to_lowercase())
    } else {
        value_str == pattern.to_lowercase()
    }
}

// ---------------------------------------------------------------------
// Batch mode
// ---------------------------------------------------------------------

/// Runs one correlation rule's batch pass over `[now - lookback, now]`
/// (or the rule's configured window when no lookback is set), returning
/// every match found in this single pass. Unlike the real-time path,
/// batch mode considers every window independently — overlapping windows
/// for the same entity are not suppressed.
pub fn run_batch(rule: &CorrelationRule, source: &dyn EventSource, now: DateTime<Utc>) -> Result<Vec<CorrelationMatch>> {
    match &rule.config {
        CorrelationKindConfig::Sequence(cfg) => batch_sequence(rule, cfg, source, now),
        CorrelationKindConfig::TemporalJoin(cfg) => batch_temporal_join(rule, cfg, source, now),
        CorrelationKindConfig::Aggregation(cfg) => batch_aggregation(rule, cfg, source, now),
        CorrelationKindConfig::Spike(cfg) => batch_spike(rule, cfg, source, now),
    }
}

fn batch_sequence(
    rule: &CorrelationRule,
    cfg: &super::rules::SequenceConfig,
    source: &dyn EventSource,
    now: DateTime<Utc>,
) -> Result<Vec<CorrelationMatch>> {
    let window_secs = parse_duration(&cfg.window)?;
    let window_start = now - chrono::Duration::seconds(window_secs);

    // entity_key -> step label -> matched events, preserving arrival order
    // for the "earliest event sets window_start" rule.
    let mut by_entity: HashMap<String, Vec<(String, NormalizedEvent)>> = HashMap::new();

    for step in &cfg.steps {
        let events = source.query_window(&step.query, window_start, now)?;
        for event in events {
            let Some(key) = entity_key_for(&event, &cfg.join_on) else { continue };
            by_entity.entry(key).or_default().push((step.order.to_string(), event));
        }
    }

    let mut matches = Vec::new();
    for (entity_key, mut events) in by_entity {
        events.sort_by_key(|(_, e)| e.timestamp);
        let Some(first_ts) = events.first().map(|(_, e)| e.timestamp) else { continue };
        let entity_window_end = first_ts + chrono::Duration::seconds(window_secs);

        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        let mut matched_ids = Vec::new();
        for (step_label, event) in &events {
            if event.timestamp > entity_window_end {
                continue;
            }
            *counts.entry(step_label.clone()).or_insert(0) += 1;
            matched_ids.push(event.event_id.clone());
        }

        let every_step_satisfied = cfg.steps.iter().all(|step| {
            let count = counts.get(&step.order.to_string()).copied().unwrap_or(0);
            count >= 1
        });

        if every_step_satisfied {
            matches.push(CorrelationMatch {
                rule_id: rule.id.clone(),
                entity_key,
                window_start: first_ts,
                window_end: entity_window_end,
                matched_event_ids: matched_ids,
                event_counts: counts,
                ratio: None,
            });
        }
    }
    Ok(matches)
}

fn batch_temporal_join(
    rule: &CorrelationRule,
    cfg: &super::rules::TemporalJoinConfig,
    source: &dyn EventSource,
    now: DateTime<Utc>,
) -> Result<Vec<CorrelationMatch>> {
    let window_secs = parse_duration(&cfg.window)?;
    let lookback_start = now - chrono::Duration::seconds(window_secs.max(3600));

    let events_a = source.query_window(&cfg.query_a, lookback_start, now)?;
    let events_b = source.query_window(&cfg.query_b, lookback_start, now)?;

    let mut by_entity_b: HashMap<String, Vec<&NormalizedEvent>> = HashMap::new();
    for b in &events_b {
        if let Some(key) = entity_key_for(b, &cfg.join_on) {
            by_entity_b.entry(key).or_default().push(b);
        }
    }

    let mut matches = Vec::new();
    for a in &events_a {
        let Some(key) = entity_key_for(a, &cfg.join_on) else { continue };
        let Some(candidates) = by_entity_b.get(&key) else { continue };
        for b in candidates {
            let delta = (a.timestamp - b.timestamp).num_seconds().abs();
            if delta <= window_secs {
                let (window_start, window_end) = if a.timestamp <= b.timestamp {
                    (a.timestamp, b.timestamp)
                } else {
                    (b.timestamp, a.timestamp)
                };
                matches.push(CorrelationMatch {
                    rule_id: rule.id.clone(),
                    entity_key: key.clone(),
                    window_start,
                    window_end,
                    matched_event_ids: vec![a.event_id.clone(), b.event_id.clone()],
                    event_counts: BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 1)]),
                    ratio: None,
                });
            }
        }
    }
    Ok(matches)
}

fn batch_aggregation(
    rule: &CorrelationRule,
    cfg: &super::rules::AggregationConfig,
    source: &dyn EventSource,
    now: DateTime<Utc>,
) -> Result<Vec<CorrelationMatch>> {
    let window_secs = parse_duration(&cfg.bucket)?;
    let window_start = now - chrono::Duration::seconds(window_secs);
    let (comparator, threshold) = parse_threshold(&cfg.threshold)?;

    let events = source.query_window(&cfg.query, window_start, now)?;
    let mut groups: HashMap<String, Vec<&NormalizedEvent>> = HashMap::new();
    for event in &events {
        groups.entry(group_key_for(event, &cfg.group_by)).or_default().push(event);
    }

    let mut matches = Vec::new();
    for (group_key, group_events) in groups {
        let count = group_events.len() as i64;
        if check_threshold(count, comparator, threshold) {
            matches.push(CorrelationMatch {
                rule_id: rule.id.clone(),
                entity_key: group_key,
                window_start,
                window_end: now,
                matched_event_ids: group_events.iter().map(|e| e.event_id.clone()).collect(),
                event_counts: BTreeMap::from([("count".to_string(), count)]),
                ratio: None,
            });
        }
    }
    Ok(matches)
}

fn batch_spike(
    rule: &CorrelationRule,
    cfg: &super::rules::SpikeConfig,
    source: &dyn EventSource,
    now: DateTime<Utc>,
) -> Result<Vec<CorrelationMatch>> {
    let current_secs = parse_duration(&cfg.current_window)?;
    let baseline_secs = parse_duration(&cfg.baseline_window)?;

    let current_start = now - chrono::Duration::seconds(current_secs);
    let baseline_start = now - chrono::Duration::seconds(baseline_secs);

    let current_events = source.query_window(&cfg.query, current_start, now)?;
    // Baseline excludes the current window.
    let baseline_events = source.query_window(&cfg.query, baseline_start, current_start)?;

    let group_by: Vec<String> = cfg.group_by.clone().into_iter().collect();
    let mut current_groups: HashMap<String, i64> = HashMap::new();
    for e in &current_events {
        *current_groups.entry(group_key_for(e, &group_by)).or_insert(0) += 1;
    }
    let mut baseline_groups: HashMap<String, i64> = HashMap::new();
    for e in &baseline_events {
        *baseline_groups.entry(group_key_for(e, &group_by)).or_insert(0) += 1;
    }

    let bucket_ratio = (baseline_secs as f64 / current_secs as f64).max(1.0);

    let mut matches = Vec::new();
    for (group_key, current_count) in current_groups {
        let baseline_count = baseline_groups.get(&group_key).copied().unwrap_or(0);
        let baseline_avg = baseline_count as f64 / bucket_ratio;

        let (ratio, is_spike) = if baseline_avg == 0.0 {
            (f64::INFINITY, current_count > 0)
        } else {
            let r = current_count as f64 / baseline_avg;
            (r, r >= cfg.ratio_threshold)
        };

        if is_spike {
            matches.push(CorrelationMatch {
                rule_id: rule.id.clone(),
                entity_key: group_key,
                window_start: current_start,
                window_end: now,
                matched_event_ids: Vec::new(),
                event_counts: BTreeMap::from([("current".to_string(), current_count), ("baseline".to_string(), baseline_count)]),
                ratio: Some(ratio),
            });
        }
    }
    Ok(matches)
}

// ---------------------------------------------------------------------
// Real-time mode
// ---------------------------------------------------------------------

/// Real-time dispatch for a single triggering event against one
/// correlation rule. Only sequence and aggregation patterns have a
/// meaningful single-event real-time path in the original; temporal join
/// and spike require comparing against a population and are batch-only
/// (the original defers them the same way).
pub fn dispatch_realtime(
    rule: &CorrelationRule,
    event: &NormalizedEvent,
    store: &CorrelationStateStore,
    now: DateTime<Utc>,
) -> Result<Option<CorrelationMatch>> {
    if !rule.realtime {
        return Ok(None);
    }
    match &rule.config {
        CorrelationKindConfig::Sequence(cfg) => realtime_sequence(rule, cfg, event, store, now),
        CorrelationKindConfig::Aggregation(cfg) => realtime_aggregation(rule, cfg, event, store, now),
        _ => Ok(None),
    }
}

fn matching_step<'a>(cfg: &'a super::rules::SequenceConfig, event: &NormalizedEvent) -> Option<&'a super::rules::SequenceStep> {
    cfg.steps.iter().find(|step| simple_query_matches(&step.query, event))
}

fn realtime_sequence(
    rule: &CorrelationRule,
    cfg: &super::rules::SequenceConfig,
    event: &NormalizedEvent,
    store: &CorrelationStateStore,
    now: DateTime<Utc>,
) -> Result<Option<CorrelationMatch>> {
    let Some(step) = matching_step(cfg, event) else { return Ok(None) };
    let Some(entity_key) = entity_key_for(event, &cfg.join_on) else { return Ok(None) };
    let window_secs = parse_duration(&cfg.window)?;

    // First-open-wins: an existing active window for this entity is
    // extended; a completed/expired/absent state opens a fresh window.
    let mut state = match store.get_active(&rule.id, &entity_key)? {
        Some(existing) if existing.window_end >= now => existing,
        _ => CorrelationState {
            rule_id: rule.id.clone(),
            entity_key: entity_key.clone(),
            status: CorrelationStateStatus::Active,
            window_start: now,
            window_end: now + chrono::Duration::seconds(window_secs),
            matched_event_ids: Vec::new(),
            counts: BTreeMap::new(),
            updated_at: now,
        },
    };

    *state.counts.entry(step.order.to_string()).or_insert(0) += 1;
    state.matched_event_ids.push(event.event_id.clone());
    state.updated_at = now;

    let complete = cfg.steps.iter().all(|s| state.counts.get(&s.order.to_string()).copied().unwrap_or(0) >= 1);

    let result = if complete {
        state.status = CorrelationStateStatus::Completed;
        Some(CorrelationMatch {
            rule_id: rule.id.clone(),
            entity_key: entity_key.clone(),
            window_start: state.window_start,
            window_end: state.window_end,
            matched_event_ids: state.matched_event_ids.clone(),
            event_counts: state.counts.clone(),
            ratio: None,
        })
    } else {
        None
    };

    store.upsert(&state)?;
    Ok(result)
}

fn realtime_aggregation(
    rule: &CorrelationRule,
    cfg: &super::rules::AggregationConfig,
    event: &NormalizedEvent,
    store: &CorrelationStateStore,
    now: DateTime<Utc>,
) -> Result<Option<CorrelationMatch>> {
    let window_secs = parse_duration(&cfg.bucket)?;
    let (comparator, threshold) = parse_threshold(&cfg.threshold)?;
    let group_key = group_key_for(event, &cfg.group_by);
    let entity_key = format!("{}:{}", rule.id, group_key);

    let mut state = match store.get_active(&rule.id, &entity_key)? {
        Some(existing) if existing.window_end >= now => existing,
        _ => CorrelationState {
            rule_id: rule.id.clone(),
            entity_key: entity_key.clone(),
            status: CorrelationStateStatus::Active,
            window_start: now,
            window_end: now + chrono::Duration::seconds(window_secs),
            matched_event_ids: Vec::new(),
            counts: BTreeMap::new(),
            updated_at: now,
        },
    };

    state.matched_event_ids.push(event.event_id.clone());
    *state.counts.entry("count".to_string()).or_insert(0) = state.matched_event_ids.len() as i64;
    state.updated_at = now;

    let count = state.counts.get("count").copied().unwrap_or(0);
    let result = if check_threshold(count, comparator, threshold) {
        state.status = CorrelationStateStatus::Triggered;
        Some(CorrelationMatch {
            rule_id: rule.id.clone(),
            entity_key: group_key,
            window_start: state.window_start,
            window_end: state.window_end,
            matched_event_ids: state.matched_event_ids.clone(),
            event_counts: state.counts.clone(),
            ratio: None,
        })
    } else {
        None
    };

    store.upsert(&state)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn event_with(user: &str, kind: &str, ts: DateTime<Utc>) -> NormalizedEvent {
        let mut e = NormalizedEvent::new("test", ts, json!({"user": {"name": user}}));
        e.category = kind.to_string();
        e.set_label("user.name", user);
        e
    }

    struct FixedSource {
        events: RefCell<Vec<NormalizedEvent>>,
    }

    impl EventSource for FixedSource {
        fn query_window(&self, query: &str, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<NormalizedEvent>> {
            Ok(self
                .events
                .borrow()
                .iter()
                .filter(|e| simple_query_matches(query, e))
                .cloned()
                .collect())
        }
    }

    fn sequence_rule() -> CorrelationRule {
        CorrelationRule {
            id: "seq1".to_string(),
            name: "brute force then success".to_string(),
            description: None,
            kind: super::super::rules::CorrelationKind::Sequence,
            index_pattern: "*".to_string(),
            data_sources: vec![],
            severity: "high".to_string(),
            tags: vec![],
            mitre_tactics: vec![],
            mitre_techniques: vec![],
            realtime: true,
            config: CorrelationKindConfig::Sequence(super::super::rules::SequenceConfig {
                join_on: "user.name".to_string(),
                steps: vec![
                    super::super::rules::SequenceStep { query: "category:logon_failed".to_string(), order: 1 },
                    super::super::rules::SequenceStep { query: "category:logon_success".to_string(), order: 2 },
                ],
                window: "5m".to_string(),
            }),
        }
    }

    #[test]
    fn sequence_batch_requires_every_step() {
        let rule = sequence_rule();
        let base = Utc::now();
        let mut events = Vec::new();
        for i in 0..5 {
            events.push(event_with("bob", "logon_failed", base + chrono::Duration::seconds(i)));
        }
        events.push(event_with("bob", "logon_success", base + chrono::Duration::seconds(270)));
        let source = FixedSource { events: RefCell::new(events) };

        let matches = run_batch(&rule, &source, base + chrono::Duration::seconds(300)).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity_key, "user.name:bob");
        assert_eq!(matches[0].event_counts.get("1").copied(), Some(5));
        assert_eq!(matches[0].event_counts.get("2").copied(), Some(1));
    }

    #[test]
    fn sequence_realtime_completes_on_last_step() {
        let rule = sequence_rule();
        let store = CorrelationStateStore::open(":memory:").unwrap();
        let base = Utc::now();

        for i in 0..5 {
            let ev = event_with("bob", "logon_failed", base);
            let m = dispatch_realtime(&rule, &ev, &store, base + chrono::Duration::seconds(i)).unwrap();
            assert!(m.is_none());
        }
        let success = event_with("bob", "logon_success", base);
        let m = dispatch_realtime(&rule, &success, &store, base + chrono::Duration::seconds(270)).unwrap();
        assert!(m.is_some());
        let m = m.unwrap();
        assert_eq!(m.event_counts.get("1").copied(), Some(5));
        assert_eq!(m.event_counts.get("2").copied(), Some(1));
    }

    #[test]
    fn spike_detection_flags_ratio_over_threshold() {
        let rule = CorrelationRule {
            id: "spike1".to_string(),
            name: "login spike".to_string(),
            description: None,
            kind: super::super::rules::CorrelationKind::Spike,
            index_pattern: "*".to_string(),
            data_sources: vec![],
            severity: "high".to_string(),
            tags: vec![],
            mitre_tactics: vec![],
            mitre_techniques: vec![],
            realtime: false,
            config: CorrelationKindConfig::Spike(super::super::rules::SpikeConfig {
                query: "category:logon".to_string(),
                group_by: Some("host_name".to_string()),
                current_window: "1m".to_string(),
                baseline_window: "1h".to_string(),
                ratio_threshold: 3.0,
            }),
        };

        let base = Utc::now();
        let mut events = Vec::new();
        for i in 0..100 {
            let mut e = event_with("h1", "logon", base - chrono::Duration::seconds(i % 60));
            e.set_label("host_name", "h1");
            events.push(e);
        }
        for i in 0..60 {
            let mut e = event_with("h1", "logon", base - chrono::Duration::seconds(600 + i));
            e.set_label("host_name", "h1");
            events.push(e);
        }
        let source = FixedSource { events: RefCell::new(events) };

        let matches = run_batch(&rule, &source, base).unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].ratio.unwrap() >= 3.0);
    }
}
