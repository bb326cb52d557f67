//! Cross-module integration tests exercising concrete end-to-end scenarios
//! through the crate's public API, as opposed to the per-module unit tests
//! that already cover individual functions in isolation.

use std::collections::HashMap as StdHashMap;

use eleanor::core::{NormalizedEvent, RawEvent};
use eleanor::correlation::rules::{CorrelationKind, CorrelationKindConfig, SequenceConfig, SequenceStep};
use eleanor::correlation::{dispatch_realtime, CorrelationRule, CorrelationStateStore};
use eleanor::parsers::cef::CefParser;
use eleanor::parsers::Parser;
use eleanor::sigma::{CompiledRule, SigmaRuleSet};
use eleanor::sigma::rule::{Detection, LogSource, SigmaRule};

use chrono::Utc;
use serde_yaml::Value as YamlValue;
use tokio_stream::StreamExt;

/// A single CEF line parses into a NormalizedEvent with the documented
/// field mapping and severity.
#[tokio::test]
async fn cef_line_parses_into_normalized_event() {
    let parser = CefParser::default();
    let line = "CEF:0|Vendor|Product|1.0|100|User logon|3|src=10.1.1.1 spt=443 suser=alice msg=Login successful";
    let raw = RawEvent::new("test-source", "cef-feed", 1, line.as_bytes().to_vec());

    let mut stream = parser.parse(raw);
    let event = stream.next().await.expect("one event").expect("event parses");

    assert_eq!(event.source_ip.as_deref(), Some("10.1.1.1"));
    assert_eq!(event.source_port, Some(443));
    assert_eq!(event.user_name.as_deref(), Some("alice"));
    assert_eq!(event.severity, 30);
    assert_eq!(event.labels.get("device_vendor").map(String::as_str), Some("Vendor"));
    assert_eq!(event.message.as_deref(), Some("Login successful"));
}

/// A Sigma rule compiled at runtime matches the event the CEF parser just
/// produced, exercising the parser -> normalized event -> Sigma pipeline
/// hand-off as a single flow rather than two isolated unit tests.
#[tokio::test]
async fn parsed_cef_event_matches_a_compiled_sigma_rule() {
    let parser = CefParser::default();
    let line = "CEF:0|Acme|Gateway|2.1|5001|Brute force login|8|src=10.1.1.1 suser=alice act=logon_failed";
    let raw = RawEvent::new("test-source", "cef-feed", 1, line.as_bytes().to_vec());
    let event = parser.parse(raw).next().await.unwrap().unwrap();

    let mut selection = serde_yaml::Mapping::new();
    selection.insert(YamlValue::String("action".to_string()), YamlValue::String("logon_failed".to_string()));
    let mut selections = StdHashMap::new();
    selections.insert("selection".to_string(), YamlValue::Mapping(selection));

    let rule = SigmaRule {
        id: "brute-force-attempt".to_string(),
        title: "Possible brute force login".to_string(),
        description: Some("Flags failed logon attempts".to_string()),
        level: "high".to_string(),
        tags: vec!["attack.t1110".to_string()],
        logsource: LogSource { category: Some("authentication".to_string()), product: None, service: None },
        detection: Detection { condition: "selection".to_string(), selections },
        falsepositives: Vec::new(),
    };
    let compiled = CompiledRule::compile(rule).unwrap();
    let rule_set = SigmaRuleSet::from_rules(vec![std::sync::Arc::new(compiled)]);

    let matches = rule_set.matching(&event);
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].rule.id, "brute-force-attempt");
    assert_eq!(matches[0].rule.mitre_techniques(), vec!["T1110".to_string()]);
}

/// Five logon_failed events then one logon_success within the window,
/// joined on user, produce exactly one sequence match carrying the
/// per-step counts and the expected entity key.
#[test]
fn sequence_correlation_matches_real_world_scenario_2() {
    let rule = CorrelationRule {
        id: "seq-brute-then-success".to_string(),
        name: "brute force then success".to_string(),
        description: None,
        kind: CorrelationKind::Sequence,
        index_pattern: "*".to_string(),
        data_sources: vec![],
        severity: "high".to_string(),
        tags: vec![],
        mitre_tactics: vec![],
        mitre_techniques: vec![],
        realtime: true,
        config: CorrelationKindConfig::Sequence(SequenceConfig {
            join_on: "user.name".to_string(),
            steps: vec![
                SequenceStep { query: "category:logon_failed".to_string(), order: 1 },
                SequenceStep { query: "category:logon_success".to_string(), order: 2 },
            ],
            window: "5m".to_string(),
        }),
    };

    let store = CorrelationStateStore::open(":memory:").unwrap();
    let base = Utc::now();

    let mut last_match = None;
    for i in 0..5 {
        let mut event = NormalizedEvent::new("test", base + chrono::Duration::minutes(i), serde_json::json!({}));
        event.category = "logon_failed".to_string();
        // A real CEF-sourced event carries this as the flat `user_name`
        // field (see `parsers::cef`), not a `user.name` label; the join
        // resolves the rule's ECS-dotted `user.name` to it via
        // `NormalizedEvent::get_field`'s dotted-alias lookup.
        event.user_name = Some("bob".to_string());
        last_match = dispatch_realtime(&rule, &event, &store, base + chrono::Duration::minutes(i)).unwrap();
        assert!(last_match.is_none());
    }

    let mut success = NormalizedEvent::new("test", base + chrono::Duration::seconds(270), serde_json::json!({}));
    success.category = "logon_success".to_string();
    success.user_name = Some("bob".to_string());
    let matched = dispatch_realtime(&rule, &success, &store, base + chrono::Duration::seconds(270)).unwrap();

    let m = matched.expect("sequence should complete on the success event");
    assert_eq!(m.entity_key, "user.name:bob");
    assert_eq!(m.event_counts.get("1").copied(), Some(5));
    assert_eq!(m.event_counts.get("2").copied(), Some(1));
    let _ = last_match;
}
