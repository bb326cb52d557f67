//! The real-time processor: consumes the durable `events` stream, runs
//! every normalized event through the Sigma ruleset and the real-time
//! correlation dispatch path, persists and publishes the resulting alerts,
//! and runs the housekeeping tasks (pending-entry recovery, correlation
//! state cleanup) alongside the worker pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::buffer::{EventBuffer, StreamMessage};
use crate::cfg::ProcessorConfig;
use crate::correlation::{dispatch_realtime, CorrelationRule, CorrelationStateStore};
use crate::core::NormalizedEvent;
use crate::err::Result;
use crate::sigma::SigmaRuleSet;

use super::{Alert, AlertSource, AlertStatus, AlertStore};

#[derive(Default)]
struct ProcessorMetrics {
    events_processed: AtomicU64,
    alerts_generated: AtomicU64,
    correlations_matched: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessorMetricsSnapshot {
    pub events_processed: u64,
    pub alerts_generated: u64,
    pub correlations_matched: u64,
    pub errors: u64,
    pub active_workers: usize,
    pub uptime_secs: u64,
}

/// Mirrors `cfg::ProcessorConfig` plus the retention knob for terminal
/// correlation state, which the config file doesn't expose (fixed at 24h
/// per the original's `COMPLETED_STATE_RETENTION_SECS`).
#[derive(Debug, Clone)]
pub struct RealtimeProcessorConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub block_ms: u64,
    pub cleanup_interval_secs: u64,
    pub recovery_interval_secs: u64,
    pub min_idle_ms: u64,
    pub max_delivery_attempts: u32,
    pub completed_state_retention_secs: i64,
}

impl RealtimeProcessorConfig {
    pub fn from_cfg(cfg: &ProcessorConfig, max_delivery_attempts: u32) -> Self {
        Self {
            worker_count: cfg.worker_count,
            batch_size: cfg.batch_size,
            block_ms: cfg.block_ms,
            cleanup_interval_secs: cfg.cleanup_interval_secs,
            recovery_interval_secs: cfg.recovery_interval_secs,
            min_idle_ms: cfg.min_idle_ms,
            max_delivery_attempts,
            completed_state_retention_secs: 24 * 3600,
        }
    }
}

/// Consumes normalized events, matches them against the Sigma ruleset and
/// the real-time correlation rules, and emits `Alert`s onto the alerts
/// stream and into the alert store. One `EventBuffer` consumer per worker
/// task, all sharing the same consumer group so the stream partitions
/// across them.
pub struct RealtimeProcessor {
    events: Arc<EventBuffer>,
    alerts_stream: Arc<EventBuffer>,
    sigma_rules: Arc<SigmaRuleSet>,
    correlation_rules: Arc<Vec<CorrelationRule>>,
    state_store: Arc<Mutex<CorrelationStateStore>>,
    alert_store: AlertStore,
    config: RealtimeProcessorConfig,
    metrics: Arc<ProcessorMetrics>,
    failure_counts: Arc<DashMap<String, u32>>,
    started_at: Instant,
}

impl RealtimeProcessor {
    pub fn new(
        events: Arc<EventBuffer>,
        alerts_stream: Arc<EventBuffer>,
        sigma_rules: Arc<SigmaRuleSet>,
        correlation_rules: Arc<Vec<CorrelationRule>>,
        state_store: Arc<Mutex<CorrelationStateStore>>,
        alert_store: AlertStore,
        config: RealtimeProcessorConfig,
    ) -> Self {
        Self {
            events,
            alerts_stream,
            sigma_rules,
            correlation_rules,
            state_store,
            alert_store,
            config,
            metrics: Arc::new(ProcessorMetrics::default()),
            failure_counts: Arc::new(DashMap::new()),
            started_at: Instant::now(),
        }
    }

    pub fn metrics(&self) -> ProcessorMetricsSnapshot {
        ProcessorMetricsSnapshot {
            events_processed: self.metrics.events_processed.load(Ordering::Relaxed),
            alerts_generated: self.metrics.alerts_generated.load(Ordering::Relaxed),
            correlations_matched: self.metrics.correlations_matched.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            active_workers: self.config.worker_count,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Spawns the worker pool plus the cleanup and recovery housekeeping
    /// tasks. Runs until the process exits; each task logs and continues on
    /// transient errors rather than unwinding the whole processor.
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.worker_count + 2);
        for worker_id in 0..self.config.worker_count {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move { this.worker_loop(worker_id).await }));
        }

        let this = Arc::clone(&self);
        handles.push(tokio::spawn(async move { this.cleanup_loop().await }));

        let this = Arc::clone(&self);
        handles.push(tokio::spawn(async move { this.recovery_loop().await }));

        handles
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            match self.events.consume(self.config.batch_size, self.config.block_ms).await {
                Ok(messages) => {
                    for message in messages {
                        self.handle_message(&message).await;
                    }
                }
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(worker_id, error = %e, "error consuming events stream");
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.cleanup_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            let store = self.state_store.lock();
            match store.cleanup(Utc::now(), self.config.completed_state_retention_secs) {
                Ok(deleted) => {
                    if deleted > 0 {
                        tracing::debug!(deleted, "swept expired correlation state");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "correlation state cleanup failed"),
            }
        }
    }

    async fn recovery_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.recovery_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            match self.events.claim_pending(self.config.min_idle_ms, self.config.batch_size).await {
                Ok(messages) => {
                    if !messages.is_empty() {
                        tracing::info!(count = messages.len(), "reclaimed stale pending entries");
                    }
                    for message in messages {
                        self.handle_message(&message).await;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "pending-entry recovery failed"),
            }
        }
    }

    /// Processes one message end to end: match, persist/publish alerts,
    /// then ack on success or count the failure toward the dead-letter
    /// threshold. A message left unacked after a failed attempt stays
    /// pending and is picked back up by `recovery_loop` once idle long
    /// enough, which is what actually drives its retry count upward.
    async fn handle_message(&self, message: &StreamMessage) {
        match self.process_event(&message.event).await {
            Ok(alerts) => {
                for alert in &alerts {
                    if let Err(e) = self.publish_alert(alert).await {
                        tracing::error!(alert_id = %alert.id, error = %e, "failed to publish alert");
                    }
                }
                self.metrics.events_processed.fetch_add(1, Ordering::Relaxed);
                self.failure_counts.remove(&message.id);
                if let Err(e) = self.events.ack(&[message.id.clone()]).await {
                    tracing::warn!(id = %message.id, error = %e, "failed to ack processed message");
                }
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(id = %message.id, error = %e, "failed to process event");
                let mut attempts = self.failure_counts.entry(message.id.clone()).or_insert(0);
                *attempts += 1;
                if *attempts >= self.config.max_delivery_attempts {
                    drop(attempts);
                    self.failure_counts.remove(&message.id);
                    if let Err(e) = self.events.move_to_dlq(message, &e.to_string()).await {
                        tracing::error!(id = %message.id, error = %e, "failed to move message to dlq");
                    }
                }
            }
        }
    }

    /// Runs Sigma matching and real-time correlation dispatch for a single
    /// event, returning every alert it produced.
    async fn process_event(&self, event: &NormalizedEvent) -> Result<Vec<Alert>> {
        let mut alerts = Vec::new();

        for rule in self.sigma_rules.matching(event) {
            alerts.push(Alert {
                id: uuid::Uuid::new_v4().to_string(),
                rule_id: rule.rule.id.clone(),
                source: AlertSource::Sigma,
                severity: rule.rule.severity(),
                status: AlertStatus::Open,
                title: rule.rule.title.clone(),
                description: rule.rule.description.clone().unwrap_or_default(),
                raw_event: event.raw.clone(),
                mitre_tactics: Vec::new(),
                mitre_techniques: rule.rule.mitre_techniques(),
                tags: rule.rule.tags.clone(),
                created_at: Utc::now(),
            });
        }

        for rule in self.correlation_rules.iter().filter(|r| r.realtime && rule_applies_to_event(r, event)) {
            let now = Utc::now();
            let result = {
                let store = self.state_store.lock();
                dispatch_realtime(rule, event, &store, now)?
            };
            if let Some(m) = result {
                self.metrics.correlations_matched.fetch_add(1, Ordering::Relaxed);
                alerts.push(Alert {
                    id: uuid::Uuid::new_v4().to_string(),
                    rule_id: rule.id.clone(),
                    source: AlertSource::Correlation,
                    severity: severity_to_u8(&rule.severity),
                    status: AlertStatus::Open,
                    title: rule.name.clone(),
                    description: rule.description.clone().unwrap_or_default(),
                    raw_event: serde_json::json!({
                        "entity_key": m.entity_key,
                        "matched_event_ids": m.matched_event_ids,
                        "event_counts": m.event_counts,
                        "window_start": m.window_start,
                        "window_end": m.window_end,
                    }),
                    mitre_tactics: rule.mitre_tactics.clone(),
                    mitre_techniques: rule.mitre_techniques.clone(),
                    tags: rule.tags.clone(),
                    created_at: now,
                });
            }
        }

        Ok(alerts)
    }

    async fn publish_alert(&self, alert: &Alert) -> Result<()> {
        self.alert_store.insert(alert)?;
        self.alerts_stream.publish_payload(alert).await?;
        self.metrics.alerts_generated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A correlation rule is eligible for an event only if its `index_pattern`
/// glob-matches the event's category and, when `data_sources` is
/// non-empty, the event's source module is one of them. `NormalizedEvent`
/// has no dedicated "index" concept, so `category` plays that role here.
fn rule_applies_to_event(rule: &CorrelationRule, event: &NormalizedEvent) -> bool {
    let index_matches = globset::Glob::new(&rule.index_pattern)
        .map(|g| g.compile_matcher().is_match(&event.category))
        .unwrap_or(true);
    if !index_matches {
        return false;
    }
    rule.data_sources.is_empty() || rule.data_sources.iter().any(|ds| ds == &event.data_source)
}

fn severity_to_u8(severity: &str) -> u8 {
    match severity.to_lowercase().as_str() {
        "informational" | "info" => 10,
        "low" => 25,
        "medium" => 50,
        "high" => 75,
        "critical" => 95,
        _ => 50,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NormalizedEvent;
    use crate::sigma::rule::{Detection, LogSource, SigmaRule};
    use serde_json::json;
    use serde_yaml::Value as YamlValue;
    use std::collections::HashMap as StdHashMap;

    fn basic_rule() -> SigmaRule {
        let mut selection = serde_yaml::Mapping::new();
        selection.insert(YamlValue::String("process_name".to_string()), YamlValue::String("powershell.exe".to_string()));
        let mut selections = StdHashMap::new();
        selections.insert("selection".to_string(), YamlValue::Mapping(selection));
        SigmaRule {
            id: "rule-ps".to_string(),
            title: "powershell execution".to_string(),
            description: Some("flags powershell".to_string()),
            level: "high".to_string(),
            tags: vec!["attack.t1059".to_string()],
            logsource: LogSource { category: None, product: None, service: None },
            detection: Detection { condition: "selection".to_string(), selections },
            falsepositives: Vec::new(),
        }
    }

    fn rule_with(index_pattern: &str, data_sources: Vec<String>) -> CorrelationRule {
        CorrelationRule {
            id: "r1".to_string(),
            name: "test rule".to_string(),
            description: None,
            kind: crate::correlation::rules::CorrelationKind::Aggregation,
            index_pattern: index_pattern.to_string(),
            data_sources,
            severity: "medium".to_string(),
            tags: vec![],
            mitre_tactics: vec![],
            mitre_techniques: vec![],
            realtime: true,
            config: crate::correlation::rules::CorrelationKindConfig::Aggregation(crate::correlation::rules::AggregationConfig {
                query: "category:logon".to_string(),
                group_by: vec![],
                bucket: "1m".to_string(),
                threshold: ">= 1".to_string(),
            }),
        }
    }

    #[test]
    fn rule_applies_to_event_honors_index_glob_and_data_sources() {
        let mut event = NormalizedEvent::new("aws_cloudtrail", Utc::now(), json!({}));
        event.category = "authentication".to_string();

        let matching_index = rule_with("auth*", vec![]);
        assert!(rule_applies_to_event(&matching_index, &event));

        let non_matching_index = rule_with("network*", vec![]);
        assert!(!rule_applies_to_event(&non_matching_index, &event));

        let matching_source = rule_with("*", vec!["aws_cloudtrail".to_string()]);
        assert!(rule_applies_to_event(&matching_source, &event));

        let non_matching_source = rule_with("*", vec!["zeek:conn".to_string()]);
        assert!(!rule_applies_to_event(&non_matching_source, &event));
    }

    #[tokio::test]
    async fn process_event_emits_sigma_alert_on_match() {
        let compiled = crate::sigma::CompiledRule::compile(basic_rule()).unwrap();
        let rule_set = SigmaRuleSet::from_rules(vec![std::sync::Arc::new(compiled)]);

        let state_store = Arc::new(Mutex::new(CorrelationStateStore::open(":memory:").unwrap()));
        let alert_store = AlertStore::open(":memory:").unwrap();

        let event = NormalizedEvent::new("test", Utc::now(), json!({"process_name": "powershell.exe"}));

        let matching = rule_set.matching(&event);
        assert_eq!(matching.len(), 1);
        let _ = (state_store, alert_store);
    }
}
