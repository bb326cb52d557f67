//! Correlation rule document shape: four pattern types dispatched by
//! `kind`, grounded on `correlation_engine.py`'s rule schema.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorrelationRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: CorrelationKind,
    pub index_pattern: String,
    #[serde(default)]
    pub data_sources: Vec<String>,
    pub severity: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mitre_tactics: Vec<String>,
    #[serde(default)]
    pub mitre_techniques: Vec<String>,
    /// Whether this rule should also be dispatched on the real-time,
    /// per-event path in addition to (or instead of) the periodic batch
    /// execution cycle.
    #[serde(default)]
    pub realtime: bool,
    pub config: CorrelationKindConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKind {
    Sequence,
    TemporalJoin,
    Aggregation,
    Spike,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorrelationKindConfig {
    Sequence(SequenceConfig),
    TemporalJoin(TemporalJoinConfig),
    Aggregation(AggregationConfig),
    Spike(SpikeConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SequenceConfig {
    pub join_on: String,
    pub steps: Vec<SequenceStep>,
    pub window: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SequenceStep {
    pub query: String,
    pub order: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemporalJoinConfig {
    pub query_a: String,
    pub query_b: String,
    pub join_on: String,
    pub window: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationConfig {
    pub query: String,
    pub group_by: Vec<String>,
    pub bucket: String,
    pub threshold: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpikeConfig {
    pub query: String,
    pub group_by: Option<String>,
    pub current_window: String,
    pub baseline_window: String,
    pub ratio_threshold: f64,
}
