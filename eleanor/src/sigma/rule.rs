//! Sigma rule document shape: a YAML detection rule with a `detection`
//! block of named search-identifiers, a `condition` expression combining
//! them, and metadata (level, tags, MITRE references) copied onto alerts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SigmaRule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub logsource: LogSource,
    pub detection: Detection,
    #[serde(default)]
    pub falsepositives: Vec<String>,
}

fn default_level() -> String {
    "medium".to_string()
}

impl SigmaRule {
    pub fn severity(&self) -> u8 {
        match self.level.as_str() {
            "informational" => 10,
            "low" => 25,
            "medium" => 50,
            "high" => 75,
            "critical" => 95,
            _ => 50,
        }
    }

    pub fn mitre_techniques(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(|t| t.strip_prefix("attack.t"))
            .map(|t| format!("T{}", t.to_uppercase()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogSource {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

/// The raw detection block: a map of search-identifier name to its
/// selection map (field -> value/values), plus the `condition` string.
/// Kept as a generic map here; `condition.rs` parses the condition
/// expression and `matcher.rs` evaluates named selections against events.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Detection {
    pub condition: String,
    #[serde(flatten)]
    pub selections: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleLoadError {
    #[error("duplicate rule id: {0}")]
    DuplicateId(String),
    #[error("yaml parse error in {file}: {source}")]
    Parse { file: String, source: serde_yaml::Error },
}

/// Loads every `.yml`/`.yaml` file in a directory as a Sigma rule.
/// A file that fails to parse is logged and skipped rather than aborting
/// the whole load; a duplicate rule id across files is rejected.
pub fn load_rules_from_dir(dir: &std::path::Path) -> Result<Vec<SigmaRule>, RuleLoadError> {
    let mut rules = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(rules),
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_yaml = path.extension().and_then(|e| e.to_str()).map(|e| e == "yml" || e == "yaml").unwrap_or(false);
        if !is_yaml {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping unreadable sigma rule file");
                continue;
            }
        };
        let rule: SigmaRule = match serde_yaml::from_str(&content) {
            Ok(rule) => rule,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping malformed sigma rule file");
                continue;
            }
        };
        if !seen_ids.insert(rule.id.clone()) {
            return Err(RuleLoadError::DuplicateId(rule.id));
        }
        rules.push(rule);
    }

    Ok(rules)
}
