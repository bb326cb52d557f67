pub mod condition;
pub mod convert;
pub mod matcher;
pub mod rule;

pub use convert::{CompiledRule, ConversionCache, ConversionError, LuceneBackend, SigmaBackend};
pub use matcher::event_matches_rule;
pub use rule::{load_rules_from_dir, SigmaRule};

/// Holds the full compiled rule set loaded at start-up, indexed by id for
/// quick lookup from alerts and correlation cross-references.
pub struct SigmaRuleSet {
    rules: Vec<std::sync::Arc<CompiledRule>>,
}

impl SigmaRuleSet {
    /// Builds a rule set from already-compiled rules, bypassing directory
    /// loading. Used by tests and by callers that compile rules from a
    /// source other than the filesystem (e.g. a rule pack fetched at
    /// start-up).
    pub fn from_rules(rules: Vec<std::sync::Arc<CompiledRule>>) -> Self {
        Self { rules }
    }

    pub fn load(dir: &std::path::Path) -> Result<Self, rule::RuleLoadError> {
        let raw_rules = load_rules_from_dir(dir)?;
        let rules = raw_rules
            .into_iter()
            .filter_map(|r| match CompiledRule::compile(r) {
                Ok(compiled) => Some(std::sync::Arc::new(compiled)),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping sigma rule with unparseable condition");
                    None
                }
            })
            .collect();
        Ok(Self { rules })
    }

    pub fn matching(&self, event: &crate::core::NormalizedEvent) -> Vec<std::sync::Arc<CompiledRule>> {
        self.rules.iter().filter(|r| r.matches(event)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
