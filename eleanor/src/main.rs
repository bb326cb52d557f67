//! Eleanor's composition root: wires the parser registry, connectors,
//! Sigma ruleset, correlation rules, event buffer, and playbook engine
//! once at start-up and runs the real-time processor until signalled to
//! stop.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::signal;

use eleanor::cfg::EleanorConfig;
use eleanor::correlation::{CorrelationRule, CorrelationStateStore};
use eleanor::evidence::{EvidenceService, FsObjectStore};
use eleanor::playbook::{ActionRegistry, PlaybookEngine, PlaybookStore};
use eleanor::processor::{AlertStore, RealtimeProcessor, RealtimeProcessorConfig};
use eleanor::sigma::{ConversionCache, LuceneBackend, SigmaBackend, SigmaRuleSet};

#[derive(Parser)]
#[command(name = "eleanor", author, version, about = "DFIR/SIEM core engineering platform", long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the real-time processor: consumes the events stream, emits alerts.
    Run {
        /// Directory of Sigma rule YAML files.
        #[arg(long, default_value = "rules/sigma")]
        sigma_dir: PathBuf,

        /// Path to a correlation rules YAML/JSON document.
        #[arg(long)]
        correlation_rules: Option<PathBuf>,
    },
    /// Validate configuration and rule files without starting the processor.
    Validate {
        #[arg(long, default_value = "rules/sigma")]
        sigma_dir: PathBuf,
    },
    /// Render a loaded Sigma rule to a backend query string (e.g. Lucene).
    Convert {
        #[arg(long, default_value = "rules/sigma")]
        sigma_dir: PathBuf,
        /// Rule id to convert.
        rule_id: String,
        /// Target backend. Only "lucene" is currently implemented.
        #[arg(long, default_value = "lucene")]
        backend: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eleanor::logging::init();

    let cli = Cli::parse();
    let cfg = EleanorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { sigma_dir, correlation_rules } => run(cfg, &sigma_dir, correlation_rules.as_deref()).await,
        Commands::Validate { sigma_dir } => validate(&sigma_dir),
        Commands::Convert { sigma_dir, rule_id, backend } => convert(&sigma_dir, &rule_id, &backend),
    }
}

fn validate(sigma_dir: &std::path::Path) -> anyhow::Result<()> {
    let rules = SigmaRuleSet::load(sigma_dir)?;
    tracing::info!(count = rules.len(), "sigma rules loaded successfully");
    Ok(())
}

fn convert(sigma_dir: &std::path::Path, rule_id: &str, backend: &str) -> anyhow::Result<()> {
    let rules = eleanor::sigma::load_rules_from_dir(sigma_dir)?;
    let rule = rules
        .into_iter()
        .find(|r| r.id == rule_id)
        .ok_or_else(|| anyhow::anyhow!("no sigma rule with id {rule_id} under {}", sigma_dir.display()))?;

    let backend_impl: &dyn SigmaBackend = match backend {
        "lucene" => &LuceneBackend,
        other => anyhow::bail!("unsupported conversion backend: {other}"),
    };

    let cache = ConversionCache::new();
    let query = cache.convert(&rule, backend_impl)?;
    println!("{query}");
    Ok(())
}

async fn run(cfg: EleanorConfig, sigma_dir: &std::path::Path, correlation_rules_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let sigma_rules = Arc::new(SigmaRuleSet::load(sigma_dir)?);
    tracing::info!(count = sigma_rules.len(), "loaded sigma rules");

    let correlation_rules: Vec<CorrelationRule> = match correlation_rules_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        }
        None => Vec::new(),
    };
    tracing::info!(count = correlation_rules.len(), "loaded correlation rules");

    let state_store = Arc::new(Mutex::new(CorrelationStateStore::open(&cfg.sqlite.path)?));
    let alert_store = AlertStore::open(&cfg.sqlite.path)?;

    let events = Arc::new(
        eleanor::buffer::EventBuffer::connect(
            &cfg.redis.url,
            cfg.redis.events_stream.clone(),
            cfg.redis.consumer_group.clone(),
            format!("eleanor-{}", uuid::Uuid::new_v4()),
            &cfg.redis.dlq_suffix,
            cfg.redis.max_delivery_attempts,
        )
        .await?,
    );
    let alerts_stream = Arc::new(
        eleanor::buffer::EventBuffer::connect(
            &cfg.redis.url,
            cfg.redis.alerts_stream.clone(),
            cfg.redis.consumer_group.clone(),
            format!("eleanor-{}", uuid::Uuid::new_v4()),
            &cfg.redis.dlq_suffix,
            cfg.redis.max_delivery_attempts,
        )
        .await?,
    );

    let processor_config = RealtimeProcessorConfig::from_cfg(&cfg.processor, cfg.redis.max_delivery_attempts);
    let processor = Arc::new(RealtimeProcessor::new(
        events,
        alerts_stream,
        sigma_rules,
        Arc::new(correlation_rules),
        state_store,
        alert_store,
        processor_config,
    ));

    // Evidence and playbook collaborators are wired but not yet driven by
    // an external trigger source in this binary; they're exercised through
    // the library's public API by embedding services.
    let object_store = FsObjectStore::new(cfg.evidence.storage_dir.as_str());
    let _evidence = EvidenceService::open(object_store, &cfg.sqlite.path)?;

    let playbook_store = PlaybookStore::open(&cfg.sqlite.path)?;
    let _playbook_engine = PlaybookEngine::new(playbook_store, ActionRegistry::new());

    let handles = processor.spawn();
    tracing::info!(workers = handles.len(), "eleanor real-time processor started");

    signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
