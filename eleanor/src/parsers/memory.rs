//! Memory-image parser. Unlike the other parsers, this one does not parse
//! its `RawEvent` bytes directly — the body carries a path to a memory
//! image, and the parser shells out to an external `vol` (Volatility 3)
//! process to run a plugin (`windows.pslist`, `windows.netscan`, ...) and
//! parses its JSON-lines output. Kept as a capability behind the same
//! `Parser` trait so the registry dispatches to it like any other format;
//! the external-process boundary is isolated to `run_volatility`.

use std::process::Stdio;

use async_stream::try_stream;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::core::{NormalizedEvent, RawEvent};
use crate::err::EleanorError;

use super::{EventStream, Parser, ParserCategory};

#[derive(Default)]
pub struct MemoryParser {
    /// Path to the `vol` binary; overridable for testing.
    volatility_bin: Option<String>,
}

impl MemoryParser {
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            volatility_bin: Some(path.into()),
        }
    }

    fn binary(&self) -> &str {
        self.volatility_bin.as_deref().unwrap_or("vol")
    }
}

fn build_event_from_pslist_row(row: &Value) -> NormalizedEvent {
    let mut event = NormalizedEvent::new("memory", chrono::Utc::now(), row.clone());
    event.category = "process".to_string();
    event.process_name = row.get("ImageFileName").and_then(Value::as_str).map(str::to_string);
    event.set_label("pid", row.get("PID").map(|v| v.to_string()).unwrap_or_default());
    event.set_label("ppid", row.get("PPID").map(|v| v.to_string()).unwrap_or_default());
    event.message = Some(format!(
        "process {} (pid {})",
        event.process_name.clone().unwrap_or_default(),
        row.get("PID").map(|v| v.to_string()).unwrap_or_default()
    ));
    event
}

#[async_trait]
impl Parser for MemoryParser {
    fn category(&self) -> ParserCategory {
        ParserCategory::Memory
    }

    fn sniff(&self, sample: &[u8]) -> bool {
        sample.starts_with(b"PMDL") || sample.starts_with(b"PAGEDU") || sample.starts_with(b"\x50\x41\x47\x45")
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["raw", "mem", "dmp", "vmem"]
    }

    fn parse(&self, raw: RawEvent) -> EventStream {
        let binary = self.binary().to_string();
        Box::pin(try_stream! {
            let image_path = raw.as_str().map_err(|e| EleanorError::malformed_source(raw.source.clone(), e))?.trim().to_string();

            let mut child = Command::new(&binary)
                .args(["-f", &image_path, "-r", "json", "windows.pslist"])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| EleanorError::transient(format!("failed to spawn volatility: {e}")))?;

            let stdout = child.stdout.take().ok_or_else(|| EleanorError::transient("volatility produced no stdout"))?;
            let mut lines = BufReader::new(stdout).lines();

            while let Some(line) = lines.next_line().await.map_err(|e| EleanorError::transient(e.to_string()))? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(row) => {
                        let mut event = build_event_from_pslist_row(&row);
                        event.data_source = raw.data_source.clone();
                        yield event;
                    }
                    Err(e) => {
                        tracing::warn!(source = %raw.source, error = %e, "skipping unparseable volatility output line");
                    }
                }
            }

            let status = child.wait().await.map_err(|e| EleanorError::transient(e.to_string()))?;
            if !status.success() {
                Err(EleanorError::permanent(format!("volatility exited with status {status}")))?;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_event_from_row() {
        let row = json!({"PID": 4, "PPID": 0, "ImageFileName": "System"});
        let event = build_event_from_pslist_row(&row);
        assert_eq!(event.process_name.as_deref(), Some("System"));
    }
}
