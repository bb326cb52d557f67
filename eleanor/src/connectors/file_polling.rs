//! A `PollingConnector` over a directory of log files: tracks a read
//! offset per file so repeated polls only return newly-appended lines
//! (tailing behavior), and applies `should_include` glob filtering to
//! decide which files under the watched directory are ingested at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use walkdir::WalkDir;

use crate::core::RawEvent;
use crate::err::{EleanorError, Result};

use super::{should_include, Connector, ConnectorConfig, ConnectorMetrics, ConnectorState, PollingConnector};

fn state_from_u8(v: u8) -> ConnectorState {
    match v {
        0 => ConnectorState::Stopped,
        1 => ConnectorState::Starting,
        2 => ConnectorState::Running,
        3 => ConnectorState::Stopping,
        4 => ConnectorState::Error,
        _ => ConnectorState::Paused,
    }
}

fn u8_from_state(s: ConnectorState) -> u8 {
    match s {
        ConnectorState::Stopped => 0,
        ConnectorState::Starting => 1,
        ConnectorState::Running => 2,
        ConnectorState::Stopping => 3,
        ConnectorState::Error => 4,
        ConnectorState::Paused => 5,
    }
}

pub struct FilePollingConnector {
    name: String,
    root: PathBuf,
    data_source: String,
    config: ConnectorConfig,
    state: AtomicU8,
    metrics: Arc<ConnectorMetrics>,
    offsets: Mutex<HashMap<PathBuf, u64>>,
}

impl FilePollingConnector {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, data_source: impl Into<String>, config: ConnectorConfig) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            data_source: data_source.into(),
            config,
            state: AtomicU8::new(u8_from_state(ConnectorState::Stopped)),
            metrics: Arc::new(ConnectorMetrics::default()),
            offsets: Mutex::new(HashMap::new()),
        }
    }

    fn discover_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .filter(|p| {
                let rel = p.strip_prefix(&self.root).unwrap_or(p).to_string_lossy().to_string();
                if should_include(&self.config, &rel) {
                    true
                } else {
                    self.metrics.records_excluded.fetch_add(1, Ordering::Relaxed);
                    false
                }
            })
            .collect()
    }

    async fn read_new_lines(&self, path: &Path) -> Result<Vec<RawEvent>> {
        let mut file = tokio::fs::File::open(path).await.map_err(EleanorError::Io)?;
        let start_offset = {
            let offsets = self.offsets.lock();
            *offsets.get(path).unwrap_or(&0)
        };

        file.seek(std::io::SeekFrom::Start(start_offset)).await.map_err(EleanorError::Io)?;

        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut bytes_read: u64 = 0;
        let mut line_no = 0u64;

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.map_err(EleanorError::Io)?;
            if n == 0 {
                break;
            }
            bytes_read += n as u64;
            line_no += 1;
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                events.push(RawEvent::new(
                    path.to_string_lossy().to_string(),
                    self.data_source.clone(),
                    line_no,
                    trimmed.as_bytes().to_vec(),
                ));
            }
        }

        self.offsets.lock().insert(path.to_path_buf(), start_offset + bytes_read);
        self.metrics.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.metrics.records_read.fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(events)
    }
}

#[async_trait]
impl Connector for FilePollingConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectorState {
        state_from_u8(self.state.load(Ordering::Relaxed))
    }

    fn metrics(&self) -> Arc<ConnectorMetrics> {
        self.metrics.clone()
    }

    async fn start(&self) -> Result<()> {
        self.state.store(u8_from_state(ConnectorState::Starting), Ordering::Relaxed);
        if !self.root.exists() {
            self.state.store(u8_from_state(ConnectorState::Error), Ordering::Relaxed);
            return Err(EleanorError::malformed_source(self.root.display().to_string(), "watched directory does not exist"));
        }
        self.state.store(u8_from_state(ConnectorState::Running), Ordering::Relaxed);
        tracing::info!(connector = %self.name, root = %self.root.display(), "file polling connector started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.store(u8_from_state(ConnectorState::Stopping), Ordering::Relaxed);
        self.state.store(u8_from_state(ConnectorState::Stopped), Ordering::Relaxed);
        tracing::info!(connector = %self.name, "file polling connector stopped");
        Ok(())
    }
}

#[async_trait]
impl PollingConnector for FilePollingConnector {
    async fn poll_once(&self) -> Result<Vec<RawEvent>> {
        if self.state() != ConnectorState::Running {
            return Ok(Vec::new());
        }
        let mut all_events = Vec::new();
        for path in self.discover_files() {
            match self.read_new_lines(&path).await {
                Ok(mut events) => all_events.append(&mut events),
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(connector = %self.name, file = %path.display(), error = %e, "failed to poll file");
                }
            }
        }
        Ok(all_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn poll_once_returns_only_new_lines_on_repeat_calls() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.log");
        {
            let mut f = std::fs::File::create(&file_path).unwrap();
            writeln!(f, "line1").unwrap();
            writeln!(f, "line2").unwrap();
        }

        let connector = FilePollingConnector::new("test", dir.path(), "apache", ConnectorConfig::default());
        connector.start().await.unwrap();

        let first = connector.poll_once().await.unwrap();
        assert_eq!(first.len(), 2);

        let second = connector.poll_once().await.unwrap();
        assert_eq!(second.len(), 0);

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&file_path).unwrap();
            writeln!(f, "line3").unwrap();
        }

        let third = connector.poll_once().await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].as_str().unwrap(), "line3");
    }
}
