//! A `StreamingConnector` over newline-delimited TCP: accepts connections,
//! reads one line per record, and hands them off through an internal
//! channel rather than returning from a single call, matching the
//! push-driven half of the connector framework.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::core::RawEvent;
use crate::err::{EleanorError, Result};

use super::{should_include, Connector, ConnectorConfig, ConnectorMetrics, ConnectorState, StreamingConnector};

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

/// Accepts TCP connections on `bind_addr`, treats each connection as a
/// stream of newline-delimited records from one source, and forwards
/// them onto an internal channel that `next_batch` drains. Each accepted
/// line is acknowledged on the wire so a well-behaved sender knows the
/// connector is keeping up.
pub struct TcpStreamConnector {
    name: String,
    bind_addr: String,
    data_source: String,
    config: ConnectorConfig,
    state: AtomicU8,
    metrics: Arc<ConnectorMetrics>,
    sender: mpsc::Sender<RawEvent>,
    receiver: Mutex<mpsc::Receiver<RawEvent>>,
    accept_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TcpStreamConnector {
    pub fn new(name: impl Into<String>, bind_addr: impl Into<String>, data_source: impl Into<String>, config: ConnectorConfig) -> Self {
        let (sender, receiver) = mpsc::channel(1024);
        Self {
            name: name.into(),
            bind_addr: bind_addr.into(),
            data_source: data_source.into(),
            config,
            state: AtomicU8::new(u8_from_state(ConnectorState::Stopped)),
            metrics: Arc::new(ConnectorMetrics::default()),
            sender,
            receiver: Mutex::new(receiver),
            accept_handle: Mutex::new(None),
        }
    }

    async fn accept_loop(bind_addr: String, sender: mpsc::Sender<RawEvent>, metrics: Arc<ConnectorMetrics>, data_source: String, config: ConnectorConfig) {
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(bind_addr = %bind_addr, error = %e, "tcp streaming connector failed to bind");
                return;
            }
        };
        tracing::info!(bind_addr = %bind_addr, "tcp streaming connector listening");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let sender = sender.clone();
                    let metrics = Arc::clone(&metrics);
                    let data_source = data_source.clone();
                    let config = config.clone();
                    let source_ip = addr.ip().to_string();
                    tokio::spawn(async move {
                        Self::handle_connection(stream, source_ip, sender, metrics, data_source, config).await;
                    });
                }
                Err(e) => {
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "failed to accept tcp connection");
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: tokio::net::TcpStream,
        source_ip: String,
        sender: mpsc::Sender<RawEvent>,
        metrics: Arc<ConnectorMetrics>,
        data_source: String,
        config: ConnectorConfig,
    ) {
        if stream.write_all(b"eleanor-ack: ready\n").await.is_err() {
            return;
        }
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line_no = 0u64;

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(n) => {
                    line_no += 1;
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    if !should_include(&config, &source_ip) {
                        metrics.records_excluded.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    metrics.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    let event = RawEvent::new(source_ip.clone(), data_source.clone(), line_no, trimmed.as_bytes().to_vec());
                    if sender.send(event).await.is_err() {
                        break;
                    }
                    metrics.records_read.fetch_add(1, Ordering::Relaxed);
                    if write_half.write_all(b"ack\n").await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(source = %source_ip, error = %e, "tcp streaming connector read error");
                    break;
                }
            }
        }
        tracing::debug!(source = %source_ip, "tcp streaming connection closed");
    }
}

#[async_trait]
impl Connector for TcpStreamConnector {
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
        let mut handle_slot = self.accept_handle.lock();
        if handle_slot.is_some() {
            self.state.store(u8_from_state(ConnectorState::Running), Ordering::Relaxed);
            return Ok(());
        }
        let bind_addr = self.bind_addr.clone();
        let sender = self.sender.clone();
        let metrics = Arc::clone(&self.metrics);
        let data_source = self.data_source.clone();
        let config = self.config.clone();
        *handle_slot = Some(tokio::spawn(Self::accept_loop(bind_addr, sender, metrics, data_source, config)));
        self.state.store(u8_from_state(ConnectorState::Running), Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.store(u8_from_state(ConnectorState::Stopping), Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.lock().take() {
            handle.abort();
        }
        self.state.store(u8_from_state(ConnectorState::Stopped), Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl StreamingConnector for TcpStreamConnector {
    /// Drains whatever records have arrived on the internal channel since
    /// the last call, waiting for at least one if the channel is empty.
    async fn next_batch(&self) -> Result<Vec<RawEvent>> {
        if self.state() != ConnectorState::Running {
            return Ok(Vec::new());
        }
        let mut receiver = self.receiver.lock();
        let mut out = Vec::new();
        match receiver.recv().await {
            Some(event) => out.push(event),
            None => return Err(EleanorError::invalid_state("tcp streaming connector channel closed")),
        }
        while let Ok(event) = receiver.try_recv() {
            out.push(event);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepted_connection_delivers_lines_through_next_batch() {
        // Bind to an ephemeral port by resolving it first, since the accept
        // loop owns the listener and we need the real port for the client.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = Arc::new(TcpStreamConnector::new("test-tcp", addr.to_string(), "custom:tcp", ConnectorConfig::default()));
        connector.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut greeting = [0u8; 64];
        let n = client.read(&mut greeting).await.unwrap();
        assert!(String::from_utf8_lossy(&greeting[..n]).contains("ready"));

        client.write_all(b"hello world\n").await.unwrap();

        let batch = connector.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].as_str().unwrap(), "hello world");

        connector.stop().await.unwrap();
    }
}
