//! Content-addressed object storage behind a single operation set:
//! upload/exists/stream_download/delete/compute_hashes/get_download_url/
//! get_stats/health_check, minus the HTTP/auth layer.
//!
//! `FsObjectStore` is a local-filesystem implementation. The `ObjectStore`
//! trait is the contract; a filesystem backend is the natural embedded
//! default for a single-node core library, with the trait leaving room
//! for an S3/MinIO implementation outside this crate.

use std::collections::HashSet;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest as _Md5Digest, Md5};
use parking_lot::Mutex;
use sha1::{Digest as _Sha1Digest, Sha1};
use sha2::{Digest as _Sha256Digest, Sha256};
use tokio::io::AsyncRead;
use tokio_stream::Stream;

use crate::err::{EleanorError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTriplet {
    pub sha256: String,
    pub sha1: String,
    pub md5: String,
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub size: u64,
    pub hashes: HashTriplet,
    pub storage_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub object_count: u64,
    pub total_bytes: u64,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// The evidence byte-storage boundary. `key` is caller-chosen at upload
/// time (the evidence service uses the evidence id); the canonical
/// content identity is always the returned `sha256`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, key: &str, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<UploadResult>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn stream_download(&self, key: &str) -> Result<ByteStream>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn compute_hashes(&self, key: &str) -> Result<HashTriplet>;
    fn get_download_url(&self, key: &str, expires_in_secs: u64, filename: Option<&str>) -> String;
    async fn get_stats(&self, prefix: Option<&str>) -> Result<StoreStats>;
    async fn health_check(&self) -> Result<()>;
}

pub struct FsObjectStore {
    root: PathBuf,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn begin_upload(&self, key: &str) -> Result<()> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(key.to_string()) {
            return Err(EleanorError::invalid_state(format!("concurrent upload to key {key} rejected")));
        }
        Ok(())
    }

    fn end_upload(&self, key: &str) {
        self.in_flight.lock().remove(key);
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    /// Single streaming pass over the bytes computes all three hashes and
    /// writes to disk simultaneously — the three digests come from one
    /// pass, not three re-reads.
    async fn upload(&self, key: &str, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<UploadResult> {
        use tokio::io::AsyncReadExt;

        self.begin_upload(key)?;
        let result = async {
            tokio::fs::create_dir_all(&self.root).await?;
            let path = self.path_for(key);
            let tmp_path = path.with_extension("tmp-upload");
            let mut out = tokio::fs::File::create(&tmp_path).await?;

            let mut sha256 = Sha256::new();
            let mut sha1 = Sha1::new();
            let mut md5 = Md5::new();
            let mut size: u64 = 0;
            let mut buf = [0u8; 64 * 1024];

            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sha256.update(&buf[..n]);
                sha1.update(&buf[..n]);
                md5.update(&buf[..n]);
                size += n as u64;
                tokio::io::AsyncWriteExt::write_all(&mut out, &buf[..n]).await?;
            }
            tokio::io::AsyncWriteExt::flush(&mut out).await?;
            drop(out);
            tokio::fs::rename(&tmp_path, &path).await?;

            let hashes = HashTriplet {
                sha256: hex::encode(sha256.finalize()),
                sha1: hex::encode(sha1.finalize()),
                md5: hex::encode(md5.finalize()),
            };
            Ok(UploadResult {
                size,
                storage_url: self.get_download_url(key, 3600, None),
                hashes,
            })
        }
        .await;
        self.end_upload(key);
        result
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.path_for(key)).await.is_ok())
    }

    async fn stream_download(&self, key: &str) -> Result<ByteStream> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(EleanorError::invalid_state(format!("object {key} not found")));
        }
        let file = tokio::fs::File::open(path).await.map_err(EleanorError::Io)?;
        let stream = tokio_util::io::ReaderStream::new(file);
        let mapped = tokio_stream::StreamExt::map(stream, |chunk| chunk.map_err(EleanorError::Io));
        Ok(Box::pin(mapped))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EleanorError::Io(e)),
        }
    }

    /// Recomputes all three hashes by re-reading the stored bytes, used by
    /// `verify` to detect bit-rot or tampering independent of the
    /// originally-recorded hashes.
    async fn compute_hashes(&self, key: &str) -> Result<HashTriplet> {
        use tokio::io::AsyncReadExt;
        let path = self.path_for(key);
        let mut file = tokio::fs::File::open(&path).await.map_err(EleanorError::Io)?;
        let mut sha256 = Sha256::new();
        let mut sha1 = Sha1::new();
        let mut md5 = Md5::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await.map_err(EleanorError::Io)?;
            if n == 0 {
                break;
            }
            sha256.update(&buf[..n]);
            sha1.update(&buf[..n]);
            md5.update(&buf[..n]);
        }
        Ok(HashTriplet {
            sha256: hex::encode(sha256.finalize()),
            sha1: hex::encode(sha1.finalize()),
            md5: hex::encode(md5.finalize()),
        })
    }

    fn get_download_url(&self, key: &str, expires_in_secs: u64, filename: Option<&str>) -> String {
        let name = filename.unwrap_or(key);
        format!("file://{}/{key}?expires_in={expires_in_secs}&filename={name}", self.root.display())
    }

    async fn get_stats(&self, prefix: Option<&str>) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        let scan_root = match prefix {
            Some(p) => self.root.join(p),
            None => self.root.clone(),
        };
        if !scan_root.exists() {
            return Ok(stats);
        }
        for entry in walkdir::WalkDir::new(&scan_root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                stats.object_count += 1;
                stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(EleanorError::Io)?;
        let probe = self.root.join(".health");
        tokio::fs::write(&probe, b"ok").await.map_err(EleanorError::Io)?;
        tokio::fs::remove_file(&probe).await.map_err(EleanorError::Io)?;
        Ok(())
    }
}

pub fn hash_bytes(data: &[u8]) -> HashTriplet {
    HashTriplet {
        sha256: hex::encode(Sha256::digest(data)),
        sha1: hex::encode(Sha1::digest(data)),
        md5: hex::encode(Md5::digest(data)),
    }
}

pub fn sniff_hash_algorithm(hash: &str) -> Option<&'static str> {
    match hash.len() {
        32 => Some("md5"),
        40 => Some("sha1"),
        64 => Some("sha256"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_is_idempotent_and_streaming_matches_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let data = vec![0x42u8; 1024 * 1024];

        let mut reader = std::io::Cursor::new(data.clone());
        let result = store.upload("obj1", &mut reader).await.unwrap();
        assert_eq!(result.size, data.len() as u64);

        let buffered = hash_bytes(&data);
        assert_eq!(result.hashes, buffered);

        let recomputed = store.compute_hashes("obj1").await.unwrap();
        assert_eq!(recomputed, result.hashes);
    }

    #[tokio::test]
    async fn concurrent_upload_to_same_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        store.begin_upload("obj1").unwrap();
        assert!(store.begin_upload("obj1").is_err());
        store.end_upload("obj1");
        assert!(store.begin_upload("obj1").is_ok());
    }

    #[tokio::test]
    async fn delete_then_exists_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let mut reader = std::io::Cursor::new(b"hello".to_vec());
        store.upload("obj1", &mut reader).await.unwrap();
        assert!(store.exists("obj1").await.unwrap());
        store.delete("obj1").await.unwrap();
        assert!(!store.exists("obj1").await.unwrap());
    }

    #[test]
    fn hash_length_sniffing_follows_the_cef_contract_table() {
        assert_eq!(sniff_hash_algorithm(&"a".repeat(32)), Some("md5"));
        assert_eq!(sniff_hash_algorithm(&"a".repeat(40)), Some("sha1"));
        assert_eq!(sniff_hash_algorithm(&"a".repeat(64)), Some("sha256"));
        assert_eq!(sniff_hash_algorithm("short"), None);
    }
}
