use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::protocol::{KvRecord, PeerId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid path component `{0}`")]
    InvalidComponent(String),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for completed inbound records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn store(&self, from: &PeerId, record: KvRecord) -> Result<(), StorageError>;
}

/// Directory-backed sink.
///
/// File-chunk records land in `{root}/{key}/{chunkCID}` with a
/// `{chunkCID}_meta.json` sibling. Any other record is written as
/// `{root}/{key}/value.json`.
#[derive(Debug, Clone)]
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RecordSink for FsRecordStore {
    async fn store(&self, from: &PeerId, record: KvRecord) -> Result<(), StorageError> {
        let dir = self.root.join(path_component(&record.key)?);
        fs::create_dir_all(&dir).await?;

        match record.chunk_payload() {
            Some(chunk) => {
                let name = path_component(&chunk.chunk_cid)?;
                let content = serde_json::to_vec(&chunk.encrypted_chunk)?;
                write_atomic(&dir.join(name), &content).await?;
                let meta = serde_json::to_vec_pretty(&chunk.meta())?;
                write_atomic(&dir.join(format!("{name}_meta.json")), &meta).await?;
                info!(
                    target: "dbase::storage",
                    from = %from,
                    key = %record.key,
                    chunk_cid = %chunk.chunk_cid,
                    chunk_index = ?chunk.chunk_index,
                    "stored chunk"
                );
            }
            None => {
                let body = serde_json::to_vec_pretty(&record.value)?;
                write_atomic(&dir.join("value.json"), &body).await?;
                info!(target: "dbase::storage", from = %from, key = %record.key, "stored record");
            }
        }
        Ok(())
    }
}

fn path_component(raw: &str) -> Result<&str, StorageError> {
    let invalid = raw.is_empty()
        || raw == "."
        || raw == ".."
        || raw.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    if invalid {
        Err(StorageError::InvalidComponent(raw.to_string()))
    } else {
        Ok(raw)
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    fs::write(&temp, data).await?;
    fs::rename(&temp, path).await?;
    debug!(target: "dbase::storage", path = %path.display(), bytes = data.len(), "wrote file");
    Ok(())
}

/// Keeps records in memory. Handy for tests and embedding.
pub struct MemorySink {
    records: Mutex<Vec<(PeerId, KvRecord)>>,
    count: watch::Sender<usize>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            count: watch::channel(0).0,
        }
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(PeerId, KvRecord)> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `count` records arrived. Returns false on timeout.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        let mut rx = self.count.subscribe();
        matches!(
            tokio::time::timeout(limit, rx.wait_for(|n| *n >= count)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn store(&self, from: &PeerId, record: KvRecord) -> Result<(), StorageError> {
        let len = {
            let mut guard = self.records.lock();
            guard.push((from.clone(), record));
            guard.len()
        };
        self.count.send_replace(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn chunk_record_writes_content_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::open(dir.path().join("peer_store")).await.unwrap();
        let record = KvRecord::new(
            "f1",
            json!({
                "owner": "0xabc",
                "fileName": "notes.txt",
                "chunkIndex": 0,
                "chunkCID": "bafy1",
                "encryptedChunk": "c2VjcmV0",
                "encryptionMethod": "AES-GCM"
            }),
        );
        store.store(&PeerId::from("node-a"), record).await.unwrap();

        let base = store.root().join("f1");
        assert_eq!(
            std::fs::read_to_string(base.join("bafy1")).unwrap(),
            "\"c2VjcmV0\""
        );
        let meta: Value =
            serde_json::from_slice(&std::fs::read(base.join("bafy1_meta.json")).unwrap()).unwrap();
        assert_eq!(meta["fileName"], "notes.txt");
        assert_eq!(meta["chunkIndex"], 0);
        assert!(!base.join("bafy1.tmp").exists());
    }

    #[tokio::test]
    async fn plain_record_writes_value_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::open(dir.path()).await.unwrap();
        store
            .store(&PeerId::from("a"), KvRecord::new("settings", json!({"x": 1})))
            .await
            .unwrap();
        let value: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("settings/value.json")).unwrap())
                .unwrap();
        assert_eq!(value, json!({"x": 1}));
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::open(dir.path()).await.unwrap();
        for key in ["..", "a/b", ""] {
            let err = store
                .store(&PeerId::from("a"), KvRecord::new(key, json!(1)))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidComponent(_)));
        }
    }

    #[tokio::test]
    async fn memory_sink_signals_arrivals() {
        let sink = MemorySink::new();
        assert!(!sink.wait_for(1, Duration::from_millis(10)).await);
        sink.store(&PeerId::from("a"), KvRecord::new("k", json!(null)))
            .await
            .unwrap();
        assert!(sink.wait_for(1, Duration::from_millis(10)).await);
        assert_eq!(sink.len(), 1);
    }
}
