use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unit of transfer: one key/value pair, serialized as JSON on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvRecord {
    pub key: String,
    pub value: Value,
}

impl KvRecord {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Interprets the value as a stored file chunk, if it has that shape.
    pub fn chunk_payload(&self) -> Option<ChunkPayload> {
        serde_json::from_value(self.value.clone()).ok()
    }
}

/// Value carried by file-chunk records. Encryption fields are opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub chunk_index: Option<u64>,
    #[serde(rename = "chunkCID")]
    pub chunk_cid: String,
    pub encrypted_chunk: Value,
    #[serde(default)]
    pub encryption_method: Option<String>,
}

impl ChunkPayload {
    pub fn meta(&self) -> ChunkMeta {
        ChunkMeta {
            owner: self.owner.clone(),
            file_name: self.file_name.clone(),
            chunk_cid: self.chunk_cid.clone(),
            chunk_index: self.chunk_index,
            encryption_method: self.encryption_method.clone(),
        }
    }
}

/// Sibling `*_meta.json` document written next to each stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub owner: Option<String>,
    pub file_name: Option<String>,
    #[serde(rename = "chunkCID")]
    pub chunk_cid: String,
    pub chunk_index: Option<u64>,
    pub encryption_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Envelope {
    Text { content: String },
}

/// Free-form text sent between peers, `{"type":"text","content":...}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub content: String,
}

impl TextMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Envelope::Text {
            content: self.content.clone(),
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let Envelope::Text { content } = serde_json::from_slice(bytes)?;
        Ok(Self { content })
    }
}
