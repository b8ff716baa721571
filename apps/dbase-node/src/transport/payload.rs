use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use super::TransportError;
use super::chunk::{
    ChunkConfig, FrameKind, Reassembler, decode_chunk, encode_chunk, split_message,
};
use crate::protocol::{KvRecord, TextMessage};

/// Anything that travels over the transfer data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Record(KvRecord),
    Text(TextMessage),
}

impl Payload {
    pub fn key(&self) -> &str {
        match self {
            Payload::Record(record) => &record.key,
            Payload::Text(_) => "",
        }
    }

    fn kind(&self) -> FrameKind {
        match self {
            Payload::Record(_) => FrameKind::Record,
            Payload::Text(_) => FrameKind::Text,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Record(record) => record.to_bytes(),
            Payload::Text(text) => text.to_bytes(),
        }
    }

    /// Serializes and splits into wire frames no larger than `max_chunk_bytes`.
    pub fn encode_frames(&self, config: &ChunkConfig) -> Result<Vec<Bytes>, TransportError> {
        let body = self.to_bytes()?;
        let frames = split_message(self.kind(), self.key(), &body, config)?;
        Ok(frames.iter().map(encode_chunk).collect())
    }

    fn decode(kind: FrameKind, bytes: &[u8]) -> Result<Self, serde_json::Error> {
        match kind {
            FrameKind::Record => KvRecord::from_slice(bytes).map(Payload::Record),
            FrameKind::Text => TextMessage::from_slice(bytes).map(Payload::Text),
        }
    }

    fn decode_unframed(bytes: &[u8]) -> Option<Self> {
        if let Ok(record) = KvRecord::from_slice(bytes) {
            return Some(Payload::Record(record));
        }
        TextMessage::from_slice(bytes).ok().map(Payload::Text)
    }
}

/// Turns inbound data channel messages back into payloads. One per session.
#[derive(Debug)]
pub struct InboundAssembler {
    reassembler: Reassembler,
    config: ChunkConfig,
}

impl InboundAssembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            reassembler: Reassembler::new(config),
            config,
        }
    }

    pub fn in_flight(&self, key: &str) -> bool {
        self.reassembler.in_flight(FrameKind::Record, key)
    }

    pub fn ingest(&mut self, bytes: &[u8], now: Instant) -> Result<Option<Payload>, TransportError> {
        // 0xD1 is also a UTF-8 lead byte, so a legacy fragment can look framed
        let frame = match decode_chunk(bytes, &self.config) {
            Ok(Some(frame)) => frame,
            Ok(None) => return self.ingest_unframed(bytes, now),
            Err(_) if self.reassembler.has_legacy() => return self.ingest_unframed(bytes, now),
            Err(err) => return Err(err.into()),
        };

        let outcome = self.reassembler.ingest(frame, now)?;
        for event in &outcome.gc_events {
            debug!(
                target: "dbase::chunk",
                key = %event.key,
                reason = ?event.reason,
                "dropped incomplete message"
            );
        }
        let Some(done) = outcome.completed else {
            return Ok(None);
        };
        let payload = Payload::decode(done.kind, &done.payload)?;
        if payload.key() != done.key {
            warn!(
                target: "dbase::chunk",
                frame_key = %done.key,
                record_key = %payload.key(),
                "frame key differs from record key"
            );
        }
        debug!(
            target: "dbase::chunk",
            key = %done.key,
            bytes = done.payload.len(),
            elapsed_ms = now.saturating_duration_since(done.started_at).as_millis() as u64,
            "message reassembled"
        );
        Ok(Some(payload))
    }

    fn ingest_unframed(&mut self, bytes: &[u8], now: Instant) -> Result<Option<Payload>, TransportError> {
        if let Some(payload) = Payload::decode_unframed(bytes) {
            return Ok(Some(payload));
        }
        let combined = self.reassembler.push_legacy(bytes, now)?;
        match Payload::decode_unframed(&combined) {
            Some(payload) => {
                self.reassembler.clear_legacy();
                debug!(
                    target: "dbase::chunk",
                    bytes = combined.len(),
                    "legacy message reassembled"
                );
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}
