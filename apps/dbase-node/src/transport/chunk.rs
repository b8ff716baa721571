use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use crate::config::env_usize;

pub const FRAME_VERSION: u8 = 0xD1;
/// version + kind + seq + total_len + checksum + key_len
const FIXED_HEADER_LEN: usize = 1 + 1 + 4 + 4 + 4 + 2;
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_GC_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_KEY_BYTES: usize = 1024;
const DEFAULT_MAX_INFLIGHT: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_chunk_bytes: usize,
    pub max_message_bytes: usize,
    pub max_inflight: usize,
    pub gc_timeout: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            gc_timeout: DEFAULT_GC_TIMEOUT,
        }
    }
}

impl ChunkConfig {
    pub fn from_env() -> Self {
        let min_chunk = FIXED_HEADER_LEN + MAX_KEY_BYTES + 1;
        Self {
            max_chunk_bytes: env_usize("DBASE_MAX_CHUNK_BYTES", DEFAULT_MAX_CHUNK_BYTES, min_chunk),
            max_message_bytes: env_usize("DBASE_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES, 1),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            gc_timeout: Duration::from_secs(env_usize(
                "DBASE_REASSEMBLY_TIMEOUT_SECS",
                DEFAULT_GC_TIMEOUT.as_secs() as usize,
                1,
            ) as u64),
        }
    }

    pub fn payload_capacity(&self, key_len: usize) -> usize {
        self.max_chunk_bytes
            .saturating_sub(FIXED_HEADER_LEN + key_len)
            .max(1)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("chunk frame too large: {0} bytes")]
    ChunkTooLarge(usize),
    #[error("record key too long: {0} bytes")]
    KeyTooLong(usize),
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
    #[error("chunk for `{key}` out of sequence: expected {expected}, got {got}")]
    OutOfSequence { key: String, expected: u32, got: u32 },
    #[error("checksum mismatch for `{key}`")]
    ChecksumMismatch { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Record,
    Text,
}

impl FrameKind {
    fn as_byte(self) -> u8 {
        match self {
            FrameKind::Record => 0,
            FrameKind::Text => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameKind::Record),
            1 => Some(FrameKind::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub kind: FrameKind,
    pub key: String,
    pub seq: u32,
    pub total_len: u32,
    pub checksum: u32,
    pub payload: Bytes,
}

impl ChunkFrame {
    fn is_whole(&self) -> bool {
        self.seq == 0 && self.payload.len() == self.total_len as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcReason {
    Timeout,
    Capacity,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEvent {
    pub key: String,
    pub reason: GcReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub kind: FrameKind,
    pub key: String,
    pub payload: Bytes,
    pub started_at: Instant,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub completed: Option<Reassembled>,
    pub gc_events: Vec<GcEvent>,
}

#[derive(Debug)]
struct PartialMessage {
    created_at: Instant,
    total_len: u32,
    checksum: u32,
    next_seq: u32,
    chunks: Vec<Bytes>,
    received_bytes: usize,
}

#[derive(Debug)]
struct LegacyBuffer {
    created_at: Instant,
    fragments: Vec<Bytes>,
    received_bytes: usize,
}

/// Per-session inbound state. Owned by exactly one peer session.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<(FrameKind, String), PartialMessage>,
    legacy: Option<LegacyBuffer>,
    config: ChunkConfig,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            legacy: None,
            config,
        }
    }

    pub fn in_flight(&self, kind: FrameKind, key: &str) -> bool {
        self.partials.contains_key(&(kind, key.to_string()))
    }

    pub fn in_flight_count(&self) -> usize {
        self.partials.len()
    }

    pub fn ingest(&mut self, frame: ChunkFrame, now: Instant) -> Result<IngestOutcome, ChunkError> {
        let mut outcome = IngestOutcome {
            completed: None,
            gc_events: self.gc(now),
        };

        let total_len = frame.total_len as usize;
        if total_len > self.config.max_message_bytes {
            return Err(ChunkError::MessageTooLarge(total_len));
        }
        let slot = (frame.kind, frame.key.clone());

        if frame.is_whole() {
            if self.partials.remove(&slot).is_some() {
                outcome.gc_events.push(GcEvent {
                    key: frame.key.clone(),
                    reason: GcReason::Superseded,
                });
            }
            verify_checksum(&frame.key, &frame.payload, frame.checksum)?;
            outcome.completed = Some(Reassembled {
                kind: frame.kind,
                key: frame.key,
                payload: frame.payload,
                started_at: now,
            });
            return Ok(outcome);
        }

        if frame.seq == 0 {
            if self.partials.remove(&slot).is_some() {
                outcome.gc_events.push(GcEvent {
                    key: frame.key.clone(),
                    reason: GcReason::Superseded,
                });
            } else if self.partials.len() >= self.config.max_inflight {
                if let Some(evicted) = self.evict_oldest() {
                    outcome.gc_events.push(evicted);
                }
            }
            if frame.payload.len() > total_len {
                return Err(ChunkError::Malformed("first chunk exceeds declared length"));
            }
            self.partials.insert(
                slot,
                PartialMessage {
                    created_at: now,
                    total_len: frame.total_len,
                    checksum: frame.checksum,
                    next_seq: 1,
                    received_bytes: frame.payload.len(),
                    chunks: vec![frame.payload],
                },
            );
            return Ok(outcome);
        }

        let Some(partial) = self.partials.get_mut(&slot) else {
            return Err(ChunkError::OutOfSequence {
                key: frame.key,
                expected: 0,
                got: frame.seq,
            });
        };

        if partial.next_seq != frame.seq {
            let expected = partial.next_seq;
            self.partials.remove(&slot);
            return Err(ChunkError::OutOfSequence {
                key: frame.key,
                expected,
                got: frame.seq,
            });
        }
        if partial.total_len != frame.total_len || partial.checksum != frame.checksum {
            self.partials.remove(&slot);
            return Err(ChunkError::Malformed("declared length changed mid-message"));
        }

        partial.received_bytes = partial.received_bytes.saturating_add(frame.payload.len());
        partial.next_seq = partial.next_seq.saturating_add(1);
        partial.chunks.push(frame.payload);

        if partial.received_bytes > total_len {
            self.partials.remove(&slot);
            return Err(ChunkError::Malformed("received more bytes than declared"));
        }
        if partial.received_bytes < total_len {
            return Ok(outcome);
        }

        let Some(done) = self.partials.remove(&slot) else {
            return Ok(outcome);
        };
        let mut combined = Vec::with_capacity(done.received_bytes);
        for chunk in &done.chunks {
            combined.extend_from_slice(chunk);
        }
        let payload = Bytes::from(combined);
        verify_checksum(&frame.key, &payload, done.checksum)?;
        outcome.completed = Some(Reassembled {
            kind: frame.kind,
            key: frame.key,
            payload,
            started_at: done.created_at,
        });
        Ok(outcome)
    }

    /// Appends an unframed fragment and returns everything buffered so far.
    pub fn push_legacy(&mut self, fragment: &[u8], now: Instant) -> Result<Bytes, ChunkError> {
        let expired = self.legacy.as_ref().is_some_and(|buffer| {
            now.saturating_duration_since(buffer.created_at) > self.config.gc_timeout
        });
        if expired {
            self.legacy = None;
        }
        let buffer = self.legacy.get_or_insert_with(|| LegacyBuffer {
            created_at: now,
            fragments: Vec::new(),
            received_bytes: 0,
        });
        buffer.received_bytes = buffer.received_bytes.saturating_add(fragment.len());
        if buffer.received_bytes > self.config.max_message_bytes {
            let size = buffer.received_bytes;
            self.legacy = None;
            return Err(ChunkError::MessageTooLarge(size));
        }
        buffer.fragments.push(Bytes::copy_from_slice(fragment));
        let mut combined = Vec::with_capacity(buffer.received_bytes);
        for part in &buffer.fragments {
            combined.extend_from_slice(part);
        }
        Ok(Bytes::from(combined))
    }

    pub fn clear_legacy(&mut self) {
        self.legacy = None;
    }

    pub fn has_legacy(&self) -> bool {
        self.legacy.is_some()
    }

    pub fn gc(&mut self, now: Instant) -> Vec<GcEvent> {
        let mut dropped = Vec::new();
        let timeout = self.config.gc_timeout;
        self.partials.retain(|(_, key), partial| {
            let expired = now.saturating_duration_since(partial.created_at) > timeout;
            if expired {
                dropped.push(GcEvent {
                    key: key.clone(),
                    reason: GcReason::Timeout,
                });
            }
            !expired
        });
        dropped
    }

    fn evict_oldest(&mut self) -> Option<GcEvent> {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.created_at)
            .map(|(slot, _)| slot.clone())?;
        self.partials.remove(&oldest);
        Some(GcEvent {
            key: oldest.1,
            reason: GcReason::Capacity,
        })
    }
}

fn verify_checksum(key: &str, payload: &[u8], expected: u32) -> Result<(), ChunkError> {
    if crc32c::crc32c(payload) == expected {
        Ok(())
    } else {
        Err(ChunkError::ChecksumMismatch {
            key: key.to_string(),
        })
    }
}

pub fn split_message(
    kind: FrameKind,
    key: &str,
    payload: &[u8],
    config: &ChunkConfig,
) -> Result<Vec<ChunkFrame>, ChunkError> {
    if key.len() > MAX_KEY_BYTES {
        return Err(ChunkError::KeyTooLong(key.len()));
    }
    if payload.len() > config.max_message_bytes {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }
    let total_len =
        u32::try_from(payload.len()).map_err(|_| ChunkError::MessageTooLarge(payload.len()))?;
    let checksum = crc32c::crc32c(payload);
    let capacity = config.payload_capacity(key.len());

    if payload.is_empty() {
        return Ok(vec![ChunkFrame {
            kind,
            key: key.to_string(),
            seq: 0,
            total_len: 0,
            checksum,
            payload: Bytes::new(),
        }]);
    }

    payload
        .chunks(capacity)
        .enumerate()
        .map(|(seq, chunk)| {
            let seq = u32::try_from(seq)
                .map_err(|_| ChunkError::Malformed("chunk sequence overflowed u32"))?;
            Ok(ChunkFrame {
                kind,
                key: key.to_string(),
                seq,
                total_len,
                checksum,
                payload: Bytes::copy_from_slice(chunk),
            })
        })
        .collect()
}

pub fn encode_chunk(frame: &ChunkFrame) -> Bytes {
    let key = frame.key.as_bytes();
    let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + key.len() + frame.payload.len());
    buf.push(FRAME_VERSION);
    buf.push(frame.kind.as_byte());
    buf.extend_from_slice(&frame.seq.to_be_bytes());
    buf.extend_from_slice(&frame.total_len.to_be_bytes());
    buf.extend_from_slice(&frame.checksum.to_be_bytes());
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&frame.payload);
    Bytes::from(buf)
}

/// Returns `Ok(None)` when the bytes are not a chunk frame at all (legacy peer).
pub fn decode_chunk(bytes: &[u8], config: &ChunkConfig) -> Result<Option<ChunkFrame>, ChunkError> {
    if bytes.first().copied() != Some(FRAME_VERSION) {
        return Ok(None);
    }
    if bytes.len() < FIXED_HEADER_LEN {
        return Err(ChunkError::Malformed("chunk frame too short"));
    }
    if bytes.len() > config.max_chunk_bytes {
        return Err(ChunkError::ChunkTooLarge(bytes.len()));
    }
    let kind = FrameKind::from_byte(bytes[1]).ok_or(ChunkError::Malformed("unknown frame kind"))?;
    let seq = read_u32(&bytes[2..6]);
    let total_len = read_u32(&bytes[6..10]);
    let checksum = read_u32(&bytes[10..14]);
    let key_len = u16::from_be_bytes([bytes[14], bytes[15]]) as usize;
    if key_len > MAX_KEY_BYTES {
        return Err(ChunkError::KeyTooLong(key_len));
    }
    let key_end = FIXED_HEADER_LEN + key_len;
    if bytes.len() < key_end {
        return Err(ChunkError::Malformed("chunk key truncated"));
    }
    let key = std::str::from_utf8(&bytes[FIXED_HEADER_LEN..key_end])
        .map_err(|_| ChunkError::Malformed("chunk key is not utf-8"))?
        .to_string();
    let payload = &bytes[key_end..];
    if payload.len() > total_len as usize {
        return Err(ChunkError::Malformed("chunk payload exceeds declared length"));
    }
    Ok(Some(ChunkFrame {
        kind,
        key,
        seq,
        total_len,
        checksum,
        payload: Bytes::copy_from_slice(payload),
    }))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, thread_rng};

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            max_chunk_bytes: 48,
            max_message_bytes: 4096,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            gc_timeout: Duration::from_secs(1),
        }
    }

    fn feed(reassembler: &mut Reassembler, frames: Vec<ChunkFrame>) -> Option<Bytes> {
        let mut recovered = None;
        for frame in frames {
            let outcome = reassembler.ingest(frame, Instant::now()).expect("ingest");
            if let Some(done) = outcome.completed {
                recovered = Some(done.payload);
            }
        }
        recovered
    }

    #[test]
    fn split_and_reassemble_round_trip() {
        let config = small_config();
        let payload = b"the quick brown fox jumps over the lazy dog, twice over".to_vec();
        let frames = split_message(FrameKind::Record, "k1", &payload, &config).expect("split");
        assert!(frames.len() > 1);
        assert!(frames.iter().all(|f| encode_chunk(f).len() <= config.max_chunk_bytes));

        let mut reassembler = Reassembler::new(config);
        let recovered = feed(&mut reassembler, frames);
        assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
        assert!(!reassembler.in_flight(FrameKind::Record, "k1"));
    }

    #[test]
    fn random_payloads_survive_the_wire() {
        let config = ChunkConfig::default();
        let mut rng = thread_rng();
        for _ in 0..8 {
            let len = rng.gen_range(0..(3 * DEFAULT_MAX_CHUNK_BYTES));
            let payload: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            let frames = split_message(FrameKind::Record, "rand", &payload, &config).unwrap();
            let mut reassembler = Reassembler::new(config);
            let mut recovered = None;
            for frame in &frames {
                let bytes = encode_chunk(frame);
                assert!(bytes.len() <= DEFAULT_MAX_CHUNK_BYTES);
                let decoded = decode_chunk(&bytes, &config).unwrap().expect("framed");
                if let Some(done) = reassembler.ingest(decoded, Instant::now()).unwrap().completed {
                    recovered = Some(done.payload);
                }
            }
            assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
        }
    }

    #[test]
    fn forty_kib_splits_into_three_frames() {
        let config = ChunkConfig::default();
        let payload = vec![b'x'; 40 * 1024];
        let frames = split_message(FrameKind::Record, "f1", &payload, &config).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].seq, 2);
    }

    #[test]
    fn redelivery_after_completion_starts_fresh() {
        let config = small_config();
        let payload = vec![7u8; 150];
        let frames = split_message(FrameKind::Record, "again", &payload, &config).unwrap();
        let mut reassembler = Reassembler::new(config);
        assert_eq!(feed(&mut reassembler, frames.clone()).as_deref(), Some(&payload[..]));
        assert_eq!(feed(&mut reassembler, frames).as_deref(), Some(&payload[..]));
        assert_eq!(reassembler.in_flight_count(), 0);
    }

    #[test]
    fn gap_in_sequence_is_rejected() {
        let config = small_config();
        let frames = split_message(FrameKind::Record, "gap", &[1u8; 120], &config).unwrap();
        assert!(frames.len() >= 3);
        let mut reassembler = Reassembler::new(config);
        reassembler.ingest(frames[0].clone(), Instant::now()).unwrap();
        let err = reassembler
            .ingest(frames[2].clone(), Instant::now())
            .expect_err("gap");
        assert!(matches!(err, ChunkError::OutOfSequence { expected: 1, got: 2, .. }));
        assert!(!reassembler.in_flight(FrameKind::Record, "gap"));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let config = small_config();
        let mut frames = split_message(FrameKind::Record, "crc", &[3u8; 100], &config).unwrap();
        let last = frames.len() - 1;
        let mut tampered = frames[last].payload.to_vec();
        tampered[0] ^= 0xff;
        frames[last].payload = Bytes::from(tampered);

        let mut reassembler = Reassembler::new(config);
        let mut result = Ok(IngestOutcome::default());
        for frame in frames {
            result = reassembler.ingest(frame, Instant::now());
        }
        assert!(matches!(result, Err(ChunkError::ChecksumMismatch { .. })));
    }

    #[test]
    fn stale_partial_gets_gced() {
        let config = ChunkConfig {
            gc_timeout: Duration::from_millis(20),
            ..small_config()
        };
        let mut reassembler = Reassembler::new(config);
        let frames = split_message(FrameKind::Record, "slow", &[9u8; 100], &config).unwrap();
        let start = Instant::now();
        reassembler.ingest(frames[0].clone(), start).unwrap();
        let dropped = reassembler.gc(start + Duration::from_millis(50));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].reason, GcReason::Timeout);
        assert_eq!(reassembler.in_flight_count(), 0);
    }

    #[test]
    fn legacy_bytes_are_not_frames() {
        let config = ChunkConfig::default();
        assert_eq!(decode_chunk(br#"{"key":"a","value":1}"#, &config), Ok(None));
    }

    #[test]
    fn legacy_fragments_accumulate_until_cleared() {
        let mut reassembler = Reassembler::new(small_config());
        let now = Instant::now();
        assert_eq!(&reassembler.push_legacy(b"{\"key\":", now).unwrap()[..], b"{\"key\":");
        let combined = reassembler.push_legacy(b"\"a\"}", now).unwrap();
        assert_eq!(&combined[..], b"{\"key\":\"a\"}");
        reassembler.clear_legacy();
        assert!(!reassembler.has_legacy());
    }

    #[test]
    fn oversize_rejected() {
        let config = ChunkConfig {
            max_message_bytes: 64,
            ..small_config()
        };
        let err = split_message(FrameKind::Record, "big", &[0u8; 128], &config).unwrap_err();
        assert!(matches!(err, ChunkError::MessageTooLarge(128)));
    }
}
