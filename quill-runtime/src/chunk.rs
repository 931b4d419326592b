//! Chunking of oversized outbound messages and reassembly of inbound ones.
//!
//! ```text
//!  serialized payload (10 000 B), max 4 096 B
//!  ┌──────────┬──────────┬────────┐
//!  │ chunk 1  │ chunk 2  │ chunk 3│   chunkedOp × 3, same originalType
//!  └──────────┴──────────┴────────┘
//!         │ sequenced, possibly interleaved with other clients
//!         ▼
//!  per-sender buffer ── chunk 3 of 3 ──► concatenate, parse, restore type
//! ```
//!
//! Locally sent oversized messages stay in [`UnackedChunks`] until their final
//! chunk comes back sequenced, and are resent whole after a reconnect.

use std::collections::{BTreeMap, HashMap};

use quill_core::{ChunkedOp, ClientId, MessageContents, MessageType};

/// Split `serialized` into slices of at most `max_size` bytes.
///
/// Slices end on UTF-8 boundaries, so a multi-byte character never straddles
/// two chunks. ASCII payloads yield exactly `ceil(len / max_size)` chunks.
pub fn split_into_chunks(
    original_type: MessageType,
    serialized: &str,
    max_size: usize,
) -> Vec<ChunkedOp> {
    let max_size = max_size.max(1);
    let mut pieces = Vec::new();
    let mut offset = 0;

    while offset < serialized.len() {
        let mut end = (offset + max_size).min(serialized.len());
        while !serialized.is_char_boundary(end) {
            end -= 1;
        }
        if end == offset {
            // max_size is narrower than this character
            end = offset + 1;
            while !serialized.is_char_boundary(end) {
                end += 1;
            }
        }
        pieces.push(&serialized[offset..end]);
        offset = end;
    }

    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| ChunkedOp {
            chunk_id: i as u32 + 1,
            total_chunks: total,
            contents: piece.to_string(),
            original_type,
        })
        .collect()
}

/// Per-sender reassembly buffers for inbound chunked ops.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    buffers: HashMap<ClientId, Vec<String>>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore buffers persisted in a snapshot's `partialOps`.
    pub fn from_partial_ops(partial_ops: Vec<(ClientId, Vec<String>)>) -> Self {
        Self {
            buffers: partial_ops
                .into_iter()
                .filter(|(_, chunks)| !chunks.is_empty())
                .collect(),
        }
    }

    /// Buffer one chunk from `sender`.
    ///
    /// Returns the restored contents when this was the final chunk; the
    /// sender's buffer is cleared either way once the final chunk arrives.
    pub fn add_chunk(
        &mut self,
        sender: &str,
        chunk: &ChunkedOp,
    ) -> Result<Option<MessageContents>, serde_json::Error> {
        let buffer = self.buffers.entry(sender.to_string()).or_default();
        buffer.push(chunk.contents.clone());

        if chunk.chunk_id < chunk.total_chunks {
            return Ok(None);
        }

        let serialized = self
            .buffers
            .remove(sender)
            .map(|parts| parts.concat())
            .unwrap_or_default();
        log::debug!(
            "reassembled {} from {} ({} chunks, {} bytes)",
            chunk.original_type,
            sender,
            chunk.total_chunks,
            serialized.len()
        );
        let payload = serde_json::from_str(&serialized)?;
        MessageContents::from_payload(chunk.original_type, payload).map(Some)
    }

    /// Drop any partial message from `sender`.
    pub fn clear(&mut self, sender: &str) -> bool {
        self.buffers.remove(sender).is_some()
    }

    pub fn buffered_chunks(&self, sender: &str) -> usize {
        self.buffers.get(sender).map_or(0, Vec::len)
    }

    /// Snapshot form, ordered by client id.
    pub fn partial_ops(&self) -> Vec<(ClientId, Vec<String>)> {
        let mut ops: Vec<_> = self
            .buffers
            .iter()
            .map(|(client, chunks)| (client.clone(), chunks.clone()))
            .collect();
        ops.sort_by(|a, b| a.0.cmp(&b.0));
        ops
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// A locally sent oversized message awaiting its final chunk's sequencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedChunk {
    pub original_type: MessageType,
    pub content: String,
}

/// Unacknowledged oversized messages keyed by the client sequence number of
/// their final chunk.
#[derive(Debug, Default)]
pub struct UnackedChunks {
    entries: BTreeMap<u64, BufferedChunk>,
}

impl UnackedChunks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client_sequence_number: u64, chunk: BufferedChunk) {
        self.entries.insert(client_sequence_number, chunk);
    }

    /// Remove the entry whose final chunk was sequenced.
    pub fn acknowledge(&mut self, client_sequence_number: u64) -> Option<BufferedChunk> {
        self.entries.remove(&client_sequence_number)
    }

    /// Take every entry in submission order.
    pub fn drain(&mut self) -> Vec<BufferedChunk> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn contains(&self, client_sequence_number: u64) -> bool {
        self.entries.contains_key(&client_sequence_number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
