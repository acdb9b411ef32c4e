//! Chunk manager — fragmentation and reassembly for transports whose MTU is
//! smaller than a frame.
//!
//! A frame is split into at most 8 chunks, each prefixed with a fixed 7-byte
//! little-endian header. The receiver reassembles by frame id, tolerating
//! arbitrary delivery order and duplicates, and evicts incomplete frames
//! after a wall-clock timeout. One manager instance exists per transport;
//! all context-table operations are serialized by a single mutex.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Wire header ───────────────────────────────────────────────────────────────

/// Set on every chunk.
pub const FLAG_CHUNKED: u8 = 0x01;
/// Set on exactly one chunk per frame — the last one.
pub const FLAG_FINAL: u8 = 0x02;
/// Set on every chunk that is not the last.
pub const FLAG_MORE: u8 = 0x04;

/// Fixed header size on the wire.
pub const CHUNK_HEADER_SIZE: usize = 7;

/// Hard ceiling on chunks per frame; the received-bitmap is 8 bits wide.
pub const MAX_CHUNKS: usize = 8;

/// The 7-byte header preceding every chunk payload.
///
/// Wire layout: `flags(1) ‖ chunk_idx(1) ‖ total_chunks(1) ‖ frame_id(2, LE)
/// ‖ chunk_size(2, LE)`, immediately followed by `chunk_size` payload bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkHeader {
    pub flags: u8,
    pub chunk_idx: u8,
    pub total_chunks: u8,
    pub frame_id: U16<LittleEndian>,
    pub chunk_size: U16<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkHeader, [u8; 7]);

impl ChunkHeader {
    /// Read a header from the first 7 bytes, if there are that many.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes)
    }

    /// Sniff test used by the GATT receive path to distinguish a chunk from
    /// a bare frame. All five conditions must hold.
    pub fn is_plausible(&self, max_chunk_size: usize) -> bool {
        self.flags & FLAG_CHUNKED != 0
            && (self.chunk_idx as usize) < MAX_CHUNKS
            && self.total_chunks >= 1
            && (self.total_chunks as usize) <= MAX_CHUNKS
            && self.frame_id.get() != 0
            && (self.chunk_size.get() as usize) <= max_chunk_size.saturating_sub(CHUNK_HEADER_SIZE)
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Per-transport chunking parameters.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Largest unit the transport can carry, header included.
    pub max_chunk_size: usize,
    /// Bytes reserved for the chunk header. At least [`CHUNK_HEADER_SIZE`].
    pub header_size: usize,
    /// Reassembly contexts allowed at once, 1..=8.
    pub max_concurrent_frames: usize,
    /// Incomplete frames older than this are evicted by the sweep.
    pub reassembly_timeout: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 256,
            header_size: CHUNK_HEADER_SIZE,
            max_concurrent_frames: 4,
            reassembly_timeout: Duration::from_secs(2),
        }
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Counters exported by the manager. Snapshots, not live views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub active_contexts: usize,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub timeouts: u64,
    pub duplicates: u64,
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// What `accept` did with an incoming chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; the frame is still incomplete.
    Accepted,
    /// Already had this chunk; counted, nothing mutated.
    Duplicate,
    /// Last missing chunk arrived — here is the whole frame.
    Complete(Vec<u8>),
}

struct ReassemblyContext {
    created_at: Instant,
    received: u8,
    total_chunks: u8,
    final_size: Option<usize>,
    buffer: Vec<u8>,
}

struct Inner {
    config: ChunkConfig,
    next_frame_id: u16,
    contexts: HashMap<u16, ReassemblyContext>,
    stats: ChunkStats,
}

/// Splits outgoing frames and reassembles incoming ones.
pub struct ChunkManager {
    inner: Mutex<Inner>,
}

impl ChunkManager {
    pub fn new(config: ChunkConfig) -> Result<Self, ChunkError> {
        if config.max_concurrent_frames == 0 || config.max_concurrent_frames > MAX_CHUNKS {
            return Err(ChunkError::BadConfig("max_concurrent_frames must be 1..=8"));
        }
        if config.header_size < CHUNK_HEADER_SIZE {
            return Err(ChunkError::BadConfig("header_size below wire header size"));
        }
        if config.max_chunk_size <= config.header_size {
            return Err(ChunkError::BadConfig("max_chunk_size must exceed header_size"));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                config,
                next_frame_id: 0,
                contexts: HashMap::new(),
                stats: ChunkStats::default(),
            }),
        })
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Payload bytes each chunk can carry at the current chunk size.
    pub fn effective_payload(&self) -> usize {
        let inner = self.locked();
        inner.config.max_chunk_size - inner.config.header_size
    }

    /// Update the chunk size after MTU renegotiation.
    ///
    /// In-flight reassembly contexts were built against the old geometry and
    /// are discarded; the link just reconnected, so nothing useful is lost.
    pub fn set_max_chunk_size(&self, max_chunk_size: usize) -> Result<(), ChunkError> {
        let mut inner = self.locked();
        if max_chunk_size <= inner.config.header_size {
            return Err(ChunkError::BadConfig("max_chunk_size must exceed header_size"));
        }
        inner.config.max_chunk_size = max_chunk_size;
        inner.contexts.clear();
        Ok(())
    }

    /// Split a frame into ready-to-send chunks (header + payload slice each).
    ///
    /// Frames needing more than 8 chunks are refused.
    pub fn split(&self, frame: &[u8]) -> Result<Vec<Vec<u8>>, ChunkError> {
        let mut inner = self.locked();
        let effective = inner.config.max_chunk_size - inner.config.header_size;

        let total = frame.len().div_ceil(effective).max(1);
        if total > MAX_CHUNKS {
            return Err(ChunkError::TooLarge(frame.len()));
        }

        // 0 is reserved; wrap from 0xFFFF back to 1.
        inner.next_frame_id = match inner.next_frame_id {
            u16::MAX => 1,
            id => id + 1,
        };
        let frame_id = inner.next_frame_id;

        let mut chunks = Vec::with_capacity(total);
        for idx in 0..total {
            let start = idx * effective;
            let slice = &frame[start..frame.len().min(start + effective)];
            let flags = if idx == total - 1 {
                FLAG_CHUNKED | FLAG_FINAL
            } else {
                FLAG_CHUNKED | FLAG_MORE
            };
            let header = ChunkHeader {
                flags,
                chunk_idx: idx as u8,
                total_chunks: total as u8,
                frame_id: U16::new(frame_id),
                chunk_size: U16::new(slice.len() as u16),
            };
            let mut chunk = Vec::with_capacity(CHUNK_HEADER_SIZE + slice.len());
            chunk.extend_from_slice(header.as_bytes());
            chunk.extend_from_slice(slice);
            chunks.push(chunk);
        }

        inner.stats.frames_sent += 1;
        Ok(chunks)
    }

    /// Feed one incoming chunk to the reassembler.
    pub fn accept(&self, bytes: &[u8]) -> Result<ChunkOutcome, ChunkError> {
        let header = ChunkHeader::read_from_prefix(bytes)
            .ok_or(ChunkError::ShortChunk(bytes.len()))?;

        let mut inner = self.locked();
        let effective = inner.config.max_chunk_size - inner.config.header_size;

        let total = header.total_chunks as usize;
        let idx = header.chunk_idx as usize;
        let frame_id = header.frame_id.get();
        let chunk_size = header.chunk_size.get() as usize;
        let is_final = header.flags & FLAG_FINAL != 0;
        let is_more = header.flags & FLAG_MORE != 0;

        if header.flags & FLAG_CHUNKED == 0 {
            return Err(ChunkError::Malformed("chunked flag missing"));
        }
        if is_final == is_more {
            return Err(ChunkError::Malformed("exactly one of final/more required"));
        }
        if total == 0 || total > MAX_CHUNKS {
            return Err(ChunkError::Malformed("total_chunks out of range"));
        }
        if idx >= total {
            return Err(ChunkError::Malformed("chunk_idx beyond total_chunks"));
        }
        if is_final && idx != total - 1 {
            return Err(ChunkError::Malformed("final flag on non-last chunk"));
        }
        if frame_id == 0 {
            return Err(ChunkError::Malformed("frame_id zero is reserved"));
        }
        if chunk_size > effective {
            return Err(ChunkError::Malformed("chunk_size exceeds effective payload"));
        }
        if bytes.len() < CHUNK_HEADER_SIZE + chunk_size {
            return Err(ChunkError::ShortChunk(bytes.len()));
        }

        if !inner.contexts.contains_key(&frame_id) {
            if inner.contexts.len() >= inner.config.max_concurrent_frames {
                return Err(ChunkError::NoCapacity);
            }
            inner.contexts.insert(
                frame_id,
                ReassemblyContext {
                    created_at: Instant::now(),
                    received: 0,
                    total_chunks: total as u8,
                    final_size: None,
                    buffer: vec![0u8; total * effective],
                },
            );
            inner.stats.active_contexts = inner.contexts.len();
        }

        // Split borrow: contexts entry vs stats.
        let Inner { contexts, stats, .. } = &mut *inner;
        let ctx = contexts
            .get_mut(&frame_id)
            .ok_or(ChunkError::Malformed("context vanished"))?;

        if ctx.total_chunks as usize != total {
            return Err(ChunkError::Malformed("total_chunks changed mid-frame"));
        }

        let bit = 1u8 << idx;
        if ctx.received & bit != 0 {
            stats.duplicates += 1;
            return Ok(ChunkOutcome::Duplicate);
        }

        let payload = &bytes[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + chunk_size];
        ctx.buffer[idx * effective..idx * effective + chunk_size].copy_from_slice(payload);
        ctx.received |= bit;
        if is_final {
            ctx.final_size = Some(chunk_size);
        }

        let complete_mask = if total == MAX_CHUNKS {
            u8::MAX
        } else {
            (1u8 << total) - 1
        };
        if ctx.received == complete_mask {
            let final_size = ctx.final_size.unwrap_or(effective);
            let mut ctx = contexts
                .remove(&frame_id)
                .ok_or(ChunkError::Malformed("context vanished"))?;
            ctx.buffer.truncate((total - 1) * effective + final_size);
            stats.frames_received += 1;
            stats.active_contexts = contexts.len();
            return Ok(ChunkOutcome::Complete(ctx.buffer));
        }

        Ok(ChunkOutcome::Accepted)
    }

    /// Evict reassembly contexts older than the configured timeout.
    /// Returns how many were destroyed.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.locked();
        let cutoff = inner.config.reassembly_timeout;
        let now = Instant::now();
        let before = inner.contexts.len();
        inner
            .contexts
            .retain(|_, ctx| now.duration_since(ctx.created_at) < cutoff);
        let evicted = before - inner.contexts.len();
        inner.stats.timeouts += evicted as u64;
        inner.stats.active_contexts = inner.contexts.len();
        evicted
    }

    pub fn stats(&self) -> ChunkStats {
        self.locked().stats
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("frame of {0} bytes needs more than 8 chunks")]
    TooLarge(usize),

    #[error("chunk of {0} bytes is shorter than its header claims")]
    ShortChunk(usize),

    #[error("malformed chunk header: {0}")]
    Malformed(&'static str),

    #[error("reassembly table full")]
    NoCapacity,

    #[error("invalid chunk configuration: {0}")]
    BadConfig(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
