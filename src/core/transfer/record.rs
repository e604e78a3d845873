//! Transfer records: the persisted descriptor + progress pair.
//!
//! A transfer is identified by the content hash of its source file; the
//! descriptor is immutable for the life of the transfer (notably the chunk
//! size, so a default upgrade never corrupts a resume), while progress is
//! the mutable set of completed chunk indices.

use serde::{Deserialize, Serialize};

// ── Chunk set ────────────────────────────────────────────────────────────────

/// Completion bitmap over chunk indices.
///
/// Bit i set means chunk i is done (written at its offset for a receiver,
/// ACK-acknowledged for a sender). Converts to sorted half-open runs for the
/// wire, where a dense set must stay small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSet {
    total: u32,
    bits: Vec<u64>,
}

impl ChunkSet {
    pub fn new(total: u32) -> Self {
        let words = (total as usize).div_ceil(64);
        Self {
            total,
            bits: vec![0u64; words],
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Mark a chunk complete. Returns false if it was already set or the
    /// index is out of range.
    pub fn insert(&mut self, index: u32) -> bool {
        if index >= self.total {
            return false;
        }
        let word = (index / 64) as usize;
        let bit = index % 64;
        let mask = 1u64 << bit;
        if self.bits[word] & mask != 0 {
            return false;
        }
        self.bits[word] |= mask;
        true
    }

    pub fn contains(&self, index: u32) -> bool {
        if index >= self.total {
            return false;
        }
        (self.bits[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    pub fn len(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete(&self) -> bool {
        self.len() == self.total
    }

    /// Missing indices in ascending order.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total).filter(|i| !self.contains(*i))
    }

    /// Completed indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total).filter(|i| self.contains(*i))
    }

    /// Encode as sorted half-open `(start, end)` runs.
    pub fn to_runs(&self) -> Vec<(u32, u32)> {
        let mut runs = Vec::new();
        let mut start = None;
        for i in 0..self.total {
            if self.contains(i) {
                if start.is_none() {
                    start = Some(i);
                }
            } else if let Some(s) = start.take() {
                runs.push((s, i));
            }
        }
        if let Some(s) = start {
            runs.push((s, self.total));
        }
        runs
    }

    /// Rebuild from half-open runs. Indices beyond `total` are ignored.
    pub fn from_runs(total: u32, runs: &[(u32, u32)]) -> Self {
        let mut set = Self::new(total);
        for &(start, end) in runs {
            for i in start..end.min(total) {
                set.insert(i);
            }
        }
        set
    }

    pub fn from_indices(total: u32, indices: &[u32]) -> Self {
        let mut set = Self::new(total);
        for &i in indices {
            set.insert(i);
        }
        set
    }
}

// ── Descriptor & record ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sending,
    Receiving,
}

impl Role {
    /// Directory under the state root holding this role's records.
    pub fn dir(&self) -> &'static str {
        match self {
            Role::Sending => "sending",
            Role::Receiving => "receiving",
        }
    }
}

/// Immutable metadata of a single file transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    /// SHA3-256 of the source file, hex. Identity and integrity check.
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub peer_device_id: String,
    pub role: Role,
    pub created_at: String,
}

impl TransferDescriptor {
    pub fn new(
        file_hash: String,
        file_name: String,
        file_size: u64,
        chunk_size: u32,
        peer_device_id: String,
        role: Role,
    ) -> Self {
        Self {
            file_hash,
            file_name,
            file_size,
            total_chunks: total_chunks(file_size, chunk_size),
            chunk_size,
            peer_device_id,
            role,
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// Expected byte length of a chunk; only the last one may be short.
    pub fn chunk_len(&self, index: u32) -> u64 {
        debug_assert!(index < self.total_chunks);
        if index + 1 == self.total_chunks {
            self.file_size - u64::from(index) * u64::from(self.chunk_size)
        } else {
            u64::from(self.chunk_size)
        }
    }

    /// Byte offset of a chunk inside the file.
    pub fn chunk_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.chunk_size)
    }

    /// Whether an announced descriptor refers to the same wire content as
    /// this one. Peer, role and creation time are local bookkeeping and do
    /// not participate.
    pub fn same_content(&self, other: &crate::core::protocol::FileInfo) -> bool {
        self.file_hash == other.file_hash
            && self.file_name == other.file_name
            && self.file_size == other.file_size
            && self.chunk_size == other.chunk_size
            && self.total_chunks == other.total_chunks
    }
}

pub fn total_chunks(file_size: u64, chunk_size: u32) -> u32 {
    file_size.div_ceil(u64::from(chunk_size)) as u32
}

/// Persisted union of descriptor + progress, stored as
/// `<role>/<file_hash>.json`. Unknown top-level fields round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    #[serde(flatten)]
    pub descriptor: TransferDescriptor,
    /// Sorted completed chunk indices.
    pub completed_chunks: Vec<u32>,
    pub updated_at: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TransferRecord {
    pub fn new(descriptor: TransferDescriptor) -> Self {
        Self {
            descriptor,
            completed_chunks: Vec::new(),
            updated_at: chrono::Local::now().to_rfc3339(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn completed_set(&self) -> ChunkSet {
        ChunkSet::from_indices(self.descriptor.total_chunks, &self.completed_chunks)
    }

    pub fn set_completed(&mut self, set: &ChunkSet) {
        self.completed_chunks = set.indices().collect();
        self.updated_at = chrono::Local::now().to_rfc3339();
    }
}
