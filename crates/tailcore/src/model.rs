//! Core data model: file identity, signatures, checkpoints, events and batches.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Filesystem identity of a file, stable across renames. On platforms
/// without inodes the discoverer substitutes `(volume_id, file_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevInode {
    pub device: u64,
    pub inode: u64,
}

impl DevInode {
    pub fn new(device: u64, inode: u64) -> Self {
        Self { device, inode }
    }
}

/// Outcome of comparing a freshly-read file prefix against a stored signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// Same prefix, file length unchanged.
    EqualSameSize,
    /// Same prefix, file has grown since the signature was captured.
    EqualSizeGrew,
    /// The captured prefix no longer matches — truncation or a new file.
    PrefixDiffers,
    /// The file is now shorter than the signature's capture length.
    TooShort,
}

/// A fixed-length digest over the first `sig_size` bytes of a file, used to
/// detect in-place truncation and copy-then-truncate rotation. `sig_size` is
/// bounded below by 1024 bytes and above by the file's own length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSignature {
    pub hash: u64,
    pub prefix_len: u64,
    pub file_len_at_capture: u64,
}

pub const MIN_SIGNATURE_SIZE: u64 = 1024;

impl FileSignature {
    /// Captures a signature from `bytes`, the first `sig_size` bytes (or
    /// fewer, if the file is shorter) of a file whose total length is
    /// `file_len`.
    pub fn capture(bytes: &[u8], sig_size: u64, file_len: u64) -> Self {
        let cap = sig_size.max(MIN_SIGNATURE_SIZE).min(file_len) as usize;
        let prefix = &bytes[..cap.min(bytes.len())];
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        prefix.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            prefix_len: prefix.len() as u64,
            file_len_at_capture: file_len,
        }
    }

    /// Compares this signature against a fresh read of the same byte range
    /// from the (possibly changed) file, whose current length is `new_len`.
    pub fn check(&self, fresh_prefix: &[u8], new_len: u64) -> SignatureCheck {
        if new_len < self.prefix_len {
            return SignatureCheck::TooShort;
        }
        let cap = (self.prefix_len as usize).min(fresh_prefix.len());
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        fresh_prefix[..cap].hash(&mut hasher);
        if hasher.finish() != self.hash || cap as u64 != self.prefix_len {
            return SignatureCheck::PrefixDiffers;
        }
        if new_len > self.file_len_at_capture {
            SignatureCheck::EqualSizeGrew
        } else {
            SignatureCheck::EqualSameSize
        }
    }
}

/// Durable per-reader position record. Persisted by the checkpoint store and
/// restored on restart to resume exactly where a reader left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub dev_inode: DevInode,
    pub signature: FileSignature,
    pub read_offset: u64,
    pub real_path: String,
    pub config_name: String,
    pub last_update_epoch: u64,
}

impl Checkpoint {
    pub fn now_epoch() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A stable, ordered set of tags shared by every event in a batch. Wrapped in
/// `Arc` so batching can compare and clone tag-sets without copying their
/// contents.
pub type TagSet = Arc<BTreeMap<String, String>>;

pub fn tag_hash(tags: &TagSet) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (k, v) in tags.iter() {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}

/// One immutable logical record, produced by the multiline splitter and
/// tagged by the reader that produced it. The payload is shared so batching
/// can defer copies until a batch is actually assembled.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: SystemTime,
    pub tags: TagSet,
    pub payload: Arc<[u8]>,
    pub source_offset: u64,
    pub source_inode: DevInode,
}

impl Event {
    pub fn tag_hash(&self) -> u64 {
        tag_hash(&self.tags)
    }
}

/// A group of events sharing an identical tag-set, sized by the batcher.
#[derive(Debug, Clone)]
pub struct Batch {
    pub tag_hash: u64,
    pub tag_set: TagSet,
    pub events: Vec<Event>,
    pub aggregate_bytes: usize,
    pub source_buffers: Vec<Arc<[u8]>>,
    pub exactly_once_checkpoint: Checkpoint,
    pub pack_id_prefix: String,
}

impl Batch {
    /// Builds a batch from events that all share one tag-set, checkpointed
    /// against the oldest event's source position.
    pub fn new(tag_set: TagSet, events: Vec<Event>, checkpoint: Checkpoint, pack_id_prefix: String) -> Self {
        let aggregate_bytes = events.iter().map(|e| e.payload.len()).sum();
        let source_buffers = events.iter().map(|e| e.payload.clone()).collect();
        Self {
            tag_hash: tag_hash(&tag_set),
            tag_set,
            events,
            aggregate_bytes,
            source_buffers,
            exactly_once_checkpoint: checkpoint,
            pack_id_prefix,
        }
    }
}

/// Second-level union of batches with distinct tag-sets, used to amortise
/// per-batch overhead on low-rate streams.
#[derive(Debug, Clone)]
pub struct GroupBatch {
    pub batches: Vec<Batch>,
    pub total_bytes: usize,
}

impl GroupBatch {
    pub fn from_batches(batches: Vec<Batch>) -> Self {
        let total_bytes = batches.iter().map(|b| b.aggregate_bytes).sum();
        Self { batches, total_bytes }
    }
}

/// Stable identifier of a `(config, sink)` admission channel. All admission
/// control — back-pressure, sender queues, timeout flush scheduling — is
/// keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey(pub u64);

impl QueueKey {
    pub fn new(config_name: &str, sink_identity: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        config_name.hash(&mut hasher);
        sink_identity.hash(&mut hasher);
        Self(hasher.finish())
    }
}
