//! Group queue: unions batches with distinct tag-sets under the same queue
//! key into a [`GroupBatch`] before handing off to the sender, amortising
//! per-batch overhead on streams too sparse to fill a single tag-set's
//! batch on their own.

use crate::model::{Batch, GroupBatch, QueueKey};

pub struct GroupQueueLimits {
    pub max_group_batches: usize,
    pub max_group_bytes: usize,
}

struct OpenGroup {
    batches: Vec<Batch>,
    bytes: usize,
}

/// Accumulates finished [`Batch`]es per queue key until the group itself is
/// large enough to flush, or the caller forces a flush (e.g. on timeout).
pub struct GroupQueue {
    limits: GroupQueueLimits,
    open: std::collections::HashMap<QueueKey, OpenGroup>,
}

impl GroupQueue {
    pub fn new(limits: GroupQueueLimits) -> Self {
        Self {
            limits,
            open: std::collections::HashMap::new(),
        }
    }

    /// Adds a completed batch to its queue key's open group. Returns a
    /// finished group if this push crossed a size limit.
    pub fn push(&mut self, key: QueueKey, batch: Batch) -> Option<GroupBatch> {
        let bytes = batch.aggregate_bytes;
        let group = self.open.entry(key).or_insert_with(|| OpenGroup {
            batches: Vec::new(),
            bytes: 0,
        });
        group.bytes += bytes;
        group.batches.push(batch);

        if group.batches.len() >= self.limits.max_group_batches || group.bytes >= self.limits.max_group_bytes {
            self.close(key)
        } else {
            None
        }
    }

    pub fn flush(&mut self, key: QueueKey) -> Option<GroupBatch> {
        self.close(key)
    }

    pub fn has_open_group(&self, key: QueueKey) -> bool {
        self.open.contains_key(&key)
    }

    fn close(&mut self, key: QueueKey) -> Option<GroupBatch> {
        let group = self.open.remove(&key)?;
        if group.batches.is_empty() {
            return None;
        }
        Some(GroupBatch::from_batches(group.batches))
    }
}
