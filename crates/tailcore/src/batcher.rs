//! Batcher: accumulates events sharing a tag-set into a [`Batch`], flushing
//! on whichever of size, byte count, or timeout is hit first. Timeout
//! flushing itself is driven externally by [`crate::timer::TimeoutScheduler`].

use crate::model::{Batch, Checkpoint, Event, QueueKey, TagSet};

pub struct BatcherLimits {
    pub max_batch_docs: usize,
    pub max_batch_bytes: usize,
}

/// One open batch-in-progress for a single tag-set.
struct OpenBatch {
    tag_set: TagSet,
    events: Vec<Event>,
    bytes: usize,
    checkpoint: Checkpoint,
}

/// Accumulates events per queue key and tag-set, and decides when an open
/// batch should close. The caller owns the mapping from reader to queue key
/// and calls [`Batcher::push`] once per produced event.
pub struct Batcher {
    limits: BatcherLimits,
    open: std::collections::HashMap<(QueueKey, u64), OpenBatch>,
    pack_id_prefix: String,
}

impl Batcher {
    pub fn new(limits: BatcherLimits, pack_id_prefix: impl Into<String>) -> Self {
        Self {
            limits,
            open: std::collections::HashMap::new(),
            pack_id_prefix: pack_id_prefix.into(),
        }
    }

    /// Adds one event to its queue key's open batch, keyed further by the
    /// event's tag hash so events with distinct tag-sets under the same
    /// queue key never mix into one batch. Returns a completed batch if
    /// this push crossed a size or byte limit.
    ///
    /// The batch's committed checkpoint is always the one carried by the
    /// *first* event folded into it, never a later one: a later event's
    /// offset has not necessarily been durably delivered yet, so committing
    /// it early could skip bytes on a crash before the batch is acked.
    pub fn push(&mut self, queue_key: QueueKey, event: Event, checkpoint: Checkpoint) -> Option<Batch> {
        let tag_hash = event.tag_hash();
        let entry = self
            .open
            .entry((queue_key, tag_hash))
            .or_insert_with(|| OpenBatch {
                tag_set: event.tags.clone(),
                events: Vec::new(),
                bytes: 0,
                checkpoint,
            });

        entry.bytes += event.payload.len();
        entry.events.push(event);

        if entry.events.len() >= self.limits.max_batch_docs || entry.bytes >= self.limits.max_batch_bytes {
            self.close(queue_key, tag_hash)
        } else {
            None
        }
    }

    /// Force-closes the open batch for `(queue_key, tag_hash)`, e.g. because
    /// the timeout scheduler fired for its queue key. Returns `None` if
    /// there was nothing open.
    pub fn flush_one(&mut self, queue_key: QueueKey, tag_hash: u64) -> Option<Batch> {
        self.close(queue_key, tag_hash)
    }

    /// Force-closes every open batch under a queue key, used when its
    /// timeout fires: every tag-set sharing that sink gets flushed together.
    pub fn flush_key(&mut self, queue_key: QueueKey) -> Vec<Batch> {
        let hashes: Vec<u64> = self
            .open
            .keys()
            .filter(|(k, _)| *k == queue_key)
            .map(|(_, h)| *h)
            .collect();
        hashes
            .into_iter()
            .filter_map(|h| self.close(queue_key, h))
            .collect()
    }

    pub fn has_open_batch(&self, queue_key: QueueKey) -> bool {
        self.open.keys().any(|(k, _)| *k == queue_key)
    }

    fn close(&mut self, queue_key: QueueKey, tag_hash: u64) -> Option<Batch> {
        let open = self.open.remove(&(queue_key, tag_hash))?;
        if open.events.is_empty() {
            return None;
        }
        Some(Batch::new(open.tag_set, open.events, open.checkpoint, self.pack_id_prefix.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DevInode, FileSignature};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::SystemTime;

    fn event(tags: TagSet, payload: &[u8]) -> Event {
        Event {
            timestamp: SystemTime::now(),
            tags,
            payload: Arc::from(payload),
            source_offset: 0,
            source_inode: DevInode::new(1, 1),
        }
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            dev_inode: DevInode::new(1, 1),
            signature: FileSignature::capture(b"x", 1024, 1),
            read_offset: 0,
            real_path: "a.log".into(),
            config_name: "cfg".into(),
            last_update_epoch: 0,
        }
    }

    #[test]
    fn closes_on_doc_count() {
        let mut batcher = Batcher::new(
            BatcherLimits {
                max_batch_docs: 2,
                max_batch_bytes: usize::MAX,
            },
            "p-",
        );
        let tags: TagSet = Arc::new(BTreeMap::new());
        let key = QueueKey(1);
        assert!(batcher.push(key, event(tags.clone(), b"a"), checkpoint()).is_none());
        let batch = batcher.push(key, event(tags.clone(), b"b"), checkpoint()).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert!(!batcher.has_open_batch(key));
    }

    #[test]
    fn distinct_tag_sets_do_not_mix() {
        let mut batcher = Batcher::new(
            BatcherLimits {
                max_batch_docs: 100,
                max_batch_bytes: usize::MAX,
            },
            "p-",
        );
        let tags_a: TagSet = Arc::new(BTreeMap::from([("k".into(), "a".into())]));
        let tags_b: TagSet = Arc::new(BTreeMap::from([("k".into(), "b".into())]));
        let key = QueueKey(1);
        batcher.push(key, event(tags_a.clone(), b"a"), checkpoint());
        batcher.push(key, event(tags_b.clone(), b"b"), checkpoint());

        let flushed = batcher.flush_key(key);
        assert_eq!(flushed.len(), 2);
    }
}
