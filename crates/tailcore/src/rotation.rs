//! Rotation tracker: keeps the handful of recently-rotated readers for a
//! logical path alive long enough to drain their remaining bytes, then force
//! closes them. A small bounded collection of handles, reaped on a timer.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::model::DevInode;
use crate::registry::ReaderId;

struct TrackedReader {
    id: ReaderId,
    dev_inode: DevInode,
    retired_at: Instant,
}

/// One logical log path's ordered history of readers: the current, actively
/// tailed reader plus up to `capacity` stale readers left over from prior
/// rotations, oldest first.
pub struct RotationArray {
    capacity: usize,
    retain: std::time::Duration,
    history: VecDeque<TrackedReader>,
}

impl RotationArray {
    pub fn new(capacity: usize, retain: std::time::Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retain,
            history: VecDeque::new(),
        }
    }

    /// Records that `id` has just been superseded by a newer reader for the
    /// same logical path. Returns any reader ids that must be force-closed
    /// immediately to respect the capacity bound.
    pub fn retire(&mut self, id: ReaderId, dev_inode: DevInode) -> Vec<ReaderId> {
        self.history.push_back(TrackedReader {
            id,
            dev_inode,
            retired_at: Instant::now(),
        });
        let mut evicted = Vec::new();
        while self.history.len() > self.capacity {
            if let Some(oldest) = self.history.pop_front() {
                evicted.push(oldest.id);
            }
        }
        evicted
    }

    /// Removes and returns the id of a still-tracked reader for `dev_inode`,
    /// if one is held. The caller reattaches that reader to live use instead
    /// of opening a new one, since it is the exact same file.
    pub fn promote(&mut self, dev_inode: DevInode) -> Option<ReaderId> {
        let idx = self.history.iter().position(|t| t.dev_inode == dev_inode)?;
        self.history.remove(idx).map(|t| t.id)
    }

    /// Returns reader ids that have outlived `retain` and should be closed,
    /// removing them from tracking.
    pub fn sweep_expired(&mut self) -> Vec<ReaderId> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.history.retain(|tracked| {
            if now.duration_since(tracked.retired_at) >= self.retain {
                expired.push(tracked.id);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Tracks one [`RotationArray`] per logical path.
#[derive(Default)]
pub struct RotationTracker {
    capacity: usize,
    retain: std::time::Duration,
    by_path: HashMap<String, RotationArray>,
}

impl RotationTracker {
    pub fn new(capacity: usize, retain: std::time::Duration) -> Self {
        Self {
            capacity,
            retain,
            by_path: HashMap::new(),
        }
    }

    pub fn retire(&mut self, logical_path: &str, id: ReaderId, dev_inode: DevInode) -> Vec<ReaderId> {
        self.by_path
            .entry(logical_path.to_string())
            .or_insert_with(|| RotationArray::new(self.capacity, self.retain))
            .retire(id, dev_inode)
    }

    pub fn sweep_expired(&mut self) -> Vec<ReaderId> {
        let mut expired = Vec::new();
        for array in self.by_path.values_mut() {
            expired.extend(array.sweep_expired());
        }
        self.by_path.retain(|_, array| !array.is_empty());
        expired
    }

    /// Consults every tracked logical path for a still-held reader with
    /// `dev_inode`, removing and returning its id if found so the caller can
    /// promote it back into the registry instead of opening a new reader.
    pub fn promote(&mut self, dev_inode: DevInode) -> Option<ReaderId> {
        let found = self.by_path.values_mut().find_map(|array| array.promote(dev_inode));
        self.by_path.retain(|_, array| !array.is_empty());
        found
    }
}
