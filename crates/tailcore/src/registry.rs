//! Reader registry: arena storage for live [`Reader`]s, indexed by a stable
//! id as well as by filesystem identity and logical path. A classic
//! free-list arena, so reader ids stay stable across rotation-driven
//! inserts and removes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::model::DevInode;
use crate::reader::Reader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(pub usize);

enum Slot {
    Occupied(Reader),
    Free(Option<usize>),
}

struct Inner {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    by_dev_inode: HashMap<DevInode, ReaderId>,
    by_path: HashMap<PathBuf, ReaderId>,
}

/// Thread-safe arena of open readers. Readers are inserted once per opened
/// file and removed once the rotation tracker force-closes them.
pub struct ReaderRegistry {
    inner: RwLock<Inner>,
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                slots: Vec::new(),
                free_head: None,
                by_dev_inode: HashMap::new(),
                by_path: HashMap::new(),
            }),
        }
    }
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next stable id a reader will be inserted under, without
    /// requiring the reader itself (which needs its id to construct).
    pub fn reserve_id(&self) -> ReaderId {
        let inner = self.inner.write().unwrap();
        match inner.free_head {
            Some(idx) => ReaderId(idx),
            None => ReaderId(inner.slots.len()),
        }
    }

    pub fn insert(&self, dev_inode: DevInode, path: PathBuf, reader: Reader) -> ReaderId {
        let mut inner = self.inner.write().unwrap();
        let id = match inner.free_head {
            Some(idx) => {
                inner.free_head = match inner.slots[idx] {
                    Slot::Free(next) => next,
                    Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
                };
                inner.slots[idx] = Slot::Occupied(reader);
                ReaderId(idx)
            }
            None => {
                inner.slots.push(Slot::Occupied(reader));
                ReaderId(inner.slots.len() - 1)
            }
        };
        inner.by_dev_inode.insert(dev_inode, id);
        inner.by_path.insert(path, id);
        id
    }

    pub fn remove(&self, id: ReaderId) -> Option<Reader> {
        let mut inner = self.inner.write().unwrap();
        let prev_free_head = inner.free_head;
        let slot = inner.slots.get_mut(id.0)?;
        let taken = match std::mem::replace(slot, Slot::Free(prev_free_head)) {
            Slot::Occupied(reader) => reader,
            Slot::Free(_) => return None,
        };
        inner.free_head = Some(id.0);
        inner.by_dev_inode.retain(|_, v| *v != id);
        inner.by_path.retain(|_, v| *v != id);
        Some(taken)
    }

    /// Rebinds `id`'s logical-path index entry to `new_path` without
    /// touching the reader or its device/inode index. Used when the
    /// rotation tracker promotes a previously rotated-out reader back into
    /// active use at the path its file reappeared under.
    pub fn rebind_path(&self, id: ReaderId, new_path: PathBuf) {
        let mut inner = self.inner.write().unwrap();
        inner.by_path.retain(|_, v| *v != id);
        inner.by_path.insert(new_path, id);
    }

    pub fn by_dev_inode(&self, dev_inode: &DevInode) -> Option<ReaderId> {
        self.inner.read().unwrap().by_dev_inode.get(dev_inode).copied()
    }

    pub fn by_path(&self, path: &std::path::Path) -> Option<ReaderId> {
        self.inner.read().unwrap().by_path.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_dev_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the reader at `id`, if still present. Holds the
    /// registry's write lock for the duration, matching the single-owner
    /// access model: only one task drives a given reader at a time.
    pub fn with_reader_mut<R>(&self, id: ReaderId, f: impl FnOnce(&mut Reader) -> R) -> Option<R> {
        let mut inner = self.inner.write().unwrap();
        match inner.slots.get_mut(id.0) {
            Some(Slot::Occupied(reader)) => Some(f(reader)),
            _ => None,
        }
    }

    pub fn all_ids(&self) -> Vec<ReaderId> {
        self.inner.read().unwrap().by_dev_inode.values().copied().collect()
    }
}
