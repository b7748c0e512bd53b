//! Checkpoint store: durable, write-behind record of each reader's position,
//! keyed by filesystem identity and signature so a restart resumes exactly
//! where it left off even across a rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::model::{Checkpoint, DevInode};

/// Write-behind checkpoint store. [`CheckpointStore::update`] only updates
/// the in-memory view and marks the store dirty; the on-disk file is
/// rewritten only by [`CheckpointStore::flush`], which the pipeline calls on
/// a `checkpoint_interval` timer and once more on clean shutdown. A crash
/// between flushes loses at most one interval's worth of checkpoint
/// progress, never more, and never corrupts the file since every flush
/// writes a temp file and renames it into place.
pub struct CheckpointStore {
    path: PathBuf,
    latest: RwLock<HashMap<DevInode, Checkpoint>>,
    dirty: AtomicBool,
}

impl CheckpointStore {
    /// Loads existing checkpoints from `path` (if present).
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut latest: HashMap<DevInode, Checkpoint> = HashMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (lineno, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Checkpoint>(line) {
                        Ok(cp) => {
                            latest.insert(cp.dev_inode, cp);
                        }
                        Err(e) => warn!(%lineno, error = %e, "skipping malformed checkpoint record"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no existing checkpoint file, starting fresh");
            }
            Err(e) => return Err(e).context(format!("reading checkpoint file {}", path.display())),
        }

        Ok(Self {
            path,
            latest: RwLock::new(latest),
            dirty: AtomicBool::new(false),
        })
    }

    /// Looks up the most recent checkpoint for a file identity, used by
    /// discovery to decide where a reopened reader should resume.
    pub fn lookup(&self, dev_inode: &DevInode) -> Option<Checkpoint> {
        self.latest.read().unwrap().get(dev_inode).cloned()
    }

    /// Records a new checkpoint in memory. Does not touch disk; callers must
    /// rely on [`CheckpointStore::flush`] (interval-driven or on shutdown)
    /// to persist it.
    pub async fn update(&self, checkpoint: Checkpoint) -> Result<()> {
        self.latest.write().unwrap().insert(checkpoint.dev_inode, checkpoint);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Rewrites the checkpoint file from the current in-memory view, one
    /// record per file identity, via a temp file plus rename so a crash
    /// mid-write never leaves a truncated or partially-written file behind.
    /// A no-op if nothing has changed since the last flush.
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let snapshot: Vec<Checkpoint> = self.latest.read().unwrap().values().cloned().collect();
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
        }

        let mut buf = String::new();
        for cp in &snapshot {
            buf.push_str(&serde_json::to_string(cp).context("serializing checkpoint")?);
            buf.push('\n');
        }

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, buf)
            .await
            .with_context(|| format!("writing checkpoint file {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("installing checkpoint file {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileSignature;

    fn sample_checkpoint(dev_inode: DevInode, offset: u64) -> Checkpoint {
        Checkpoint {
            dev_inode,
            signature: FileSignature::capture(b"abc", 1024, 3),
            read_offset: offset,
            real_path: "a.log".into(),
            config_name: "cfg".into(),
            last_update_epoch: Checkpoint::now_epoch(),
        }
    }

    #[tokio::test]
    async fn update_alone_does_not_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.ndjson");
        let dev_inode = DevInode::new(1, 42);

        let store = CheckpointStore::load(&path).await.unwrap();
        store.update(sample_checkpoint(dev_inode, 10)).await.unwrap();
        assert!(!path.exists(), "update is in-memory only until flush");
        assert_eq!(store.lookup(&dev_inode).unwrap().read_offset, 10);
    }

    #[tokio::test]
    async fn flush_persists_and_reload_sees_latest_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.ndjson");
        let dev_inode = DevInode::new(1, 42);

        {
            let store = CheckpointStore::load(&path).await.unwrap();
            store.update(sample_checkpoint(dev_inode, 10)).await.unwrap();
            store.update(sample_checkpoint(dev_inode, 25)).await.unwrap();
            store.flush().await.unwrap();
        }

        let reloaded = CheckpointStore::load(&path).await.unwrap();
        let cp = reloaded.lookup(&dev_inode).unwrap();
        assert_eq!(cp.read_offset, 25);
    }

    #[tokio::test]
    async fn flush_writes_one_record_per_file_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.ndjson");
        let dev_inode = DevInode::new(1, 7);

        let store = CheckpointStore::load(&path).await.unwrap();
        for offset in [1, 2, 3] {
            store.update(sample_checkpoint(dev_inode, offset)).await.unwrap();
        }
        store.flush().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn flush_without_updates_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.ndjson");
        let store = CheckpointStore::load(&path).await.unwrap();
        store.flush().await.unwrap();
        assert!(!path.exists(), "nothing was ever dirty, flush writes nothing");
    }
}
