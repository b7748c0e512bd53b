//! Discovery handler: polls configured directories for matching files,
//! tracks which logical path currently maps to which file identity, and
//! drives reader open/rotate/close transitions from what it observes.
//! Identity tracking is polling-plus-dev/inode based rather than relying on
//! OS file-change notifications.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::matcher::PathMatcher;
use crate::model::{DevInode, FileSignature, SignatureCheck, MIN_SIGNATURE_SIZE};
use crate::reader::{Reader, ReaderConfig};
use crate::registry::{ReaderId, ReaderRegistry};
use crate::rotation::RotationTracker;

fn stat_dev_inode(path: &std::path::Path) -> std::io::Result<(DevInode, u64)> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path)?;
        Ok((DevInode::new(meta.dev(), meta.ino()), meta.len()))
    }
    #[cfg(not(unix))]
    {
        // No stable inode on this platform; identity degrades to path plus
        // length, which cannot detect same-name truncate-in-place rotation.
        let meta = std::fs::metadata(path)?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        path.hash(&mut hasher);
        Ok((DevInode::new(0, hasher.finish()), meta.len()))
    }
}

/// What discovery observed for one logical (configured) path this poll.
enum Transition {
    Unchanged,
    NewFile { dev_inode: DevInode, len: u64 },
    Rotated { old: ReaderId, dev_inode: DevInode, len: u64 },
}

pub struct DiscoveryConfig {
    pub config_name: String,
    pub reader_factory: ReaderConfig,
    pub signature_size: u64,
    pub tail_new_files_from_end: bool,
    pub rotation_queue_size: usize,
    pub rotation_retain: Duration,
    pub file_deleted_retain: Duration,
    pub max_readers: Option<usize>,
}

/// Polls a [`PathMatcher`] on a fixed interval and keeps the reader registry
/// in sync with what is currently on disk.
pub struct DiscoveryHandler {
    matcher: PathMatcher,
    config: DiscoveryConfig,
    registry: Arc<ReaderRegistry>,
    checkpoints: Arc<CheckpointStore>,
    rotation: RotationTracker,
    known: HashMap<PathBuf, DevInode>,
    /// Paths tracked in `known` that vanished from the most recent scan,
    /// timestamped so they can be retired once `file_deleted_retain` elapses.
    missing_since: HashMap<PathBuf, Instant>,
}

impl DiscoveryHandler {
    pub fn new(
        matcher: PathMatcher,
        config: DiscoveryConfig,
        registry: Arc<ReaderRegistry>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let rotation = RotationTracker::new(config.rotation_queue_size, config.rotation_retain);
        Self {
            matcher,
            config,
            registry,
            checkpoints,
            rotation,
            known: HashMap::new(),
            missing_since: HashMap::new(),
        }
    }

    /// Runs one discovery pass: scans for matching files, opens readers for
    /// new ones, retires readers whose logical path now points at a
    /// different file, and sweeps expired rotated readers.
    pub async fn poll(&mut self) -> Result<Vec<ReaderId>> {
        let mut newly_closed = Vec::new();
        let paths = self
            .matcher
            .scan()
            .with_context(|| format!("scanning {}", self.matcher.base_dir().display()))?;
        let seen: HashSet<&PathBuf> = paths.iter().collect();

        for path in &paths {
            self.missing_since.remove(path);
            match self.classify(path) {
                Ok(Transition::Unchanged) => {}
                Ok(Transition::NewFile { dev_inode, len }) => {
                    if let Some(cap) = self.config.max_readers {
                        if self.registry.len() >= cap {
                            debug!(path = %path.display(), cap, "max_readers reached, deferring discovery of new file");
                            continue;
                        }
                    }
                    if let Err(e) = self.attach(path.clone(), dev_inode, len).await {
                        warn!(path = %path.display(), error = %e, "failed to open discovered file");
                        continue;
                    }
                    self.known.insert(path.clone(), dev_inode);
                }
                Ok(Transition::Rotated { old, dev_inode, len }) => {
                    info!(path = %path.display(), "rotation detected for logical path");
                    let evicted = self.rotation.retire(&path.to_string_lossy(), old, self.known[path]);
                    newly_closed.extend(evicted);
                    if let Err(e) = self.attach(path.clone(), dev_inode, len).await {
                        warn!(path = %path.display(), error = %e, "failed to reopen rotated file");
                        continue;
                    }
                    self.known.insert(path.clone(), dev_inode);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "stat failed during discovery, skipping this pass");
                }
            }
        }

        // A known path that vanished from the scan entirely (deleted, not
        // replaced) is marked deleted and drains until file_deleted_retain
        // elapses, per the missing-file retirement rule; it is not force
        // closed immediately since it may still hold unread bytes.
        let missing_paths: Vec<PathBuf> = self
            .known
            .keys()
            .filter(|p| !seen.contains(p))
            .cloned()
            .collect();
        let now = Instant::now();
        for path in missing_paths {
            let since = *self.missing_since.entry(path.clone()).or_insert(now);
            if now.duration_since(since) >= self.config.file_deleted_retain {
                if let Some(id) = self.registry.by_path(&path) {
                    info!(path = %path.display(), "missing file retirement elapsed, closing reader");
                    newly_closed.push(id);
                }
                self.known.remove(&path);
                self.missing_since.remove(&path);
            }
        }

        // A logical path that vanished from the scan (deleted or moved out
        // of the matcher's scope) still has its reader drained by rotation
        // retention; discovery itself does not force-close on disappearance
        // alone, since the file may still have unread bytes.
        newly_closed.extend(self.rotation.sweep_expired());
        Ok(newly_closed)
    }

    /// Consults the rotation tracker before opening a brand new reader: if
    /// this exact `dev_inode` still has a rotated-out-but-undrained reader
    /// on file, that reader is reattached at its current path rather than
    /// reopened from scratch, since it is literally the same file.
    async fn attach(&mut self, path: PathBuf, dev_inode: DevInode, len: u64) -> Result<ReaderId> {
        if let Some(id) = self.rotation.promote(dev_inode) {
            info!(path = %path.display(), "reattaching previously rotated-out reader for the same file");
            self.registry.rebind_path(id, path);
            return Ok(id);
        }
        self.open_new(path, dev_inode, len).await
    }

    fn classify(&self, path: &std::path::Path) -> std::io::Result<Transition> {
        let (dev_inode, len) = stat_dev_inode(path)?;
        match self.known.get(path) {
            None => Ok(Transition::NewFile { dev_inode, len }),
            Some(prev) if *prev == dev_inode => Ok(Transition::Unchanged),
            Some(_) => {
                let old = self
                    .registry
                    .by_path(path)
                    .expect("known path must have a registered reader");
                Ok(Transition::Rotated { old, dev_inode, len })
            }
        }
    }

    async fn open_new(&self, path: PathBuf, dev_inode: DevInode, len: u64) -> Result<ReaderId> {
        let prefix = read_prefix_for_signature(&path, self.config.signature_size)?;
        let checkpoint = self.checkpoints.lookup(&dev_inode);

        // A matching DevInode alone is not sufficient to trust a checkpoint:
        // the device/inode pair can be reused for an unrelated file once the
        // original is deleted. Only resume at the checkpointed offset when
        // the file's current prefix still matches the signature recorded
        // alongside it; any mismatch restarts this file from scratch.
        let resumed = checkpoint.as_ref().and_then(|cp| match cp.signature.check(&prefix, len) {
            SignatureCheck::EqualSameSize | SignatureCheck::EqualSizeGrew => Some((cp.read_offset, cp.signature)),
            SignatureCheck::PrefixDiffers | SignatureCheck::TooShort => None,
        });

        let (start_offset, signature) = match resumed {
            Some(resumed) => resumed,
            None => {
                let offset = if self.config.tail_new_files_from_end { len } else { 0 };
                (offset, FileSignature::capture(&prefix, self.config.signature_size, len))
            }
        };

        // reserve_id() and insert() must not interleave with another
        // registry mutation in between, or the id handed to the reader
        // could diverge from the id insert() actually assigns it. Discovery
        // runs single-threaded and awaits this whole call before moving to
        // the next path, so that holds here.
        let id = self.registry.reserve_id();
        let reader = Reader::open(
            id,
            path.clone(),
            dev_inode,
            start_offset,
            signature,
            clone_reader_config(&self.config.reader_factory),
        )
        .await
        .with_context(|| format!("opening reader for {}", path.display()))?;

        Ok(self.registry.insert(dev_inode, path, reader))
    }
}

fn read_prefix_for_signature(path: &std::path::Path, configured_size: u64) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let cap = configured_size.max(MIN_SIGNATURE_SIZE) as usize;
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; cap];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn clone_reader_config(config: &ReaderConfig) -> ReaderConfig {
    ReaderConfig {
        tags: config.tags.clone(),
        config_name: config.config_name.clone(),
        encoding: config.encoding,
        splitter_mode: config.splitter_mode.clone(),
        max_record_lines: config.max_record_lines,
        max_record_bytes: config.max_record_bytes,
        container_framing: config.container_framing,
        emit_file_offset_tag: config.emit_file_offset_tag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_log::ContainerLogFraming;
    use crate::encoding::SourceEncoding;
    use crate::splitter::SplitterMode;
    use std::collections::BTreeMap;

    fn factory() -> ReaderConfig {
        ReaderConfig {
            tags: Arc::new(BTreeMap::new()),
            config_name: "cfg".into(),
            encoding: SourceEncoding::Utf8,
            splitter_mode: SplitterMode::SingleLine,
            max_record_lines: 100,
            max_record_bytes: 1 << 20,
            container_framing: ContainerLogFraming::None,
            emit_file_offset_tag: false,
        }
    }

    #[tokio::test]
    async fn discovers_and_opens_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), b"hello\n").unwrap();
        let matcher = PathMatcher::new(dir.path(), "*.log", 0).unwrap();
        let registry = Arc::new(ReaderRegistry::new());
        let checkpoints = Arc::new(
            CheckpointStore::load(dir.path().join("checkpoints.ndjson"))
                .await
                .unwrap(),
        );
        let mut handler = DiscoveryHandler::new(
            matcher,
            DiscoveryConfig {
                config_name: "cfg".into(),
                reader_factory: factory(),
                signature_size: 1024,
                tail_new_files_from_end: false,
                rotation_queue_size: 3,
                rotation_retain: Duration::from_secs(60),
                file_deleted_retain: Duration::from_secs(900),
                max_readers: None,
            },
            registry.clone(),
            checkpoints,
        );

        handler.poll().await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn detects_rotation_by_inode_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"old\n").unwrap();
        let matcher = PathMatcher::new(dir.path(), "*.log", 0).unwrap();
        let registry = Arc::new(ReaderRegistry::new());
        let checkpoints = Arc::new(
            CheckpointStore::load(dir.path().join("checkpoints.ndjson"))
                .await
                .unwrap(),
        );
        let mut handler = DiscoveryHandler::new(
            matcher,
            DiscoveryConfig {
                config_name: "cfg".into(),
                reader_factory: factory(),
                signature_size: 1024,
                tail_new_files_from_end: false,
                rotation_queue_size: 3,
                rotation_retain: Duration::from_secs(60),
                file_deleted_retain: Duration::from_secs(900),
                max_readers: None,
            },
            registry.clone(),
            checkpoints,
        );
        handler.poll().await.unwrap();
        assert_eq!(registry.len(), 1);

        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"new\n").unwrap();
        handler.poll().await.unwrap();
        assert_eq!(registry.len(), 2, "old reader retained until retention sweep");
    }

    #[tokio::test]
    async fn retires_reader_after_file_deleted_retain_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"hello\n").unwrap();
        let matcher = PathMatcher::new(dir.path(), "*.log", 0).unwrap();
        let registry = Arc::new(ReaderRegistry::new());
        let checkpoints = Arc::new(
            CheckpointStore::load(dir.path().join("checkpoints.ndjson"))
                .await
                .unwrap(),
        );
        let mut handler = DiscoveryHandler::new(
            matcher,
            DiscoveryConfig {
                config_name: "cfg".into(),
                reader_factory: factory(),
                signature_size: 1024,
                tail_new_files_from_end: false,
                rotation_queue_size: 3,
                rotation_retain: Duration::from_secs(60),
                file_deleted_retain: Duration::from_millis(10),
                max_readers: None,
            },
            registry.clone(),
            checkpoints,
        );
        handler.poll().await.unwrap();
        assert_eq!(registry.len(), 1);

        std::fs::remove_file(&path).unwrap();
        let closed = handler.poll().await.unwrap();
        assert!(closed.is_empty(), "retain window has not elapsed yet");

        std::thread::sleep(Duration::from_millis(20));
        let closed = handler.poll().await.unwrap();
        assert_eq!(closed.len(), 1, "deleted file's reader retires once retain elapses");
    }

    #[tokio::test]
    async fn max_readers_defers_new_file_discovery() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), b"a\n").unwrap();
        std::fs::write(dir.path().join("b.log"), b"b\n").unwrap();
        let matcher = PathMatcher::new(dir.path(), "*.log", 0).unwrap();
        let registry = Arc::new(ReaderRegistry::new());
        let checkpoints = Arc::new(
            CheckpointStore::load(dir.path().join("checkpoints.ndjson"))
                .await
                .unwrap(),
        );
        let mut handler = DiscoveryHandler::new(
            matcher,
            DiscoveryConfig {
                config_name: "cfg".into(),
                reader_factory: factory(),
                signature_size: 1024,
                tail_new_files_from_end: false,
                rotation_queue_size: 3,
                rotation_retain: Duration::from_secs(60),
                file_deleted_retain: Duration::from_secs(900),
                max_readers: Some(1),
            },
            registry.clone(),
            checkpoints,
        );
        handler.poll().await.unwrap();
        assert_eq!(registry.len(), 1, "second file deferred by max_readers cap");
    }
}
