//! Per-file reader state machine: owns one open file handle, tracks its read
//! offset and signature, and turns raw bytes into [`Event`]s. Resumable and
//! rotation-aware: a reader never assumes it is reading a file for the first
//! time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

use crate::container_log::{ContainerLogDecoder, ContainerLogFraming};
use crate::encoding::SourceEncoding;
use crate::model::{DevInode, Event, FileSignature, TagSet, MIN_SIGNATURE_SIZE};
use crate::splitter::{Splitter, SplitterMode};

/// What a zero-byte read at `check_rotation_on_eof` found underneath the reader.
enum EofOutcome {
    AtEof,
    Rotated,
    TruncatedInPlace,
}

/// Result of one read attempt against a reader.
pub enum ReadOutcome {
    /// Zero or more complete records were produced.
    Produced(Vec<Event>),
    /// The downstream sink's queue is saturated; the caller should back off
    /// and retry this reader later without advancing its offset.
    WouldBlock,
    /// No new bytes are currently available.
    AtEof,
    /// The file's signature no longer matches what this reader expects —
    /// the caller should close this reader and let discovery reopen it.
    Rotated,
    /// An unrecoverable I/O error occurred; the reader should be dropped.
    Fatal(std::io::ErrorKind),
}

pub struct ReaderConfig {
    pub tags: TagSet,
    pub config_name: String,
    pub encoding: SourceEncoding,
    pub splitter_mode: SplitterMode,
    pub max_record_lines: usize,
    pub max_record_bytes: usize,
    pub container_framing: ContainerLogFraming,
    pub emit_file_offset_tag: bool,
}

/// Owns one open file handle and the state needed to resume reading it
/// exactly where a previous reader (or a restored checkpoint) left off.
pub struct Reader {
    pub id: crate::registry::ReaderId,
    pub path: PathBuf,
    pub dev_inode: DevInode,
    file: File,
    offset: u64,
    signature: FileSignature,
    splitter: Splitter,
    container: Option<ContainerLogDecoder>,
    encoding: SourceEncoding,
    tags: TagSet,
    config_name: String,
    carry: Vec<u8>,
    emit_file_offset_tag: bool,
}

const READ_CHUNK: usize = 64 * 1024;

impl Reader {
    pub async fn open(
        id: crate::registry::ReaderId,
        path: PathBuf,
        dev_inode: DevInode,
        start_offset: u64,
        signature: FileSignature,
        config: ReaderConfig,
    ) -> Result<Self> {
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("opening log file {}", path.display()))?;
        file.seek(std::io::SeekFrom::Start(start_offset))
            .await
            .with_context(|| format!("seeking {} to offset {start_offset}", path.display()))?;

        let container = match config.container_framing {
            ContainerLogFraming::None => None,
            other => Some(ContainerLogDecoder::new(other)),
        };

        Ok(Self {
            id,
            path,
            dev_inode,
            file,
            offset: start_offset,
            signature,
            splitter: Splitter::new(config.splitter_mode, config.max_record_lines, config.max_record_bytes),
            container,
            encoding: config.encoding,
            tags: config.tags,
            config_name: config.config_name,
            carry: Vec::new(),
            emit_file_offset_tag: config.emit_file_offset_tag,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn signature(&self) -> FileSignature {
        self.signature
    }

    /// Reads up to one chunk of new bytes, splits it into lines, and runs
    /// each line through container unwrapping and multiline joining.
    pub async fn poll_read(&mut self) -> ReadOutcome {
        let mut chunk = vec![0u8; READ_CHUNK];
        let n = match self.file.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
            Err(e) => return ReadOutcome::Fatal(e.kind()),
        };
        if n == 0 {
            match self.check_rotation_on_eof().await {
                EofOutcome::AtEof => return ReadOutcome::AtEof,
                EofOutcome::Rotated => return ReadOutcome::Rotated,
                EofOutcome::TruncatedInPlace => {
                    if let Err(e) = self.reset_after_truncation().await {
                        return ReadOutcome::Fatal(e.kind());
                    }
                    return ReadOutcome::AtEof;
                }
            }
        }
        chunk.truncate(n);
        self.carry.extend_from_slice(&chunk);

        let mut events = Vec::new();
        while let Some(newline_pos) = self.encoding.find_newline(&self.carry) {
            let newline_width = self.encoding.newline_byte_width();
            let raw_line: Vec<u8> = self.carry.drain(..=newline_pos).collect();
            let raw_line = &raw_line[..raw_line.len() - newline_width];
            let consumed = raw_line.len() as u64 + newline_width as u64;

            let (decoded, _had_errors) = self.encoding.decode(raw_line);

            let unwrapped = match &mut self.container {
                Some(decoder) => decoder.feed_line(&decoded),
                None => Some((crate::container_log::Stream::Stdout, decoded)),
            };

            self.offset += consumed;

            let Some((_stream, line)) = unwrapped else {
                continue;
            };

            for record in self.splitter.feed_line(&line) {
                events.push(self.make_event(record));
            }
        }

        ReadOutcome::Produced(events)
    }

    /// A zero-byte read at a position below the on-disk file size means
    /// something changed underneath this reader between its last read and
    /// this one. Two distinct cases need different handling: the inode
    /// changed (a new file now sits at this path, e.g. copy-then-truncate
    /// rotation — discovery owns reopening that) versus the inode is
    /// unchanged but the file is now shorter than this reader's offset
    /// (truncate-in-place — discovery's identity tracking never observes
    /// this, since the inode never changed, so the reader has to recover on
    /// its own).
    async fn check_rotation_on_eof(&self) -> EofOutcome {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(_) => return EofOutcome::AtEof,
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let current = DevInode::new(meta.dev(), meta.ino());
            if current != self.dev_inode {
                return EofOutcome::Rotated;
            }
        }
        if meta.len() < self.offset {
            return EofOutcome::TruncatedInPlace;
        }
        EofOutcome::AtEof
    }

    /// Recovers from an in-place truncation by seeking back to the start of
    /// the file and recapturing its signature, so the next `poll_read` call
    /// reads the writer's post-truncation bytes from offset 0 instead of
    /// treating the shorter file as exhausted forever.
    async fn reset_after_truncation(&mut self) -> std::io::Result<()> {
        use std::io::Read;
        warn!(path = %self.path.display(), offset = self.offset, "file truncated in place, resetting offset to 0");
        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        self.offset = 0;
        self.carry.clear();

        let cap = MIN_SIGNATURE_SIZE as usize;
        let mut std_file = std::fs::File::open(&self.path)?;
        let mut buf = vec![0u8; cap];
        let n = std_file.read(&mut buf)?;
        buf.truncate(n);
        self.signature = FileSignature::capture(&buf, MIN_SIGNATURE_SIZE, n as u64);
        Ok(())
    }

    /// Flushes any record still buffered in the splitter. Called when the
    /// rotation tracker is about to retire this reader so its tail isn't
    /// lost.
    pub fn drain_on_close(&mut self) -> Vec<Event> {
        self.splitter.flush().into_iter().map(|record| self.make_event(record)).collect()
    }

    fn make_event(&self, payload: String) -> Event {
        let tags = if self.emit_file_offset_tag {
            let mut with_offset = (*self.tags).clone();
            with_offset.insert("__file_offset__".to_string(), self.offset.to_string());
            Arc::new(with_offset)
        } else {
            self.tags.clone()
        };
        Event {
            timestamp: SystemTime::now(),
            tags,
            payload: Arc::from(payload.into_bytes().into_boxed_slice()),
            source_offset: self.offset,
            source_inode: self.dev_inode,
        }
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DevInode;
    use std::sync::Arc;

    fn real_dev_inode(path: &std::path::Path) -> DevInode {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path).unwrap();
        DevInode::new(meta.dev(), meta.ino())
    }

    async fn make_reader(path: PathBuf, content: &[u8]) -> Reader {
        let sig = FileSignature::capture(content, 1024, content.len() as u64);
        let dev_inode = real_dev_inode(&path);
        Reader::open(
            crate::registry::ReaderId(0),
            path,
            dev_inode,
            0,
            sig,
            ReaderConfig {
                tags: Arc::new(Default::default()),
                config_name: "test".into(),
                encoding: SourceEncoding::Utf8,
                splitter_mode: SplitterMode::SingleLine,
                max_record_lines: 100,
                max_record_bytes: 1 << 20,
                container_framing: ContainerLogFraming::None,
                emit_file_offset_tag: false,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn reads_complete_lines_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        tokio::fs::write(&path, b"line one\nline two\nincomple").await.unwrap();

        let mut reader = make_reader(path, b"line one\nline two\nincomple").await;
        match reader.poll_read().await {
            ReadOutcome::Produced(events) => {
                assert_eq!(events.len(), 2);
                assert_eq!(&*events[0].payload, b"line one");
                assert_eq!(&*events[1].payload, b"line two");
            }
            other => panic!("expected Produced, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn emits_file_offset_tag_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        tokio::fs::write(&path, b"line one\nline two\n").await.unwrap();

        let sig = FileSignature::capture(b"x", 1024, 1);
        let dev_inode = real_dev_inode(&path);
        let mut reader = Reader::open(
            crate::registry::ReaderId(0),
            path,
            dev_inode,
            0,
            sig,
            ReaderConfig {
                tags: Arc::new(Default::default()),
                config_name: "test".into(),
                encoding: SourceEncoding::Utf8,
                splitter_mode: SplitterMode::SingleLine,
                max_record_lines: 100,
                max_record_bytes: 1 << 20,
                container_framing: ContainerLogFraming::None,
                emit_file_offset_tag: true,
            },
        )
        .await
        .unwrap();

        match reader.poll_read().await {
            ReadOutcome::Produced(events) => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].tags.get("__file_offset__").unwrap(), "9");
                assert_eq!(events[1].tags.get("__file_offset__").unwrap(), "19");
            }
            other => panic!("expected Produced, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_eof_when_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        tokio::fs::write(&path, b"only line\n").await.unwrap();

        let mut reader = make_reader(path, b"only line\n").await;
        let _ = reader.poll_read().await;
        match reader.poll_read().await {
            ReadOutcome::AtEof => {}
            other => panic!("expected AtEof, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovers_from_in_place_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.log");
        tokio::fs::write(&path, b"aaaa\nbbbb\n").await.unwrap();

        let mut reader = make_reader(path.clone(), b"aaaa\nbbbb\n").await;
        match reader.poll_read().await {
            ReadOutcome::Produced(events) => assert_eq!(events.len(), 2),
            other => panic!("expected Produced, got {other:?}"),
        }
        assert_eq!(reader.offset(), 10);

        tokio::fs::write(&path, b"cccc\n").await.unwrap();

        match reader.poll_read().await {
            ReadOutcome::AtEof => {}
            other => panic!("expected AtEof after truncation reset, got {other:?}"),
        }
        assert_eq!(reader.offset(), 0, "offset must reset to 0 after in-place truncation");

        match reader.poll_read().await {
            ReadOutcome::Produced(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(&*events[0].payload, b"cccc");
            }
            other => panic!("expected Produced after reset, got {other:?}"),
        }
    }
}

impl std::fmt::Debug for ReadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadOutcome::Produced(events) => write!(f, "Produced({} events)", events.len()),
            ReadOutcome::WouldBlock => write!(f, "WouldBlock"),
            ReadOutcome::AtEof => write!(f, "AtEof"),
            ReadOutcome::Rotated => write!(f, "Rotated"),
            ReadOutcome::Fatal(kind) => write!(f, "Fatal({kind:?})"),
        }
    }
}
