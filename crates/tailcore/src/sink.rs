//! Sink: pure I/O endpoint for finished batches. A sink does not buffer or
//! transform — that is the batcher's and group queue's job — it only writes
//! what it is handed and reports whether the write landed. Concrete backends
//! here cover durable local delivery (NDJSON file) and in-memory capture for
//! tests; a caller can plug in another [`Sink`] implementation entirely.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt};

use crate::model::GroupBatch;

#[async_trait]
pub trait Sink: Send + std::fmt::Debug {
    /// A stable identity for this sink, used as half of a [`crate::model::QueueKey`].
    fn identity(&self) -> &str;
    /// Delivers one finished group of batches. I/O only.
    async fn receive(&mut self, group: GroupBatch) -> Result<()>;
    /// Flushes and releases any resources. Must be called before drop.
    async fn close(&mut self) -> Result<()>;
}

/// Writes every event's payload as one NDJSON line to a file, alongside the
/// checkpoint that made it exactly-once safe to drop on acknowledgement.
#[derive(Debug)]
pub struct NdjsonFileSink {
    identity: String,
    writer: io::BufWriter<File>,
}

impl NdjsonFileSink {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .await
            .with_context(|| format!("creating sink output file {}", path.display()))?;
        Ok(Self {
            identity: path.display().to_string(),
            writer: io::BufWriter::new(file),
        })
    }
}

#[async_trait]
impl Sink for NdjsonFileSink {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn receive(&mut self, group: GroupBatch) -> Result<()> {
        for batch in &group.batches {
            for event in &batch.events {
                self.writer.write_all(&event.payload).await?;
                self.writer.write_all(b"\n").await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.flush().await.context("flushing sink output file")
    }
}

/// Collects delivered groups in memory. Used by tests and by any embedder
/// that wants to inspect output without writing to disk.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    identity: String,
    pub received: Arc<Mutex<Vec<GroupBatch>>>,
}

impl InMemorySink {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Sink for InMemorySink {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn receive(&mut self, group: GroupBatch) -> Result<()> {
        self.received.lock().unwrap().push(group);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Dispatches to a concrete sink without the caller needing to know which
/// one is configured.
#[derive(Debug)]
pub enum SinkBackend {
    NdjsonFile(NdjsonFileSink),
    InMemory(InMemorySink),
}

#[async_trait]
impl Sink for SinkBackend {
    fn identity(&self) -> &str {
        match self {
            SinkBackend::NdjsonFile(s) => s.identity(),
            SinkBackend::InMemory(s) => s.identity(),
        }
    }

    async fn receive(&mut self, group: GroupBatch) -> Result<()> {
        match self {
            SinkBackend::NdjsonFile(s) => s.receive(group).await,
            SinkBackend::InMemory(s) => s.receive(group).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            SinkBackend::NdjsonFile(s) => s.close().await,
            SinkBackend::InMemory(s) => s.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Batch, Checkpoint, DevInode, FileSignature};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn in_memory_sink_records_groups() {
        let mut sink = InMemorySink::new("test");
        let checkpoint = Checkpoint {
            dev_inode: DevInode::new(1, 1),
            signature: FileSignature::capture(b"x", 1024, 1),
            read_offset: 0,
            real_path: "a.log".into(),
            config_name: "cfg".into(),
            last_update_epoch: 0,
        };
        let batch = Batch::new(Arc::new(BTreeMap::new()), Vec::new(), checkpoint, "p-".into());
        sink.receive(GroupBatch::from_batches(vec![batch])).await.unwrap();
        assert_eq!(sink.received.lock().unwrap().len(), 1);
    }
}
