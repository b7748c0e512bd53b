//! Pipeline: wires discovery, reading, splitting, batching, grouping and
//! sending into the single end-to-end loop a caller actually runs. Drives
//! everything from one cooperative loop rather than a worker pool, matching
//! this crate's single-owner-reader concurrency model.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use crate::batcher::{Batcher, BatcherLimits};
use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::discovery::{DiscoveryConfig, DiscoveryHandler};
use crate::group_queue::{GroupQueue, GroupQueueLimits};
use crate::matcher::PathMatcher;
use crate::model::{Checkpoint, GroupBatch, QueueKey};
use crate::reader::{ReadOutcome, ReaderConfig};
use crate::registry::ReaderRegistry;
use crate::sender::SenderQueue;
use crate::sink::Sink;
use crate::splitter::SplitterMode;
use crate::timer::TimeoutScheduler;

struct SourceRuntime {
    config_name: String,
    discovery: DiscoveryHandler,
    queue_key: QueueKey,
}

/// Drives the full collection pipeline for one configured sink: every
/// configured source feeds readers into a shared registry, reads are
/// batched and grouped per queue key, and finished groups flow through a
/// back-pressure-aware sender queue into the sink.
pub struct Pipeline<S: Sink> {
    config: PipelineConfig,
    registry: Arc<ReaderRegistry>,
    checkpoints: Arc<CheckpointStore>,
    sources: Vec<SourceRuntime>,
    batcher: Batcher,
    group_queue: GroupQueue,
    sender: SenderQueue<GroupBatch>,
    scheduler: TimeoutScheduler,
    sink: S,
    last_checkpoint_flush: Instant,
}

impl<S: Sink> Pipeline<S> {
    pub async fn new(config: PipelineConfig, sink: S) -> Result<Self> {
        let checkpoints = Arc::new(
            CheckpointStore::load(&config.checkpoint_path)
                .await
                .with_context(|| format!("loading checkpoint store {}", config.checkpoint_path))?,
        );
        let registry = Arc::new(ReaderRegistry::new());

        let mut sources = Vec::new();
        for src in &config.sources {
            let matcher = PathMatcher::new(&src.base_dir, &src.glob_pattern, src.max_depth)
                .with_context(|| format!("building path matcher for source {}", src.name))?
                .with_dir_blacklist(src.dir_blacklist.clone())
                .with_wildcard_dir_blacklist(&src.wildcard_dir_blacklist)
                .with_context(|| format!("compiling wildcard_dir_blacklist for source {}", src.name))?
                .with_file_name_blacklist(&src.file_name_blacklist)
                .with_context(|| format!("compiling file_name_blacklist for source {}", src.name))?;

            let splitter_mode = match &src.multiline {
                None => SplitterMode::SingleLine,
                Some(ml) => SplitterMode::Custom {
                    start: ml
                        .start_pattern
                        .as_deref()
                        .map(regex::Regex::new)
                        .transpose()
                        .with_context(|| format!("compiling start_pattern for source {}", src.name))?,
                    continue_pattern: ml
                        .continue_pattern
                        .as_deref()
                        .map(regex::Regex::new)
                        .transpose()
                        .with_context(|| format!("compiling continue_pattern for source {}", src.name))?,
                    end: ml
                        .end_pattern
                        .as_deref()
                        .map(regex::Regex::new)
                        .transpose()
                        .with_context(|| format!("compiling end_pattern for source {}", src.name))?,
                    keep_unmatched: ml.keep_unmatched,
                },
            };

            let reader_factory = ReaderConfig {
                tags: Arc::new(src.tags.clone().into_iter().collect()),
                config_name: src.name.clone(),
                encoding: src.encoding,
                splitter_mode,
                max_record_lines: src.max_record_lines,
                max_record_bytes: src.max_record_bytes,
                container_framing: src.container_framing.into(),
                emit_file_offset_tag: src.emit_file_offset_tag,
            };

            let discovery = DiscoveryHandler::new(
                matcher,
                DiscoveryConfig {
                    config_name: src.name.clone(),
                    reader_factory,
                    signature_size: src.signature_size,
                    tail_new_files_from_end: src.tail_new_files_from_end,
                    rotation_queue_size: config.rotation.rotator_queue_size,
                    rotation_retain: config.rotation.retain_duration(),
                    file_deleted_retain: config.rotation.file_deleted_retain_duration(),
                    max_readers: config.rotation.max_readers,
                },
                registry.clone(),
                checkpoints.clone(),
            );

            sources.push(SourceRuntime {
                config_name: src.name.clone(),
                discovery,
                queue_key: QueueKey::new(&src.name, "pending-sink-identity"),
            });
        }

        let batcher = Batcher::new(
            BatcherLimits {
                max_batch_docs: config.batching.max_batch_docs,
                max_batch_bytes: config.batching.max_batch_bytes,
            },
            "tailcore-",
        );
        let group_queue = GroupQueue::new(GroupQueueLimits {
            max_group_batches: config.batching.max_group_batches,
            max_group_bytes: config.batching.max_group_bytes,
        });
        let sender: SenderQueue<GroupBatch> = SenderQueue::new(
            QueueKey::new("pipeline", sink.identity()),
            config.sender.primary_capacity,
            config.sender.overflow_high_watermark,
        );

        // Queue keys are resolved against the sink's real identity now that
        // the sink is available.
        let mut sources = sources;
        for s in &mut sources {
            s.queue_key = QueueKey::new(&s.config_name, sink.identity());
        }

        let mut scheduler = TimeoutScheduler::new();
        let now = Instant::now();
        for s in &sources {
            scheduler.schedule(s.queue_key, config.batching.flush_timeout(), now);
        }

        Ok(Self {
            config,
            registry,
            checkpoints,
            sources,
            batcher,
            group_queue,
            sender,
            scheduler,
            sink,
            last_checkpoint_flush: now,
        })
    }

    /// Runs discovery, reading, batching and sending forever, until an
    /// unrecoverable sink error occurs.
    pub async fn run(mut self) -> Result<()> {
        let poll_interval = self.config.poll_interval();
        loop {
            self.tick().await?;
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Runs exactly one discovery-read-batch-send cycle. Exposed separately
    /// from [`Pipeline::run`] so tests can drive deterministic ticks instead
    /// of racing a sleep loop.
    pub async fn tick(&mut self) -> Result<()> {
        let mut retiring: Vec<(QueueKey, crate::registry::ReaderId)> = Vec::new();
        for source in &mut self.sources {
            match source.discovery.poll().await {
                Ok(closed) => retiring.extend(closed.into_iter().map(|id| (source.queue_key, id))),
                Err(e) => warn!(source = %source.config_name, error = %e, "discovery pass failed"),
            }
        }
        for (queue_key, id) in retiring {
            self.retire_reader(queue_key, id);
        }

        // Once the sender's overflow buffer has crossed its high watermark,
        // every reader backs off rather than producing events the pipeline
        // has nowhere bounded to put, per the back-pressure gate: reads are
        // only resumed once pump_sender has drained enough backlog to clear
        // saturation.
        if self.sender.is_saturated() {
            debug!("sender queue saturated, suspending all readers this tick");
        } else {
            for id in self.registry.all_ids() {
                self.drain_reader(id).await?;
            }
        }

        self.drain_due_timeouts();
        self.pump_sender().await?;

        let now = Instant::now();
        if now.duration_since(self.last_checkpoint_flush) >= self.config.checkpoint_interval() {
            self.checkpoints.flush().await?;
            self.last_checkpoint_flush = now;
        }
        Ok(())
    }

    async fn drain_reader(&mut self, id: crate::registry::ReaderId) -> Result<()> {
        let Some(mut reader) = self.registry.remove(id) else {
            return Ok(());
        };
        let result = reader.poll_read().await;
        let config_name = reader.config_name().to_string();
        let dev_inode = reader.dev_inode;
        let path = reader.path.clone();
        let queue_key = self
            .sources
            .iter()
            .find(|s| s.config_name == config_name)
            .map(|s| s.queue_key)
            .unwrap_or_else(|| QueueKey::new(&config_name, "unknown-sink"));

        match result {
            ReadOutcome::Produced(events) => {
                let offset = reader.offset();
                let signature = reader.signature();
                self.registry.insert(dev_inode, path.clone(), reader);
                for event in events {
                    let checkpoint = Checkpoint {
                        dev_inode,
                        signature,
                        read_offset: offset,
                        real_path: path.display().to_string(),
                        config_name: config_name.clone(),
                        last_update_epoch: Checkpoint::now_epoch(),
                    };
                    if let Some(batch) = self.batcher.push(queue_key, event, checkpoint) {
                        self.route_batch(queue_key, batch, true);
                    }
                }
            }
            ReadOutcome::WouldBlock | ReadOutcome::AtEof => {
                self.registry.insert(dev_inode, path, reader);
            }
            ReadOutcome::Rotated => {
                debug!(path = %path.display(), "reader observed its own rotation, dropping");
            }
            ReadOutcome::Fatal(kind) => {
                error!(path = %path.display(), ?kind, "fatal read error, closing reader");
            }
        }
        Ok(())
    }

    /// Closes a reader the rotation tracker or missing-file retirement has
    /// just evicted, flushing whatever partial record the splitter was still
    /// holding so it isn't lost.
    fn retire_reader(&mut self, queue_key: QueueKey, id: crate::registry::ReaderId) {
        let Some(mut reader) = self.registry.remove(id) else {
            return;
        };
        let events = reader.drain_on_close();
        let checkpoint = Checkpoint {
            dev_inode: reader.dev_inode,
            signature: reader.signature(),
            read_offset: reader.offset(),
            real_path: reader.path.display().to_string(),
            config_name: reader.config_name().to_string(),
            last_update_epoch: Checkpoint::now_epoch(),
        };
        for event in events {
            if let Some(batch) = self.batcher.push(queue_key, event, checkpoint.clone()) {
                self.route_batch(queue_key, batch, true);
            }
        }
    }

    fn drain_due_timeouts(&mut self) {
        let now = Instant::now();
        for key in self.scheduler.drain_due(now) {
            let batches = self.batcher.flush_key(key);
            for batch in batches {
                self.route_batch(key, batch, false);
            }
            if let Some(group) = self.group_queue.flush(key) {
                self.sender.offer(group);
            }
        }
    }

    /// Routes one finished [`Batch`] either straight to the sender or
    /// through the group queue for bundling with other small batches.
    /// `size_triggered` batches — ones that closed because they hit
    /// `max_batch_docs`/`max_batch_bytes` — always go direct: the group
    /// queue exists to amortize overhead for undersized timeout flushes,
    /// not to delay batches that are already full.
    fn route_batch(&mut self, queue_key: QueueKey, batch: crate::model::Batch, size_triggered: bool) {
        if size_triggered || !self.config.batching.group_queue_enabled {
            self.sender.offer(crate::model::GroupBatch::from_batches(vec![batch]));
            return;
        }
        if let Some(group) = self.group_queue.push(queue_key, batch) {
            self.sender.offer(group);
        }
    }

    /// Forwards queued groups to the sink and commits the carried checkpoints
    /// only once the sink has acknowledged receipt, so a rejected group never
    /// advances the on-disk read position past data the sink never got.
    async fn pump_sender(&mut self) -> Result<()> {
        while let Some(group) = self.sender.try_recv() {
            let checkpoints: Vec<Checkpoint> = group
                .batches
                .iter()
                .map(|b| b.exactly_once_checkpoint.clone())
                .collect();
            match self.sink.receive(group).await {
                Ok(()) => {
                    for checkpoint in checkpoints {
                        self.checkpoints.update(checkpoint).await?;
                    }
                    self.sender.drain_overflow_into_primary();
                }
                Err(e) => {
                    error!(error = %e, "sink rejected group, checkpoint not advanced");
                }
            }
        }
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.sender.close();
        self.checkpoints.flush().await?;
        self.sink.close().await
    }
}
