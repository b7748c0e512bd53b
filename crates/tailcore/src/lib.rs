//! tailcore — the log-file collection core of a host telemetry agent.
//!
//! This crate discovers log files, tails them across rotations and restarts,
//! infers record boundaries, applies back-pressure against downstream sinks,
//! and batches the resulting events for handoff with exactly-once
//! checkpointing. It does not parse record contents, store logs, or talk to
//! any specific backend — those are left to a `Sink` implementation.

pub mod batcher;
pub mod checkpoint;
pub mod config;
pub mod container_log;
pub mod discovery;
pub mod encoding;
pub mod group_queue;
pub mod matcher;
pub mod model;
pub mod pipeline;
pub mod reader;
pub mod registry;
pub mod rotation;
pub mod sender;
pub mod sink;
pub mod splitter;
pub mod timer;

pub use config::PipelineConfig;
pub use model::{Batch, Checkpoint, DevInode, Event, FileSignature, QueueKey};
pub use pipeline::Pipeline;
pub use sink::Sink;
