//! Pipeline configuration: the full set of knobs a log collection config
//! exposes, loaded from environment variables (env-prefixed base layer)
//! with an optional TOML file overlaid on top, TOML winning on conflicts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use tracing::info;

use crate::container_log::ContainerLogFraming;
use crate::encoding::SourceEncoding;

fn default_max_depth() -> usize {
    0
}
fn default_signature_size() -> u64 {
    1024
}
fn default_tail_new_files_from_end() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_rotation_queue_size() -> usize {
    5
}
fn default_rotation_retain_secs() -> u64 {
    300
}
fn default_file_deleted_retain_secs() -> u64 {
    900
}
fn default_max_record_lines() -> usize {
    500
}
fn default_max_record_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_max_batch_docs() -> usize {
    1000
}
fn default_max_batch_bytes() -> usize {
    3 * 1024 * 1024
}
fn default_max_group_batches() -> usize {
    20
}
fn default_max_group_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_flush_timeout_ms() -> u64 {
    3000
}
fn default_sender_primary_capacity() -> usize {
    64
}
fn default_sender_overflow_watermark() -> usize {
    256
}
fn default_checkpoint_path() -> String {
    "./tailcore-checkpoints.ndjson".to_string()
}
fn default_checkpoint_interval_secs() -> u64 {
    10
}

/// One source's worth of discovery and reading configuration: where to look,
/// how to split records, how to decode bytes.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub base_dir: PathBuf,
    pub glob_pattern: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_signature_size")]
    pub signature_size: u64,
    #[serde(default = "default_tail_new_files_from_end")]
    pub tail_new_files_from_end: bool,
    #[serde(default)]
    pub encoding: SourceEncoding,
    #[serde(default)]
    pub container_framing: ContainerLogFramingConfig,
    pub multiline: Option<MultilineConfig>,
    #[serde(default = "default_max_record_lines")]
    pub max_record_lines: usize,
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, String>,
    /// Literal directories (and their subtrees) never to walk.
    #[serde(default)]
    pub dir_blacklist: Vec<PathBuf>,
    /// Glob patterns matched against a directory's own name; any match
    /// excludes that directory and its subtree.
    #[serde(default)]
    pub wildcard_dir_blacklist: Vec<String>,
    /// Glob patterns matched against a file's own name; any match excludes
    /// that file even if it matches `glob_pattern`.
    #[serde(default)]
    pub file_name_blacklist: Vec<String>,
    /// When set, each event's tag set gets a `__file_offset__` tag carrying
    /// the byte offset the reader had reached when the record was emitted.
    #[serde(default)]
    pub emit_file_offset_tag: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerLogFramingConfig {
    #[default]
    None,
    JsonEnvelope,
    TextPrefix,
}

impl From<ContainerLogFramingConfig> for ContainerLogFraming {
    fn from(value: ContainerLogFramingConfig) -> Self {
        match value {
            ContainerLogFramingConfig::None => ContainerLogFraming::None,
            ContainerLogFramingConfig::JsonEnvelope => ContainerLogFraming::JsonEnvelope,
            ContainerLogFramingConfig::TextPrefix => ContainerLogFraming::TextPrefix,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MultilineConfig {
    /// Pattern that opens a new record. Optional: when absent, a record is
    /// simply whatever accumulates until `end_pattern` closes it.
    pub start_pattern: Option<String>,
    pub continue_pattern: Option<String>,
    pub end_pattern: Option<String>,
    /// Emit lines that arrive before any record is open standalone instead
    /// of silently dropping them.
    #[serde(default)]
    pub keep_unmatched: bool,
}

/// Rotation-tracking knobs, shared across all sources unless overridden.
#[derive(Debug, Deserialize, Clone)]
pub struct RotationConfig {
    #[serde(default = "default_rotation_queue_size")]
    pub rotator_queue_size: usize,
    #[serde(default = "default_rotation_retain_secs")]
    pub rotate_retain_secs: u64,
    /// How long a logical path whose file vanished from a scan (deleted, not
    /// rotated) is kept around before its reader is force-closed.
    #[serde(default = "default_file_deleted_retain_secs")]
    pub file_deleted_retain_secs: u64,
    /// Hard cap on concurrently open readers per source. `None` means
    /// unbounded. Past the cap, discovery skips opening newly found files
    /// until an existing reader retires.
    #[serde(default)]
    pub max_readers: Option<usize>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            rotator_queue_size: default_rotation_queue_size(),
            rotate_retain_secs: default_rotation_retain_secs(),
            file_deleted_retain_secs: default_file_deleted_retain_secs(),
            max_readers: None,
        }
    }
}

impl RotationConfig {
    pub fn retain_duration(&self) -> Duration {
        Duration::from_secs(self.rotate_retain_secs)
    }

    pub fn file_deleted_retain_duration(&self) -> Duration {
        Duration::from_secs(self.file_deleted_retain_secs)
    }
}

/// Batching, grouping and flush-timeout knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct BatchingConfig {
    #[serde(default = "default_max_batch_docs")]
    pub max_batch_docs: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_group_batches")]
    pub max_group_batches: usize,
    #[serde(default = "default_max_group_bytes")]
    pub max_group_bytes: usize,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// Whether undersized timeout flushes are bundled together in the group
    /// queue before sending. Batches that already hit `max_batch_docs` or
    /// `max_batch_bytes` always go straight to the sender regardless of
    /// this flag.
    #[serde(default = "default_group_queue_enabled")]
    pub group_queue_enabled: bool,
}

fn default_group_queue_enabled() -> bool {
    true
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_docs: default_max_batch_docs(),
            max_batch_bytes: default_max_batch_bytes(),
            max_group_batches: default_max_group_batches(),
            max_group_bytes: default_max_group_bytes(),
            flush_timeout_ms: default_flush_timeout_ms(),
            group_queue_enabled: default_group_queue_enabled(),
        }
    }
}

impl BatchingConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Back-pressure and sender queue sizing, per sink.
#[derive(Debug, Deserialize, Clone)]
pub struct SenderConfig {
    #[serde(default = "default_sender_primary_capacity")]
    pub primary_capacity: usize,
    #[serde(default = "default_sender_overflow_watermark")]
    pub overflow_high_watermark: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            primary_capacity: default_sender_primary_capacity(),
            overflow_high_watermark: default_sender_overflow_watermark(),
        }
    }
}

/// Root pipeline configuration: one or more sources, plus the shared
/// rotation, batching, sender and checkpoint knobs that apply across all of
/// them.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the checkpoint store's write-behind buffer is flushed to
    /// disk, independent of how often batches are acked.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

/// Loads configuration from `TAILCORE_`-prefixed environment variables,
/// optionally overlaid with a TOML file whose values win on conflict.
pub fn load_config(config_file: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    info!(file = ?config_file, "loading pipeline configuration");

    let figment = Figment::new().merge(Env::prefixed("TAILCORE_").split("__"));
    let figment = match config_file {
        Some(path) => figment.merge(Toml::file(path)),
        None => figment,
    };

    let context_msg = match config_file {
        Some(path) => format!(
            "failed to parse configuration from {} and TAILCORE_* environment variables",
            path.display()
        ),
        None => "failed to parse configuration from TAILCORE_* environment variables".to_string(),
    };

    figment.extract().context(context_msg)
}
