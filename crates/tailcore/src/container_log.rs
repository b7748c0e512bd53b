//! Container runtime log framing: unwraps the per-line envelope that
//! container runtimes wrap around application stdout/stderr before the
//! payload ever reaches the multiline splitter. Covers both the Docker
//! JSON-file log driver's envelope and the CRI text-prefix format emitted
//! by containerd/CRI-O, including CRI's partial-line reassembly.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerLogFraming {
    /// No runtime envelope; lines are passed through unmodified.
    None,
    /// Docker JSON-file log driver: one JSON object per line.
    JsonEnvelope,
    /// CRI text format: `<timestamp> <stream> <P|F> <payload>`.
    TextPrefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedLine {
    pub stream: Stream,
    pub payload: String,
    /// True if this line is a non-final fragment of a longer line and must
    /// be joined with the lines that follow before being handed to the
    /// splitter.
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Deserialize)]
struct DockerJsonLine {
    log: String,
    stream: String,
    #[allow(dead_code)]
    time: Option<String>,
}

/// Decodes container runtime envelopes and reassembles CRI partial-line
/// fragments into full lines before they reach the multiline splitter.
#[derive(Debug)]
pub struct ContainerLogDecoder {
    framing: ContainerLogFraming,
    partial_buffer: String,
    partial_stream: Option<Stream>,
}

impl ContainerLogDecoder {
    pub fn new(framing: ContainerLogFraming) -> Self {
        Self {
            framing,
            partial_buffer: String::new(),
            partial_stream: None,
        }
    }

    /// Feeds one raw line (without the trailing newline) from the on-disk
    /// log file. Returns a complete, unwrapped application line once all
    /// CRI fragments for it have arrived, or `None` while still buffering a
    /// partial line.
    pub fn feed_line(&mut self, raw: &str) -> Option<(Stream, String)> {
        match self.framing {
            ContainerLogFraming::None => Some((Stream::Stdout, raw.to_string())),
            ContainerLogFraming::JsonEnvelope => self.feed_json(raw),
            ContainerLogFraming::TextPrefix => self.feed_text_prefix(raw),
        }
    }

    /// A Docker JSON-envelope line whose `log` field does not end in `\n` is
    /// a partial write the runtime flushed mid-line; it must be buffered and
    /// joined with whatever `log` fragment arrives in the next envelope,
    /// mirroring the CRI `P`/`F` reassembly below.
    fn feed_json(&mut self, raw: &str) -> Option<(Stream, String)> {
        let parsed: DockerJsonLine = serde_json::from_str(raw).ok()?;
        let stream = if parsed.stream == "stderr" {
            Stream::Stderr
        } else {
            Stream::Stdout
        };
        let ends_line = parsed.log.ends_with('\n');
        let content = parsed.log.trim_end_matches('\n');

        if !ends_line {
            if self.partial_stream.is_none() {
                self.partial_stream = Some(stream);
            }
            self.partial_buffer.push_str(content);
            return None;
        }

        if self.partial_buffer.is_empty() {
            return Some((stream, content.to_string()));
        }
        self.partial_buffer.push_str(content);
        let full = std::mem::take(&mut self.partial_buffer);
        let full_stream = self.partial_stream.take().unwrap_or(stream);
        Some((full_stream, full))
    }

    fn feed_text_prefix(&mut self, raw: &str) -> Option<(Stream, String)> {
        let mut parts = raw.splitn(4, ' ');
        let _timestamp = parts.next()?;
        let stream_tag = parts.next()?;
        let tag = parts.next()?;
        let payload = parts.next().unwrap_or("");

        let stream = if stream_tag == "stderr" {
            Stream::Stderr
        } else {
            Stream::Stdout
        };
        let is_partial = tag == "P";

        if is_partial {
            if self.partial_stream.is_none() {
                self.partial_stream = Some(stream);
            }
            self.partial_buffer.push_str(payload);
            return None;
        }

        if self.partial_buffer.is_empty() {
            return Some((stream, payload.to_string()));
        }
        self.partial_buffer.push_str(payload);
        let full = std::mem::take(&mut self.partial_buffer);
        let full_stream = self.partial_stream.take().unwrap_or(stream);
        Some((full_stream, full))
    }
}
