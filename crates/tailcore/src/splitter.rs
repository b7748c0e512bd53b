//! Multiline splitter: turns a stream of newline-delimited bytes into logical
//! records, optionally joining continuation lines into one record via
//! start/continue/end regexes. Container runtime envelope framing (Docker
//! JSON, CRI text-prefix) is handled upstream by [`crate::container_log`]
//! instead, since it operates on a different axis than application-level
//! continuation joining.

use regex::Regex;

#[derive(Debug, Clone)]
pub enum SplitterMode {
    /// Every newline-delimited line is its own record.
    SingleLine,
    /// A new record begins whenever a line matches `start`, or — when
    /// `start` is absent — a record is simply whatever accumulates until
    /// `end` closes it. Lines are accumulated into the current record as
    /// long as `continue_pattern` (when present) matches. Lines seen before
    /// any record is open and that don't match `start` are dropped unless
    /// `keep_unmatched` is set, in which case they're emitted standalone.
    Custom {
        start: Option<Regex>,
        continue_pattern: Option<Regex>,
        end: Option<Regex>,
        keep_unmatched: bool,
    },
}

/// Incremental multiline splitter holding in-progress record state across
/// calls to [`Splitter::feed_line`].
pub struct Splitter {
    mode: SplitterMode,
    pending: Vec<String>,
    pending_bytes: usize,
    max_record_lines: usize,
    max_record_bytes: usize,
}

impl Splitter {
    pub fn new(mode: SplitterMode, max_record_lines: usize, max_record_bytes: usize) -> Self {
        Self {
            mode,
            pending: Vec::new(),
            pending_bytes: 0,
            max_record_lines: max_record_lines.max(1),
            max_record_bytes: max_record_bytes.max(1),
        }
    }

    /// Feeds one newline-delimited line (no trailing `\n`) into the splitter.
    /// Returns every record this line completed, in order; usually zero or
    /// one, but an unmatched line can both close a prior record and stand on
    /// its own when `keep_unmatched` is set.
    pub fn feed_line(&mut self, line: &str) -> Vec<String> {
        match &self.mode {
            SplitterMode::SingleLine => vec![line.to_string()],
            SplitterMode::Custom {
                start,
                continue_pattern,
                end,
                keep_unmatched,
            } => {
                let mut out = Vec::new();
                let pending = &mut self.pending;
                let pending_bytes = &mut self.pending_bytes;

                if pending.is_empty() {
                    let opens = start.as_ref().is_none_or(|re| re.is_match(line));
                    if !opens {
                        if *keep_unmatched {
                            out.push(line.to_string());
                        }
                        return out;
                    }
                    Self::push_pending_fields(pending, pending_bytes, line);
                    if end.as_ref().is_some_and(|e| e.is_match(line)) {
                        out.extend(Self::flush_pending_fields(pending, pending_bytes));
                    }
                    return out;
                }

                if let Some(re) = start {
                    if re.is_match(line) {
                        out.extend(Self::flush_pending_fields(pending, pending_bytes));
                        Self::push_pending_fields(pending, pending_bytes, line);
                        if end.as_ref().is_some_and(|e| e.is_match(line)) {
                            out.extend(Self::flush_pending_fields(pending, pending_bytes));
                        }
                        return out;
                    }
                }

                let belongs = continue_pattern.as_ref().is_none_or(|c| c.is_match(line));
                if !belongs {
                    out.extend(Self::flush_pending_fields(pending, pending_bytes));
                    if *keep_unmatched {
                        out.push(line.to_string());
                    }
                    return out;
                }

                Self::push_pending_fields(pending, pending_bytes, line);
                let over_limit = pending.len() >= self.max_record_lines || *pending_bytes >= self.max_record_bytes;
                if over_limit || end.as_ref().is_some_and(|e| e.is_match(line)) {
                    out.extend(Self::flush_pending_fields(pending, pending_bytes));
                }
                out
            }
        }
    }

    /// Force-closes any in-progress record, e.g. on EOF-without-rotation or
    /// shutdown.
    pub fn flush(&mut self) -> Vec<String> {
        Self::flush_pending_fields(&mut self.pending, &mut self.pending_bytes)
            .into_iter()
            .collect()
    }

    fn push_pending_fields(pending: &mut Vec<String>, pending_bytes: &mut usize, line: &str) {
        *pending_bytes += line.len();
        pending.push(line.to_string());
    }

    fn flush_pending_fields(pending: &mut Vec<String>, pending_bytes: &mut usize) -> Option<String> {
        if pending.is_empty() {
            return None;
        }
        *pending_bytes = 0;
        Some(std::mem::take(pending).join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_emits_each_line() {
        let mut s = Splitter::new(SplitterMode::SingleLine, 100, 1 << 20);
        assert_eq!(s.feed_line("a"), vec!["a"]);
        assert_eq!(s.feed_line("b"), vec!["b"]);
    }

    #[test]
    fn custom_joins_stack_trace_continuations() {
        let start = Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap();
        let mut s = Splitter::new(
            SplitterMode::Custom {
                start: Some(start),
                continue_pattern: None,
                end: None,
                keep_unmatched: false,
            },
            100,
            1 << 20,
        );
        assert_eq!(s.feed_line("2024-01-01 starting"), Vec::<String>::new());
        assert_eq!(s.feed_line("  at foo.rs:10"), Vec::<String>::new());
        assert_eq!(s.feed_line("  at bar.rs:20"), Vec::<String>::new());
        let completed = s.feed_line("2024-01-02 next entry");
        assert_eq!(completed, vec!["2024-01-01 starting\n  at foo.rs:10\n  at bar.rs:20"]);
        assert_eq!(s.flush(), vec!["2024-01-02 next entry"]);
    }

    #[test]
    fn custom_respects_end_pattern() {
        let start = Regex::new(r"^BEGIN").unwrap();
        let end = Regex::new(r"^END").unwrap();
        let mut s = Splitter::new(
            SplitterMode::Custom {
                start: Some(start),
                continue_pattern: None,
                end: Some(end),
                keep_unmatched: false,
            },
            100,
            1 << 20,
        );
        assert_eq!(s.feed_line("BEGIN"), Vec::<String>::new());
        assert_eq!(s.feed_line("middle"), Vec::<String>::new());
        assert_eq!(s.feed_line("END"), vec!["BEGIN\nmiddle\nEND"]);
    }

    #[test]
    fn custom_caps_record_length() {
        let start = Regex::new(r"^S").unwrap();
        let mut s = Splitter::new(
            SplitterMode::Custom {
                start: Some(start),
                continue_pattern: None,
                end: None,
                keep_unmatched: false,
            },
            3,
            1 << 20,
        );
        assert_eq!(s.feed_line("S1"), Vec::<String>::new());
        assert_eq!(s.feed_line("c1"), Vec::<String>::new());
        let completed = s.feed_line("c2");
        assert_eq!(completed, vec!["S1\nc1\nc2"]);
    }

    #[test]
    fn custom_caps_record_bytes_on_unterminated_line() {
        // An end-only record with no line-count pressure must still be
        // force-closed once accumulated bytes cross max_record_bytes, so a
        // writer that never emits `end` can't grow an unbounded carry.
        let end = Regex::new(r"^END").unwrap();
        let mut s = Splitter::new(
            SplitterMode::Custom {
                start: None,
                continue_pattern: None,
                end: Some(end),
                keep_unmatched: false,
            },
            1000,
            10,
        );
        assert_eq!(s.feed_line("12345"), Vec::<String>::new());
        let completed = s.feed_line("67890x");
        assert_eq!(completed, vec!["12345\n67890x"]);
    }

    #[test]
    fn custom_without_start_accumulates_until_end() {
        // Third decision-table shape: end-regex only, no start pattern —
        // every line belongs to the open record until `end` closes it.
        let end = Regex::new(r";$").unwrap();
        let mut s = Splitter::new(
            SplitterMode::Custom {
                start: None,
                continue_pattern: None,
                end: Some(end),
                keep_unmatched: false,
            },
            100,
            1 << 20,
        );
        assert_eq!(s.feed_line("SELECT *"), Vec::<String>::new());
        assert_eq!(s.feed_line("FROM t"), Vec::<String>::new());
        assert_eq!(s.feed_line("WHERE x = 1;"), vec!["SELECT *\nFROM t\nWHERE x = 1;"]);
    }

    #[test]
    fn keep_unmatched_emits_pre_start_lines_standalone() {
        let start = Regex::new(r"^\d{4}-").unwrap();
        let mut s = Splitter::new(
            SplitterMode::Custom {
                start: Some(start),
                continue_pattern: None,
                end: None,
                keep_unmatched: true,
            },
            100,
            1 << 20,
        );
        assert_eq!(s.feed_line("stray banner line"), vec!["stray banner line"]);
        assert_eq!(s.feed_line("2024-01-01 starting"), Vec::<String>::new());
    }

    #[test]
    fn without_keep_unmatched_pre_start_lines_are_dropped() {
        let start = Regex::new(r"^\d{4}-").unwrap();
        let mut s = Splitter::new(
            SplitterMode::Custom {
                start: Some(start),
                continue_pattern: None,
                end: None,
                keep_unmatched: false,
            },
            100,
            1 << 20,
        );
        assert_eq!(s.feed_line("stray banner line"), Vec::<String>::new());
    }
}
