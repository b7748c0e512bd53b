//! Path matching: turns a configured directory + glob pattern into the set of
//! candidate files a discovery pass should consider. Supports one wildcard
//! directory segment in the base path itself (e.g. `/var/log/*/app`), plus
//! directory and file-name blacklists so noisy or irrelevant subtrees never
//! get walked.

use std::path::{Path, PathBuf};

use glob::Pattern;

fn is_wildcard_segment(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Splits `base_dir` at its first wildcard path component, if any, into the
/// literal prefix to list, the pattern that segment must match, and the
/// literal suffix appended to each match. A base with no wildcard segment
/// returns `(base_dir, None, "")`.
fn split_wildcard_base(base_dir: &Path) -> (PathBuf, Option<Pattern>, PathBuf) {
    let comps: Vec<_> = base_dir.components().collect();
    let wildcard_idx = comps.iter().position(|c| match c {
        std::path::Component::Normal(s) => s.to_str().is_some_and(is_wildcard_segment),
        _ => false,
    });
    match wildcard_idx {
        None => (base_dir.to_path_buf(), None, PathBuf::new()),
        Some(idx) => {
            let fixed: PathBuf = comps[..idx].iter().collect();
            let segment = comps[idx].as_os_str().to_str().unwrap_or("*");
            let trailing: PathBuf = comps[idx + 1..].iter().collect();
            (fixed, Pattern::new(segment).ok(), trailing)
        }
    }
}

/// Matches files under `base_dir` against a glob `pattern`, optionally
/// descending into subdirectories up to `max_depth` levels.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    base_dir: PathBuf,
    fixed_prefix: PathBuf,
    wildcard_segment: Option<Pattern>,
    trailing: PathBuf,
    pattern: Pattern,
    max_depth: usize,
    dir_blacklist: Vec<PathBuf>,
    wildcard_dir_blacklist: Vec<Pattern>,
    file_name_blacklist: Vec<Pattern>,
}

impl PathMatcher {
    pub fn new(base_dir: impl Into<PathBuf>, glob_pattern: &str, max_depth: usize) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        let pattern = Pattern::new(glob_pattern)
            .map_err(|e| anyhow::anyhow!("invalid glob pattern {glob_pattern:?}: {e}"))?;
        let (fixed_prefix, wildcard_segment, trailing) = split_wildcard_base(&base_dir);
        Ok(Self {
            base_dir,
            fixed_prefix,
            wildcard_segment,
            trailing,
            pattern,
            max_depth,
            dir_blacklist: Vec::new(),
            wildcard_dir_blacklist: Vec::new(),
            file_name_blacklist: Vec::new(),
        })
    }

    pub fn with_dir_blacklist(mut self, dirs: Vec<PathBuf>) -> Self {
        self.dir_blacklist = dirs;
        self
    }

    pub fn with_wildcard_dir_blacklist(mut self, patterns: &[String]) -> anyhow::Result<Self> {
        self.wildcard_dir_blacklist = patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("invalid wildcard_dir_blacklist pattern: {e}"))?;
        Ok(self)
    }

    pub fn with_file_name_blacklist(mut self, patterns: &[String]) -> anyhow::Result<Self> {
        self.file_name_blacklist = patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("invalid file_name_blacklist pattern: {e}"))?;
        Ok(self)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns true if `path`'s file name matches the configured pattern.
    pub fn matches_name(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.pattern.matches(n))
    }

    /// Returns true if `dir` is excluded from the walk by either blacklist:
    /// an exact (or ancestor) literal match in `dir_blacklist`, or a name
    /// match against any `wildcard_dir_blacklist` pattern.
    pub fn is_dir_blacklisted(&self, dir: &Path) -> bool {
        if self.dir_blacklist.iter().any(|b| dir == b || dir.starts_with(b)) {
            return true;
        }
        let name = dir.file_name().and_then(|n| n.to_str());
        self.wildcard_dir_blacklist
            .iter()
            .any(|p| name.is_some_and(|n| p.matches(n)))
    }

    fn is_file_blacklisted(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.file_name_blacklist.iter().any(|p| p.matches(n)))
    }

    /// Walks every base directory this matcher resolves to (one, unless the
    /// configured base path has a wildcard segment) up to `max_depth`
    /// levels, and returns every regular, non-blacklisted file whose name
    /// matches the pattern. Symlinked directories are not followed, to
    /// avoid discovery cycles.
    pub fn scan(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for base in self.expand_bases()? {
            self.scan_dir(&base, self.max_depth, &mut out)?;
        }
        Ok(out)
    }

    /// Re-globs only the wildcard segment of the base path on each call,
    /// rather than the whole tree, so a wide non-wildcard subtree under a
    /// matched directory is walked by `scan_dir` and not re-enumerated here.
    fn expand_bases(&self) -> std::io::Result<Vec<PathBuf>> {
        let Some(segment_pattern) = &self.wildcard_segment else {
            return Ok(vec![self.base_dir.clone()]);
        };

        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.fixed_prefix) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            if self.is_dir_blacklisted(&path) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if segment_pattern.matches(&name) {
                out.push(path.join(&self.trailing));
            }
        }
        Ok(out)
    }

    fn scan_dir(&self, dir: &Path, depth_left: usize, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                if depth_left > 0 && !self.is_dir_blacklisted(&path) {
                    self.scan_dir(&path, depth_left - 1, out)?;
                }
            } else if file_type.is_file() && self.matches_name(&path) && !self.is_file_blacklisted(&path) {
                out.push(path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_matching_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.log"), b"a").unwrap();
        std::fs::write(dir.path().join("app.log.1"), b"b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"c").unwrap();

        let matcher = PathMatcher::new(dir.path(), "*.log", 0).unwrap();
        let mut found: Vec<_> = matcher
            .scan()
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_owned())
            .collect();
        found.sort();
        assert_eq!(found, vec![std::ffi::OsString::from("app.log")]);
    }

    #[test]
    fn respects_max_depth() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("deep.log"), b"a").unwrap();

        let shallow = PathMatcher::new(dir.path(), "*.log", 0).unwrap();
        assert!(shallow.scan().unwrap().is_empty());

        let deep = PathMatcher::new(dir.path(), "*.log", 1).unwrap();
        assert_eq!(deep.scan().unwrap().len(), 1);
    }

    #[test]
    fn dir_blacklist_skips_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let skip = dir.path().join("skip");
        let keep = dir.path().join("keep");
        std::fs::create_dir(&skip).unwrap();
        std::fs::create_dir(&keep).unwrap();
        std::fs::write(skip.join("a.log"), b"a").unwrap();
        std::fs::write(keep.join("b.log"), b"b").unwrap();

        let matcher = PathMatcher::new(dir.path(), "*.log", 1).unwrap().with_dir_blacklist(vec![skip]);
        let found: Vec<_> = matcher.scan().unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("b.log"));
    }

    #[test]
    fn wildcard_dir_blacklist_matches_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let noisy = dir.path().join("tmp-cache");
        std::fs::create_dir(&noisy).unwrap();
        std::fs::write(noisy.join("a.log"), b"a").unwrap();

        let matcher = PathMatcher::new(dir.path(), "*.log", 1)
            .unwrap()
            .with_wildcard_dir_blacklist(&["tmp-*".to_string()])
            .unwrap();
        assert!(matcher.scan().unwrap().is_empty());
    }

    #[test]
    fn file_name_blacklist_excludes_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.log"), b"a").unwrap();
        std::fs::write(dir.path().join("app.debug.log"), b"b").unwrap();

        let matcher = PathMatcher::new(dir.path(), "*.log", 0)
            .unwrap()
            .with_file_name_blacklist(&["*.debug.log".to_string()])
            .unwrap();
        let found: Vec<_> = matcher.scan().unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("app.log"));
    }

    #[test]
    fn wildcard_base_path_expands_each_match() {
        let dir = tempfile::tempdir().unwrap();
        for pod in ["pod-a", "pod-b"] {
            let app_dir = dir.path().join(pod).join("app");
            std::fs::create_dir_all(&app_dir).unwrap();
            std::fs::write(app_dir.join("out.log"), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("not-a-pod")).unwrap();

        let base = dir.path().join("pod-*").join("app");
        let matcher = PathMatcher::new(base, "*.log", 0).unwrap();
        let found = matcher.scan().unwrap();
        assert_eq!(found.len(), 2);
    }
}
