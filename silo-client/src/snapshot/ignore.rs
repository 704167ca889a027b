//! Layered ignore rules.
//!
//! Each directory may carry a `.siloignore` file whose rules stack on
//! top of those inherited from parent directories and the caller's
//! policy patterns. Line syntax:
//!
//! * `name` or `*.glob` - excluded anywhere below this directory
//! * `/name` - excluded only directly in this directory
//! * a leading `!` turns either form into a re-include
//! * `#` starts a comment, blank lines are skipped
//!
//! Later rules win over earlier ones, so a `!` rule can punch holes
//! into a broad exclusion from a parent directory or the policy.

use std::path::Path;

use anyhow::{format_err, Error};
use pathpatterns::{MatchEntry, MatchFlag, MatchList, MatchType, PatternFlag};

/// Name of the per-directory ignore file.
pub const IGNORE_FILE_NAME: &str = ".siloignore";

pub struct IgnoreStack {
    rules: Vec<MatchEntry>,
}

/// Parse one ignore-file line into a match rule.
///
/// `dir_prefix` is the rooted path of the directory holding the file
/// (`""` at the snapshot root, `/sub/dir` below); anchored rules embed
/// it so they only ever match inside that directory.
fn parse_rule(line: &str, dir_prefix: &str) -> Result<Option<MatchEntry>, Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (body, kind) = match line.strip_prefix('!') {
        Some(rest) => (rest, MatchType::Include),
        None => (line, MatchType::Exclude),
    };

    let rule = match body.strip_prefix('/') {
        Some(rest) => {
            let rooted = format!("{}/{}", dir_prefix, rest);
            MatchEntry::parse_pattern(rooted.as_str(), PatternFlag::PATH_NAME, kind)
                .map(|rule| rule.add_flags(MatchFlag::ANCHORED))
        }
        None => MatchEntry::parse_pattern(body, PatternFlag::PATH_NAME, kind),
    };

    rule.map(Some)
        .map_err(|err| format_err!("unparsable rule '{}' - {}", line, err))
}

impl IgnoreStack {
    /// Start with the policy-level patterns (unrooted semantics).
    pub fn new(policy_patterns: &[String]) -> Result<Self, Error> {
        let mut rules = Vec::new();
        for pattern in policy_patterns {
            match parse_rule(pattern, "")? {
                Some(rule) => rules.push(rule),
                None => return Err(format_err!("empty ignore pattern in policy")),
            }
        }
        Ok(Self { rules })
    }

    /// Current stack depth; pass to [`truncate`](Self::truncate) when
    /// leaving the directory.
    pub fn mark(&self) -> usize {
        self.rules.len()
    }

    pub fn truncate(&mut self, mark: usize) {
        self.rules.truncate(mark);
    }

    /// Layer the ignore file of one directory, if present. Unreadable
    /// files and broken rules are logged and skipped; ignore rules are
    /// never worth failing a snapshot over.
    pub fn load_ignore_file(&mut self, dir_abs: &Path, dir_rel: &Path) {
        let path = dir_abs.join(IGNORE_FILE_NAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                log::warn!("ignoring unreadable {:?}: {}", path, err);
                return;
            }
        };

        let dir_prefix = {
            let rel = dir_rel.to_string_lossy();
            if rel.is_empty() || rel == "." {
                String::new()
            } else {
                format!("/{}", rel)
            }
        };

        for line in text.lines() {
            match parse_rule(line, &dir_prefix) {
                Ok(Some(rule)) => self.rules.push(rule),
                Ok(None) => (),
                Err(err) => log::warn!("{:?}: {}", path, err),
            }
        }
    }

    /// Whether the entry at `rel_path` (relative to the snapshot root)
    /// is excluded.
    pub fn is_excluded(&self, rel_path: &Path, file_mode: u32) -> bool {
        let rooted = format!("/{}", rel_path.to_string_lossy());
        matches!(
            self.rules.matches(rooted.as_bytes(), Some(file_mode)),
            Some(MatchType::Exclude)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FILE_MODE: u32 = libc::S_IFREG;
    const DIR_MODE: u32 = libc::S_IFDIR;

    #[test]
    fn policy_patterns_are_unrooted() {
        let stack = IgnoreStack::new(&["*.tmp".to_string()]).unwrap();
        assert!(stack.is_excluded(Path::new("a.tmp"), FILE_MODE));
        assert!(stack.is_excluded(Path::new("deep/nested/b.tmp"), FILE_MODE));
        assert!(!stack.is_excluded(Path::new("kept.txt"), FILE_MODE));
    }

    #[test]
    fn ignore_file_layering_and_anchoring() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(IGNORE_FILE_NAME),
            b"# comment\n*.log\n/build\n!keep.log\n",
        )
        .unwrap();

        let mut stack = IgnoreStack::new(&[]).unwrap();
        let mark = stack.mark();
        stack.load_ignore_file(dir.path(), Path::new(""));

        assert!(stack.is_excluded(Path::new("x.log"), FILE_MODE));
        assert!(stack.is_excluded(Path::new("sub/y.log"), FILE_MODE));
        // negation wins
        assert!(!stack.is_excluded(Path::new("keep.log"), FILE_MODE));
        // anchored rule only matches at the ignore file's directory
        assert!(stack.is_excluded(Path::new("build"), DIR_MODE));
        assert!(!stack.is_excluded(Path::new("sub/build"), DIR_MODE));

        stack.truncate(mark);
        assert!(!stack.is_excluded(Path::new("x.log"), FILE_MODE));
    }

    #[test]
    fn nested_ignore_files_anchor_at_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE_NAME), b"/target\n").unwrap();

        let mut stack = IgnoreStack::new(&[]).unwrap();
        stack.load_ignore_file(dir.path(), Path::new("sub"));

        assert!(stack.is_excluded(Path::new("sub/target"), DIR_MODE));
        assert!(!stack.is_excluded(Path::new("target"), DIR_MODE));
        assert!(!stack.is_excluded(Path::new("other/target"), DIR_MODE));
    }

    #[test]
    fn anchored_reinclude() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE_NAME), b"*.cache\n!/hot.cache\n").unwrap();

        let mut stack = IgnoreStack::new(&[]).unwrap();
        stack.load_ignore_file(dir.path(), Path::new(""));

        assert!(stack.is_excluded(Path::new("cold.cache"), FILE_MODE));
        assert!(!stack.is_excluded(Path::new("hot.cache"), FILE_MODE));
        // the re-include is anchored, deeper copies stay excluded
        assert!(stack.is_excluded(Path::new("sub/hot.cache"), FILE_MODE));
    }

    #[test]
    fn comments_blanks_and_broken_rules_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(IGNORE_FILE_NAME),
            b"\n   \n# only noise\n[broken\nreal.skip\n",
        )
        .unwrap();

        let mut stack = IgnoreStack::new(&[]).unwrap();
        stack.load_ignore_file(dir.path(), Path::new(""));

        assert!(stack.is_excluded(Path::new("real.skip"), FILE_MODE));
        assert!(!stack.is_excluded(Path::new("other.txt"), FILE_MODE));
    }
}
