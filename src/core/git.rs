//! Read-only queries against a git working tree.
//!
//! Every operation shells out to the local `git` binary and parses its
//! output; nothing here mutates the tree except [`commit_all`], which backs
//! the `/commit` command. Paths returned to callers are normalized to
//! symlink-resolved absolute paths so identity checks are consistent
//! across call sites.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::infra::io::is_text_file;

/// Failures surfaced by probe operations.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// No repository at the queried path, or no git binary on PATH
    #[error("not a git repository: {0}")]
    Unavailable(PathBuf),

    /// git ran but exited non-zero
    #[error("git {args:?} failed: {stderr}")]
    Invocation { args: Vec<String>, stderr: String },
}

pub type GitResult<T> = Result<T, GitError>;

/// Run git with `args` in `cwd`, returning trimmed stdout.
fn run_git(cwd: &Path, args: &[&str]) -> GitResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|_| GitError::Unavailable(cwd.to_path_buf()))?;

    if !output.status.success() {
        return Err(GitError::Invocation {
            args: args.iter().map(|s| s.to_string()).collect(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Normalize to a symlink-resolved absolute path; non-existent paths are
/// returned joined but uncanonicalized so new files still have an identity.
pub fn normalize(root: &Path, rel: &str) -> PathBuf {
    let joined = root.join(rel);
    dunce::canonicalize(&joined).unwrap_or(joined)
}

/// Resolve the repository root containing `path`, or None when outside a
/// repository. The root itself is symlink-resolved.
pub fn resolve_root(path: &Path) -> Option<PathBuf> {
    let dir = if path.is_dir() {
        path
    } else {
        path.parent().unwrap_or(path)
    };
    let top = run_git(dir, &["rev-parse", "--show-toplevel"]).ok()?;
    if top.is_empty() {
        return None;
    }
    let top = PathBuf::from(top);
    Some(dunce::canonicalize(&top).unwrap_or(top))
}

/// Tracked (cached) files, as absolute paths.
pub fn tracked_files(root: &Path) -> GitResult<BTreeSet<PathBuf>> {
    let out = run_git(root, &["ls-files", "-c", "--exclude-standard"])?;
    Ok(out
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| normalize(root, l))
        .filter(|p| p.exists())
        .collect())
}

/// Untracked files that decode as text, as absolute paths.
pub fn untracked_text_files(root: &Path) -> GitResult<BTreeSet<PathBuf>> {
    let out = run_git(root, &["ls-files", "-o", "--exclude-standard"])?;
    Ok(out
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| normalize(root, l))
        .filter(|p| is_text_file(p))
        .collect())
}

/// Paths with active changes: modified tracked files plus untracked files.
pub fn paths_with_diffs(root: &Path) -> GitResult<BTreeSet<PathBuf>> {
    let changed = run_git(root, &["diff", "--name-only"])?;
    let mut set: BTreeSet<PathBuf> = changed
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| normalize(root, l))
        .collect();
    set.extend(untracked_text_files(root)?);
    Ok(set)
}

/// Files changed between `target` and the working tree, plus untracked
/// text files (they diff against nothing but are part of active work).
pub fn files_in_diff(root: &Path, target: &str) -> GitResult<Vec<PathBuf>> {
    let out = run_git(root, &["diff", "--name-only", target, "--"])?;
    let mut files: Vec<PathBuf> = out
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| normalize(root, l))
        .collect();
    for extra in untracked_text_files(root)? {
        if !files.contains(&extra) {
            files.push(extra);
        }
    }
    files.sort();
    Ok(files)
}

/// Unified diff of the working tree versus `target`, restricted to `path`
/// when given. Untracked text files are appended as synthetic new-file
/// hunks so active work always shows up.
pub fn diff(root: &Path, target: &str, path: Option<&Path>) -> GitResult<String> {
    let mut args = vec!["diff", "-U1", target];
    let rel_holder;
    if let Some(p) = path {
        args.push("--");
        rel_holder = p.to_string_lossy().to_string();
        args.push(&rel_holder);
    }
    let mut out = run_git(root, &args)?;

    if path.is_none() {
        for new_file in untracked_text_files(root)? {
            let rel = new_file.strip_prefix(root).unwrap_or(&new_file);
            let rel = rel.to_string_lossy();
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!(
                "diff --git a/{rel} b/{rel}\nnew file mode 100644\nindex 0000000..ffffff\n--- /dev/null\n+++ b/{rel}\n@@ -0,0 +1 @@"
            ));
            if let Ok(content) = std::fs::read_to_string(&new_file) {
                for line in content.lines() {
                    out.push_str("\n+");
                    out.push_str(line);
                }
            }
        }
    }

    if out.is_empty() {
        Ok(out)
    } else {
        // Trailing newline forms a valid .diff file
        Ok(out + "\n")
    }
}

/// Per-file changed line intervals versus `target`, with the change sign.
/// Parsed from zero-context hunk headers.
pub fn diff_annotations(
    root: &Path,
    target: &str,
) -> GitResult<Vec<(PathBuf, (usize, usize), char)>> {
    let out = run_git(root, &["diff", "-U0", target, "--"])?;
    let mut annotations = Vec::new();
    let mut current: Option<PathBuf> = None;

    for line in out.lines() {
        if let Some(rest) = line.strip_prefix("+++ b/") {
            current = Some(normalize(root, rest));
        } else if line.starts_with("+++ ") {
            current = None;
        } else if let (Some(path), Some(hunk)) = (&current, parse_hunk_header(line)) {
            let (_, _, new_start, new_len) = hunk;
            let sign = if new_len == 0 { '-' } else { '+' };
            let end = new_start + new_len.max(1) - 1;
            annotations.push((path.clone(), (new_start.max(1), end), sign));
        }
    }

    Ok(annotations)
}

/// Parse `@@ -a,b +c,d @@` into (a, b, c, d); counts default to 1.
pub fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let line = line.strip_prefix("@@ ")?;
    let end = line.find(" @@")?;
    let ranges = &line[..end];
    let (old, new) = ranges.split_once(' ')?;

    fn parse_range(s: &str, prefix: char) -> Option<(usize, usize)> {
        let s = s.strip_prefix(prefix)?;
        match s.split_once(',') {
            Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
            None => Some((s.parse().ok()?, 1)),
        }
    }

    let (a, b) = parse_range(old, '-')?;
    let (c, d) = parse_range(new, '+')?;
    Some((a, b, c, d))
}

/// Commit metadata for a tree-ish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMeta {
    pub hexsha: String,
    pub summary: String,
}

pub fn commit_meta(root: &Path, target: &str) -> GitResult<CommitMeta> {
    let out = run_git(root, &["log", target, "-n", "1", "--pretty=format:%H %s"])?;
    let (hexsha, summary) = out.split_once(' ').unwrap_or((out.as_str(), ""));
    Ok(CommitMeta {
        hexsha: hexsha.to_string(),
        summary: summary.to_string(),
    })
}

pub fn default_branch(root: &Path) -> GitResult<String> {
    run_git(root, &["rev-parse", "--abbrev-ref", "HEAD"])
}

pub fn treeish_exists(root: &Path, target: &str) -> bool {
    run_git(root, &["rev-parse", "--verify", "--quiet", target]).is_ok()
}

pub fn head_exists(root: &Path) -> bool {
    treeish_exists(root, "HEAD")
}

/// Common ancestor of two tree-ishes; backs `--pr-diff`.
pub fn merge_base(root: &Path, a: &str, b: &str) -> GitResult<String> {
    run_git(root, &["merge-base", a, b])
}

/// Commit all staged and unstaged changes. The one mutating operation.
pub fn commit_all(root: &Path, message: &str) -> GitResult<()> {
    run_git(root, &["add", "."])?;
    run_git(root, &["commit", "-m", message])?;
    Ok(())
}

/// Blake3 fingerprint of all non-ignored text files, in sorted order.
/// Used in the context cache key so edits invalidate stale code messages.
/// Per-file hashing fans out across cores; the combine stays ordered.
pub fn working_tree_fingerprint(root: &Path) -> GitResult<String> {
    use rayon::prelude::*;

    let mut files: Vec<PathBuf> = tracked_files(root)?.into_iter().collect();
    files.extend(untracked_text_files(root)?);
    files.sort();
    files.dedup();

    let per_file: Vec<[u8; 32]> = files
        .par_iter()
        .filter_map(|path| {
            let bytes = std::fs::read(path).ok()?;
            let mut hasher = blake3::Hasher::new();
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(&bytes);
            Some(*hasher.finalize().as_bytes())
        })
        .collect();

    let mut combined = blake3::Hasher::new();
    for digest in per_file {
        combined.update(&digest);
    }
    Ok(combined.finalize().to_hex().to_string())
}
