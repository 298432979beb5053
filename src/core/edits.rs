//! Structured file edits parsed from model output: replacements,
//! creations, deletions, and renames, with per-path merging and
//! conflict resolution before application.

use std::path::PathBuf;

/// One contiguous line replacement. Lines are 1-indexed inclusive;
/// `end_line == start_line - 1` denotes a pure insertion before
/// `start_line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub start_line: usize,
    pub end_line: usize,
    pub new_lines: Vec<String>,
}

impl Replacement {
    pub fn new(start_line: usize, end_line: usize, new_lines: Vec<String>) -> Self {
        Self {
            start_line,
            end_line,
            new_lines,
        }
    }

    pub fn insertion(before_line: usize, new_lines: Vec<String>) -> Self {
        Self {
            start_line: before_line,
            end_line: before_line.saturating_sub(1),
            new_lines,
        }
    }

    pub fn is_insertion(&self) -> bool {
        self.end_line + 1 == self.start_line
    }

    /// Occupied line span; insertions occupy nothing and never conflict.
    fn occupies(&self, other: &Replacement) -> bool {
        if self.is_insertion() || other.is_insertion() {
            return false;
        }
        self.start_line <= other.end_line && other.start_line <= self.end_line
    }
}

/// All parsed modifications targeting one file. The path is the
/// pre-rename identity; `rename_to` carries the new name when present,
/// and replacements apply after the rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEdit {
    pub path: PathBuf,
    pub replacements: Vec<Replacement>,
    pub is_creation: bool,
    pub is_deletion: bool,
    pub rename_to: Option<PathBuf>,
}

impl FileEdit {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            replacements: Vec::new(),
            is_creation: false,
            is_deletion: false,
            rename_to: None,
        }
    }

    pub fn creation(path: PathBuf, content_lines: Vec<String>) -> Self {
        let len = content_lines.len();
        Self {
            path,
            replacements: vec![Replacement::new(1, len.max(1), content_lines)],
            is_creation: true,
            is_deletion: false,
            rename_to: None,
        }
    }

    pub fn deletion(path: PathBuf) -> Self {
        Self {
            path,
            replacements: Vec::new(),
            is_creation: false,
            is_deletion: true,
            rename_to: None,
        }
    }

    /// Whether applying this edit would do anything at all.
    pub fn is_useful(&self) -> bool {
        !self.replacements.is_empty()
            || self.is_creation
            || self.is_deletion
            || self.rename_to.is_some()
    }

    /// Merge a later edit on the same path: flags accumulate, the rename
    /// target comes from the latest declaration, replacement lists
    /// concatenate in stream order.
    pub fn merge(&mut self, later: FileEdit) {
        debug_assert_eq!(self.path, later.path);
        self.is_creation = self.is_creation || later.is_creation;
        self.is_deletion = self.is_deletion || later.is_deletion;
        if later.rename_to.is_some() {
            self.rename_to = later.rename_to;
        }
        self.replacements.extend(later.replacements);
    }

    /// Resolve conflicts between replacements: when two line ranges
    /// overlap, the later one (by source order) wins; a deletion
    /// discards replacements outright. Returns human-readable notes for
    /// each dropped piece.
    pub fn resolve_conflicts(&mut self) -> Vec<String> {
        let mut notes = Vec::new();

        if self.is_deletion {
            if !self.replacements.is_empty() {
                notes.push(format!(
                    "{}: deletion discards {} earlier edit(s)",
                    self.path.display(),
                    self.replacements.len()
                ));
                self.replacements.clear();
            }
            return notes;
        }

        let mut kept: Vec<Replacement> = Vec::new();
        for replacement in self.replacements.drain(..) {
            kept.retain(|earlier| {
                if earlier.occupies(&replacement) {
                    notes.push(format!(
                        "{}: lines {}-{} superseded by a later edit",
                        self.path.display(),
                        earlier.start_line,
                        earlier.end_line
                    ));
                    false
                } else {
                    true
                }
            });
            kept.push(replacement);
        }

        // Stable order by start line; equal starts keep stream order so
        // stacked insertions land in the order the model produced them.
        kept.sort_by_key(|r| r.start_line);
        self.replacements = kept;

        notes
    }

    /// Apply resolved replacements to a file's lines. Replacements must
    /// be sorted (resolve_conflicts does this); a replacement that no
    /// longer matches the current content is skipped with a warning
    /// rather than aborting the edit.
    pub fn apply_to_lines(&self, lines: &[String]) -> (Vec<String>, Vec<String>) {
        let mut out: Vec<String> = lines.to_vec();
        let mut warnings = Vec::new();
        let mut offset: isize = 0;

        for replacement in &self.replacements {
            if replacement.is_insertion() {
                let at = replacement.start_line as isize - 1 + offset;
                let at = at.clamp(0, out.len() as isize) as usize;
                for (i, line) in replacement.new_lines.iter().enumerate() {
                    out.insert(at + i, line.clone());
                }
                offset += replacement.new_lines.len() as isize;
                continue;
            }

            let start = replacement.start_line as isize - 1 + offset;
            let end = replacement.end_line as isize + offset;
            if start < 0 || end > out.len() as isize || start >= end {
                warnings.push(format!(
                    "{}: lines {}-{} no longer match the file; edit skipped",
                    self.path.display(),
                    replacement.start_line,
                    replacement.end_line
                ));
                continue;
            }

            let (start, end) = (start as usize, end as usize);
            out.splice(start..end, replacement.new_lines.iter().cloned());
            offset += replacement.new_lines.len() as isize - (end - start) as isize;
        }

        (out, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn insertion_before_first_line() {
        let mut edit = FileEdit::new(PathBuf::from("calc.py"));
        edit.replacements
            .push(Replacement::insertion(1, lines(&["# greet"])));
        edit.resolve_conflicts();

        let (out, warnings) = edit.apply_to_lines(&lines(&["def add(a,b): return a+b"]));
        assert!(warnings.is_empty());
        assert_eq!(out, lines(&["# greet", "def add(a,b): return a+b"]));
    }

    #[test]
    fn replacement_and_offsets() {
        let mut edit = FileEdit::new(PathBuf::from("f.txt"));
        edit.replacements
            .push(Replacement::new(2, 2, lines(&["TWO", "TWO-B"])));
        edit.replacements.push(Replacement::new(4, 4, lines(&[])));
        edit.resolve_conflicts();

        let (out, warnings) = edit.apply_to_lines(&lines(&["a", "b", "c", "d"]));
        assert!(warnings.is_empty());
        assert_eq!(out, lines(&["a", "TWO", "TWO-B", "c"]));
    }

    #[test]
    fn later_replacement_wins_overlap() {
        let mut edit = FileEdit::new(PathBuf::from("f.txt"));
        edit.replacements
            .push(Replacement::new(1, 3, lines(&["early"])));
        edit.replacements
            .push(Replacement::new(2, 2, lines(&["late"])));

        let notes = edit.resolve_conflicts();
        assert_eq!(notes.len(), 1);
        assert_eq!(edit.replacements, vec![Replacement::new(2, 2, lines(&["late"]))]);
    }

    #[test]
    fn deletion_discards_replacements() {
        let mut edit = FileEdit::new(PathBuf::from("f.txt"));
        edit.replacements
            .push(Replacement::new(1, 1, lines(&["x"])));
        edit.is_deletion = true;

        let notes = edit.resolve_conflicts();
        assert_eq!(notes.len(), 1);
        assert!(edit.replacements.is_empty());
    }

    #[test]
    fn merge_accumulates_flags_and_latest_rename() {
        let mut base = FileEdit::new(PathBuf::from("old.py"));
        base.rename_to = Some(PathBuf::from("mid.py"));

        let mut later = FileEdit::new(PathBuf::from("old.py"));
        later.rename_to = Some(PathBuf::from("new.py"));
        later
            .replacements
            .push(Replacement::insertion(1, lines(&["#"])));

        base.merge(later);
        assert_eq!(base.rename_to, Some(PathBuf::from("new.py")));
        assert_eq!(base.replacements.len(), 1);
    }

    #[test]
    fn stale_replacement_skipped_with_warning() {
        let mut edit = FileEdit::new(PathBuf::from("f.txt"));
        edit.replacements
            .push(Replacement::new(10, 12, lines(&["nope"])));
        edit.resolve_conflicts();

        let (out, warnings) = edit.apply_to_lines(&lines(&["only line"]));
        assert_eq!(out, lines(&["only line"]));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn creation_spans_entire_content() {
        let edit = FileEdit::creation(PathBuf::from("new.txt"), lines(&["a", "b"]));
        assert!(edit.is_creation);
        assert_eq!(edit.replacements.len(), 1);
        assert_eq!(edit.replacements[0], Replacement::new(1, 2, lines(&["a", "b"])));
    }

    #[test]
    fn stacked_insertions_keep_stream_order() {
        let mut edit = FileEdit::new(PathBuf::from("f.txt"));
        edit.replacements
            .push(Replacement::insertion(2, lines(&["first"])));
        edit.replacements
            .push(Replacement::insertion(2, lines(&["second"])));
        edit.resolve_conflicts();

        let (out, _) = edit.apply_to_lines(&lines(&["a", "b"]));
        assert_eq!(out, lines(&["a", "first", "second", "b"]));
    }
}
