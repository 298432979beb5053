//! The unified git-diff edit format: standard `diff --git` headers,
//! `---`/`+++` paths, and `@@` hunks. Creations arrive as
//! `new file mode`, deletions as `deleted file mode`, renames as
//! `rename from`/`rename to`.
//!
//! Header sequences and hunk headers are the special blocks; hunk bodies
//! are the code lines, terminated by the hunk's own line counts.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::edits::{FileEdit, Replacement};
use crate::core::git::parse_hunk_header;
use crate::parsers::display::{DisplayInfo, FileAction};
use crate::parsers::{CodeEnd, EditFormat, ModelError, ParseContext, SpecialParse};

const GIT_SYSTEM_PROMPT: &str = "\
You are an expert coding assistant working inside the user's repository. \
Answer the user's request in prose, and express every file change as a \
standard unified git diff: a `diff --git a/<path> b/<path>` header, \
`---`/`+++` lines, and `@@ -start,count +start,count @@` hunks whose line \
numbers match the file as you saw it. Signal new files with \
`new file mode`, deletions with `deleted file mode`, and renames with \
`rename from`/`rename to` lines. Do not invent line numbers.";

/// Header lines that open or extend a special block in conversation mode.
const HEADER_PREFIXES: &[&str] = &[
    "diff --git ",
    "index ",
    "similarity index ",
    "new file mode",
    "deleted file mode",
    "rename from ",
    "rename to ",
    "old mode",
    "new mode",
    "--- ",
    "+++ ",
];

static DIFF_GIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^diff --git a/(.+?) b/(.+)$").expect("static pattern compiles")
});

/// File identity carried between a header block and its hunks.
#[derive(Debug, Clone, Default)]
struct FileHeader {
    file_name: Option<PathBuf>,
    is_new: bool,
    is_deleted: bool,
    rename_to: Option<PathBuf>,
}

pub struct GitDiffFormat {
    /// Header of the file whose hunks are currently streaming
    current: FileHeader,

    /// Remaining old/new line counts of the open hunk
    old_remaining: usize,
    new_remaining: usize,
}

impl GitDiffFormat {
    pub fn new() -> Self {
        Self {
            current: FileHeader::default(),
            old_remaining: 0,
            new_remaining: 0,
        }
    }

    fn parse_header_lines(&self, block: &str) -> Result<FileHeader, ModelError> {
        let mut header = FileHeader::default();
        let mut rename_from: Option<PathBuf> = None;

        for line in block.lines() {
            let line = line.trim_end();
            if line.starts_with("new file mode") {
                header.is_new = true;
            } else if line.starts_with("deleted file mode") {
                header.is_deleted = true;
            } else if let Some(rest) = line.strip_prefix("rename from ") {
                rename_from = Some(PathBuf::from(rest.trim()));
            } else if let Some(rest) = line.strip_prefix("rename to ") {
                header.rename_to = Some(PathBuf::from(rest.trim()));
            } else if let Some(rest) = line.strip_prefix("--- ") {
                if let Some(path) = rest.trim().strip_prefix("a/") {
                    header.file_name.get_or_insert_with(|| PathBuf::from(path));
                }
            } else if let Some(rest) = line.strip_prefix("+++ ") {
                if let Some(path) = rest.trim().strip_prefix("b/") {
                    // Prefer the post-image name; rename resolution maps
                    // it back to the original
                    header.file_name = Some(PathBuf::from(path));
                }
            } else if let Some(caps) = DIFF_GIT_RE.captures(line) {
                // `a/<old> b/<new>`: fall back to the a-side path
                if header.file_name.is_none() {
                    header.file_name = Some(PathBuf::from(&caps[1]));
                }
            }
        }

        if header.rename_to.is_some() {
            // A rename block is named by its source
            header.file_name = rename_from.or(header.file_name);
        }
        if header.file_name.is_none() {
            return Err(ModelError(format!("diff header names no file: {block:?}")));
        }
        Ok(header)
    }
}

impl Default for GitDiffFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl EditFormat for GitDiffFormat {
    fn name(&self) -> &'static str {
        "git-diff"
    }

    fn system_prompt(&self) -> &'static str {
        GIT_SYSTEM_PROMPT
    }

    fn could_be_special(&self, partial: &str, in_code: bool) -> bool {
        if in_code {
            // Inside a hunk only a new header could interrupt; +/-/space
            // lines are definitely code
            return "diff --git".starts_with(partial) || partial.starts_with("diff --git");
        }
        HEADER_PREFIXES
            .iter()
            .any(|p| p.starts_with(partial) || partial.starts_with(p))
            || "@@".starts_with(partial)
            || partial.starts_with("@@ ")
    }

    fn starts_special(&mut self, line: &str) -> bool {
        if line.starts_with("diff --git ") {
            // A fresh file header resets the carried identity
            self.current = FileHeader::default();
            return true;
        }
        HEADER_PREFIXES.iter().any(|p| line.starts_with(p))
            || (line.starts_with("@@ ") && self.current.file_name.is_some())
    }

    fn ends_special(&mut self, line: &str, block: &str) -> bool {
        if line.starts_with("@@ ") {
            return true;
        }
        if line.starts_with("rename to ") {
            return true;
        }
        // Deletion headers close at `+++ /dev/null` so the edit exists
        // even before (or without) its hunk
        line.starts_with("+++ ") && block.contains("deleted file mode")
    }

    fn parse_special(
        &mut self,
        block: &str,
        ctx: &ParseContext<'_>,
    ) -> Result<SpecialParse, ModelError> {
        let last_line = block.lines().last().unwrap_or("").trim_end();
        let is_bare_hunk = block.lines().count() == 1 && last_line.starts_with("@@ ");

        if !is_bare_hunk {
            let parsed = self.parse_header_lines(block)?;
            // Merge: a bare header block (e.g. index/---/+++ continuation
            // after a rename) keeps earlier flags
            if parsed.file_name.is_some() {
                let keep_new = self.current.is_new || parsed.is_new;
                let keep_deleted = self.current.is_deleted || parsed.is_deleted;
                self.current = parsed;
                self.current.is_new = keep_new;
                self.current.is_deleted = keep_deleted;
            }
        }

        let file_name = self
            .current
            .file_name
            .clone()
            .ok_or_else(|| ModelError("hunk with no preceding file header".to_string()))?;

        let mut edit = FileEdit::new(ctx.root.join(&file_name));
        edit.is_creation = self.current.is_new;
        edit.is_deletion = self.current.is_deleted;

        let action = if self.current.rename_to.is_some() {
            FileAction::RenameFile
        } else if self.current.is_new {
            FileAction::CreateFile
        } else if self.current.is_deleted {
            FileAction::DeleteFile
        } else {
            FileAction::Replace
        };
        let mut info = DisplayInfo::new(file_name.clone(), action);

        if last_line.starts_with("@@ ") {
            let (old_start, old_len, _, new_len) = parse_hunk_header(last_line)
                .ok_or_else(|| ModelError(format!("malformed hunk header: {last_line}")))?;
            self.old_remaining = old_len;
            self.new_remaining = new_len;

            if old_len > 0 && !self.current.is_new {
                let path = ctx.root.join(&file_name);
                if let Some(lines) = ctx.files.lines_of(&path) {
                    let end = (old_start + old_len - 1).min(lines.len());
                    if old_start >= 1 && old_start <= end {
                        info.removed_lines = lines[old_start - 1..end].to_vec();
                    }
                }
            }

            return Ok(SpecialParse {
                info,
                edit,
                code_follows: true,
            });
        }

        if let Some(rename_to) = &self.current.rename_to {
            edit.rename_to = Some(ctx.root.join(rename_to));
            info.new_name = Some(rename_to.clone());
        }

        Ok(SpecialParse {
            info,
            edit,
            code_follows: false,
        })
    }

    fn classify_code_line(&mut self, line: &str) -> CodeEnd {
        let consumed = match line.chars().next() {
            Some('+') => {
                self.new_remaining = self.new_remaining.saturating_sub(1);
                true
            }
            Some('-') => {
                self.old_remaining = self.old_remaining.saturating_sub(1);
                true
            }
            Some(' ') | None => {
                self.old_remaining = self.old_remaining.saturating_sub(1);
                self.new_remaining = self.new_remaining.saturating_sub(1);
                true
            }
            // `\ No newline at end of file`
            Some('\\') => true,
            _ => false,
        };

        if !consumed {
            return CodeEnd::Outside;
        }
        if self.old_remaining == 0 && self.new_remaining == 0 {
            CodeEnd::LastLine
        } else {
            CodeEnd::Continue
        }
    }

    /// Hunk lines already carry their diff markers.
    fn code_line_prefix(&self) -> &'static str {
        ""
    }

    fn add_code_block(
        &mut self,
        special_block: &str,
        code_block: &str,
        _info: &DisplayInfo,
        edit: &mut FileEdit,
    ) {
        let Some(hunk_line) = special_block
            .lines()
            .last()
            .map(str::trim_end)
            .filter(|l| l.starts_with("@@ "))
        else {
            return;
        };
        let Some((old_start, old_len, _, _)) = parse_hunk_header(hunk_line) else {
            return;
        };

        // Post-image lines: context and additions, markers stripped
        let new_lines: Vec<String> = code_block
            .lines()
            .filter(|l| l.starts_with('+') || l.starts_with(' ') || l.is_empty())
            .map(|l| if l.is_empty() { "" } else { &l[1..] }.to_string())
            .collect();

        if edit.is_creation {
            let len = new_lines.len();
            edit.replacements = vec![Replacement::new(1, len.max(1), new_lines)];
            return;
        }

        let replacement = if old_len == 0 {
            // `-a,0` means insert after line a
            Replacement::insertion(old_start + 1, new_lines)
        } else {
            Replacement::new(old_start, old_start + old_len - 1, new_lines)
        };
        edit.replacements.push(replacement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::FileLines;
    use std::collections::HashMap;
    use std::path::Path;

    struct Files(HashMap<PathBuf, Vec<String>>);

    impl FileLines for Files {
        fn lines_of(&self, path: &Path) -> Option<Vec<String>> {
            self.0.get(path).cloned()
        }
    }

    fn file_ctx<'a>(files: &'a Files, root: &'a Path) -> ParseContext<'a> {
        ParseContext { root, files }
    }

    #[test]
    fn header_then_hunk_yields_replacement() {
        let mut map = HashMap::new();
        map.insert(
            PathBuf::from("/repo/f.txt"),
            vec!["one".to_string(), "two".to_string(), "three".to_string()],
        );
        let files = Files(map);
        let root = Path::new("/repo");
        let ctx = file_ctx(&files, root);
        let mut format = GitDiffFormat::new();

        let block = "diff --git a/f.txt b/f.txt\nindex 123..456 100644\n--- a/f.txt\n+++ b/f.txt\n@@ -2,1 +2,1 @@\n";
        let parsed = format.parse_special(block, &ctx).unwrap();
        assert!(parsed.code_follows);
        assert_eq!(parsed.info.removed_lines, vec!["two"]);

        // Hunk body: one removed, one added
        assert_eq!(format.classify_code_line("-two"), CodeEnd::Continue);
        assert_eq!(format.classify_code_line("+TWO"), CodeEnd::LastLine);

        let mut edit = FileEdit::new(PathBuf::from("/repo/f.txt"));
        format.add_code_block(block, "-two\n+TWO\n", &parsed.info, &mut edit);
        assert_eq!(
            edit.replacements,
            vec![Replacement::new(2, 2, vec!["TWO".to_string()])]
        );
    }

    #[test]
    fn new_file_mode_is_creation() {
        let files = Files(HashMap::new());
        let root = Path::new("/repo");
        let ctx = file_ctx(&files, root);
        let mut format = GitDiffFormat::new();

        let block = "diff --git a/fresh.txt b/fresh.txt\nnew file mode 100644\nindex 000..fff\n--- /dev/null\n+++ b/fresh.txt\n@@ -0,0 +1,2 @@\n";
        let parsed = format.parse_special(block, &ctx).unwrap();
        assert!(parsed.edit.is_creation);
        assert!(parsed.code_follows);

        let mut edit = parsed.edit;
        format.add_code_block(block, "+hello\n+world\n", &parsed.info, &mut edit);
        assert_eq!(
            edit.replacements,
            vec![Replacement::new(
                1,
                2,
                vec!["hello".to_string(), "world".to_string()]
            )]
        );
    }

    #[test]
    fn pure_rename_closes_without_code() {
        let files = Files(HashMap::new());
        let root = Path::new("/repo");
        let ctx = file_ctx(&files, root);
        let mut format = GitDiffFormat::new();

        let block = "diff --git a/old.py b/new.py\nsimilarity index 100%\nrename from old.py\nrename to new.py\n";
        let parsed = format.parse_special(block, &ctx).unwrap();

        assert!(!parsed.code_follows);
        assert_eq!(parsed.edit.path, PathBuf::from("/repo/old.py"));
        assert_eq!(parsed.edit.rename_to, Some(PathBuf::from("/repo/new.py")));
        assert_eq!(parsed.info.new_name, Some(PathBuf::from("new.py")));
    }

    #[test]
    fn bare_hunk_requires_prior_header() {
        let files = Files(HashMap::new());
        let root = Path::new("/repo");
        let ctx = file_ctx(&files, root);
        let mut format = GitDiffFormat::new();

        assert!(format.parse_special("@@ -1,1 +1,1 @@\n", &ctx).is_err());
    }

    #[test]
    fn insertion_hunk_maps_to_insertion() {
        let files = Files(HashMap::new());
        let root = Path::new("/repo");
        let ctx = file_ctx(&files, root);
        let mut format = GitDiffFormat::new();

        let block =
            "diff --git a/f.txt b/f.txt\n--- a/f.txt\n+++ b/f.txt\n@@ -3,0 +4,1 @@\n";
        let parsed = format.parse_special(block, &ctx).unwrap();

        let mut edit = parsed.edit;
        format.add_code_block(block, "+inserted\n", &parsed.info, &mut edit);
        assert_eq!(
            edit.replacements,
            vec![Replacement::insertion(4, vec!["inserted".to_string()])]
        );
    }

    #[test]
    fn deletion_header_closes_at_devnull() {
        let files = Files(HashMap::new());
        let root = Path::new("/repo");
        let ctx = file_ctx(&files, root);
        let mut format = GitDiffFormat::new();

        let block = "diff --git a/gone.txt b/gone.txt\ndeleted file mode 100644\n--- a/gone.txt\n+++ /dev/null\n";
        assert!(format.ends_special("+++ /dev/null", block));
        let parsed = format.parse_special(block, &ctx).unwrap();

        assert!(parsed.edit.is_deletion);
        assert!(!parsed.code_follows);
        assert_eq!(parsed.info.action, FileAction::DeleteFile);
    }
}
