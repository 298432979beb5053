//! Applying edit sets to the working tree: validation, atomic writes,
//! the undo stack, and the optional pre-edit backup mirror.
//!
//! A transaction either lands whole or rolls back: every touched path is
//! snapshotted into the undo frame before its first write, and an I/O
//! failure mid-way restores the files already written from that frame.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use similar::{ChangeTag, TextDiff};

use crate::core::edits::FileEdit;
use crate::infra::io::{atomic_write, read_lines, split_lines};
use crate::parsers::FileLines;

/// Mirror directory for pre-edit content, separate from the in-memory
/// undo stack.
pub const BACKUP_DIR: &str = ".patchup_backups";

/// Pre-edit state of one touched path, sufficient to revert it.
#[derive(Debug, Clone)]
struct FileSnapshot {
    path: PathBuf,

    /// Content before the edit; None when the file did not exist
    prior: Option<String>,

    /// Where the file went when the edit renamed it
    renamed_to: Option<PathBuf>,
}

/// One undo entry: the snapshots for a whole applied edit set.
#[derive(Debug, Default)]
pub struct Frame {
    snapshots: Vec<FileSnapshot>,
}

impl Frame {
    fn revert(&self) -> Result<()> {
        for snapshot in self.snapshots.iter().rev() {
            if let Some(new_path) = &snapshot.renamed_to {
                if new_path.exists() {
                    std::fs::remove_file(new_path).with_context(|| {
                        format!("Failed to remove renamed file {}", new_path.display())
                    })?;
                }
            }
            match &snapshot.prior {
                Some(content) => atomic_write(&snapshot.path, content)?,
                None => {
                    if snapshot.path.exists() {
                        std::fs::remove_file(&snapshot.path).with_context(|| {
                            format!("Failed to remove created file {}", snapshot.path.display())
                        })?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// The undo stack. Boundaries group the frames of one agent transaction
/// so `/undo-all` unwinds everything since the last user input.
#[derive(Debug, Default)]
pub struct EditHistory {
    frames: Vec<Frame>,
    boundary: usize,
}

impl EditHistory {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Mark a user-input boundary; frames pushed after this point belong
    /// to the next transaction.
    pub fn push_boundary(&mut self) {
        self.boundary = self.frames.len();
    }

    fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop();
        self.boundary = self.boundary.min(self.frames.len());
        frame
    }

    fn frames_since_boundary(&self) -> usize {
        self.frames.len() - self.boundary
    }
}

/// Owns working-tree mutation: line snapshots for the parser and
/// renderer, edit application, undo, and backups.
pub struct FileManager {
    root: PathBuf,
    history: EditHistory,
    backups_enabled: bool,

    /// Lines as last read; the parser and previews see one consistent
    /// snapshot per turn
    file_lines: RefCell<HashMap<PathBuf, Vec<String>>>,
}

impl FileLines for FileManager {
    fn lines_of(&self, path: &Path) -> Option<Vec<String>> {
        if let Some(lines) = self.file_lines.borrow().get(path) {
            return Some(lines.clone());
        }
        let lines = read_lines(path).ok()?;
        self.file_lines
            .borrow_mut()
            .insert(path.to_path_buf(), lines.clone());
        Some(lines)
    }
}

impl FileManager {
    pub fn new(root: PathBuf, backups_enabled: bool) -> Self {
        Self {
            root,
            history: EditHistory::default(),
            backups_enabled,
            file_lines: RefCell::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history(&self) -> &EditHistory {
        &self.history
    }

    pub fn push_boundary(&mut self) {
        self.history.push_boundary();
    }

    /// Drop cached lines so the next read sees the tree as it is.
    pub fn invalidate(&self, path: &Path) {
        self.file_lines.borrow_mut().remove(path);
    }

    /// Colored unified diff of what applying `edit` would do.
    pub fn preview(&self, edit: &FileEdit) -> String {
        let display_path = edit
            .path
            .strip_prefix(&self.root)
            .unwrap_or(&edit.path)
            .display()
            .to_string();

        if edit.is_deletion {
            return format!("{}\n", format!("deleting {display_path}").red());
        }

        let before_lines = if edit.is_creation {
            Vec::new()
        } else {
            self.lines_of(&edit.path).unwrap_or_default()
        };
        let after_lines = if edit.is_creation {
            edit.replacements
                .iter()
                .flat_map(|r| r.new_lines.iter().cloned())
                .collect()
        } else {
            edit.apply_to_lines(&before_lines).0
        };
        let before = before_lines.join("\n");
        let after = after_lines.join("\n");

        let mut out = String::new();
        if let Some(target) = &edit.rename_to {
            let to = target.strip_prefix(&self.root).unwrap_or(target);
            out.push_str(&format!(
                "{}\n",
                format!("renaming {display_path} -> {}", to.display()).cyan()
            ));
        } else {
            out.push_str(&format!("{}\n", display_path.cyan()));
        }

        let diff = TextDiff::from_lines(&before, &after);
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Delete => {
                    out.push_str(&format!("{}", format!("-{change}").red()));
                }
                ChangeTag::Insert => {
                    out.push_str(&format!("{}", format!("+{change}").green()));
                }
                ChangeTag::Equal => {}
            }
        }
        out
    }

    /// Apply an edit set as one transaction. Returns the per-edit notes
    /// (conflicts, skips) and whether anything was written. Edits apply
    /// in the order the parser produced them; a failed write rolls back
    /// the files already written.
    pub fn write_changes(&mut self, edits: &[FileEdit]) -> Result<(bool, Vec<String>)> {
        let mut frame = Frame::default();
        let mut notes = Vec::new();
        let mut wrote = false;

        for edit in edits {
            match self.apply_one(edit, &mut frame, &mut notes) {
                Ok(applied) => wrote |= applied,
                Err(e) => {
                    // Restore everything from this transaction, then
                    // surface the failure
                    frame
                        .revert()
                        .context("rollback after failed apply also failed")?;
                    for snapshot in &frame.snapshots {
                        self.invalidate(&snapshot.path);
                        if let Some(renamed) = &snapshot.renamed_to {
                            self.invalidate(renamed);
                        }
                    }
                    return Err(e);
                }
            }
        }

        if wrote {
            self.history.push_frame(frame);
        }
        Ok((wrote, notes))
    }

    fn apply_one(
        &mut self,
        edit: &FileEdit,
        frame: &mut Frame,
        notes: &mut Vec<String>,
    ) -> Result<bool> {
        let mut edit = edit.clone();
        notes.extend(edit.resolve_conflicts());

        let display = edit
            .path
            .strip_prefix(&self.root)
            .unwrap_or(&edit.path)
            .display()
            .to_string();

        // Validation that fails the single edit, not the transaction
        if edit.is_creation && edit.path.exists() {
            notes.push(format!("{display}: already exists; creation skipped"));
            return Ok(false);
        }
        if !edit.is_creation && !edit.path.exists() {
            notes.push(format!("{display}: does not exist; edit skipped"));
            return Ok(false);
        }
        if let Some(target) = &edit.rename_to {
            if target.exists() {
                notes.push(format!(
                    "{display}: rename target {} already exists; edit skipped",
                    target.strip_prefix(&self.root).unwrap_or(target).display()
                ));
                return Ok(false);
            }
        }

        let prior = if edit.path.exists() {
            Some(
                std::fs::read_to_string(&edit.path)
                    .with_context(|| format!("Failed to read {}", edit.path.display()))?,
            )
        } else {
            None
        };

        frame.snapshots.push(FileSnapshot {
            path: edit.path.clone(),
            prior: prior.clone(),
            renamed_to: edit.rename_to.clone(),
        });

        if self.backups_enabled {
            if let Some(content) = &prior {
                self.mirror_backup(&edit.path, content);
            }
        }

        if edit.is_deletion {
            std::fs::remove_file(&edit.path)
                .with_context(|| format!("Failed to delete {}", edit.path.display()))?;
            self.invalidate(&edit.path);
            return Ok(true);
        }

        // Rename first; replacements apply to the new path
        let target_path = match &edit.rename_to {
            Some(target) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&edit.path, target)
                    .with_context(|| format!("Failed to rename {}", edit.path.display()))?;
                self.invalidate(&edit.path);
                target.clone()
            }
            None => edit.path.clone(),
        };

        let before = match &prior {
            Some(content) => split_lines(content),
            None => Vec::new(),
        };
        let (after, warnings) = if edit.is_creation {
            // A creation's single replacement spans the whole new content
            let lines: Vec<String> = edit
                .replacements
                .iter()
                .flat_map(|r| r.new_lines.iter().cloned())
                .collect();
            (lines, Vec::new())
        } else {
            edit.apply_to_lines(&before)
        };
        notes.extend(warnings);

        let mut content = after.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        atomic_write(&target_path, &content)?;
        self.invalidate(&target_path);

        Ok(true)
    }

    fn mirror_backup(&self, path: &Path, content: &str) {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let backup_path = self
            .root
            .join(BACKUP_DIR)
            .join(format!("{}.backup", rel.display()));
        if let Err(e) = atomic_write(&backup_path, content) {
            tracing::warn!(error = %e, "failed to mirror backup for {}", rel.display());
        }
    }

    /// Pop one undo frame and revert it. Returns false when there is
    /// nothing to undo.
    pub fn undo(&mut self) -> Result<bool> {
        let Some(frame) = self.history.pop_frame() else {
            return Ok(false);
        };
        frame.revert()?;
        for snapshot in &frame.snapshots {
            self.invalidate(&snapshot.path);
            if let Some(renamed) = &snapshot.renamed_to {
                self.invalidate(renamed);
            }
        }
        Ok(true)
    }

    /// Revert every frame pushed since the last user-input boundary.
    pub fn undo_all(&mut self) -> Result<usize> {
        let mut reverted = 0;
        while self.history.frames_since_boundary() > 0 {
            if !self.undo()? {
                break;
            }
            reverted += 1;
        }
        Ok(reverted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::edits::Replacement;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn manager() -> (tempfile::TempDir, FileManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::new(dir.path().to_path_buf(), false);
        (dir, manager)
    }

    #[test]
    fn apply_then_undo_restores_bytes() {
        let (dir, mut fm) = manager();
        let path = dir.path().join("calc.py");
        let original = "def add(a,b): return a+b\n";
        std::fs::write(&path, original).unwrap();

        let mut edit = FileEdit::new(path.clone());
        edit.replacements
            .push(Replacement::insertion(1, lines(&["# greet"])));

        let (applied, notes) = fm.write_changes(&[edit]).unwrap();
        assert!(applied);
        assert!(notes.is_empty());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "# greet\ndef add(a,b): return a+b\n"
        );
        assert_eq!(fm.history().len(), 1);

        assert!(fm.undo().unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
        assert!(fm.history().is_empty());
    }

    #[test]
    fn creation_and_deletion_roundtrip() {
        let (dir, mut fm) = manager();
        let created = dir.path().join("nested/new.txt");

        let edit = FileEdit::creation(created.clone(), lines(&["hello"]));
        let (applied, _) = fm.write_changes(&[edit]).unwrap();
        assert!(applied);
        assert_eq!(std::fs::read_to_string(&created).unwrap(), "hello\n");

        let edit = FileEdit::deletion(created.clone());
        let (applied, _) = fm.write_changes(&[edit]).unwrap();
        assert!(applied);
        assert!(!created.exists());

        // Undo deletion, then undo creation
        assert!(fm.undo().unwrap());
        assert_eq!(std::fs::read_to_string(&created).unwrap(), "hello\n");
        assert!(fm.undo().unwrap());
        assert!(!created.exists());
    }

    #[test]
    fn rename_with_edit_applies_after_rename_and_undoes() {
        let (dir, mut fm) = manager();
        let old = dir.path().join("old.py");
        let new = dir.path().join("new.py");
        std::fs::write(&old, "x = 1\n").unwrap();

        let mut edit = FileEdit::new(old.clone());
        edit.rename_to = Some(new.clone());
        edit.replacements
            .push(Replacement::insertion(1, lines(&["# header"])));

        let (applied, _) = fm.write_changes(&[edit]).unwrap();
        assert!(applied);
        assert!(!old.exists());
        assert_eq!(std::fs::read_to_string(&new).unwrap(), "# header\nx = 1\n");

        assert!(fm.undo().unwrap());
        assert!(!new.exists());
        assert_eq!(std::fs::read_to_string(&old).unwrap(), "x = 1\n");
    }

    #[test]
    fn rename_onto_existing_file_is_skipped() {
        let (dir, mut fm) = manager();
        let old = dir.path().join("a.txt");
        let existing = dir.path().join("b.txt");
        std::fs::write(&old, "a\n").unwrap();
        std::fs::write(&existing, "b\n").unwrap();

        let mut edit = FileEdit::new(old.clone());
        edit.rename_to = Some(existing.clone());

        let (applied, notes) = fm.write_changes(&[edit]).unwrap();
        assert!(!applied);
        assert!(notes.iter().any(|n| n.contains("already exists")));
        // Nothing moved or overwritten
        assert_eq!(std::fs::read_to_string(&old).unwrap(), "a\n");
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "b\n");
    }

    #[test]
    fn undo_all_unwinds_to_boundary() {
        let (dir, mut fm) = manager();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "base\n").unwrap();

        fm.push_boundary();
        for text in ["one", "two"] {
            let mut edit = FileEdit::new(path.clone());
            edit.replacements
                .push(Replacement::insertion(1, lines(&[text])));
            fm.write_changes(&[edit]).unwrap();
        }
        assert_eq!(fm.history().len(), 2);

        let reverted = fm.undo_all().unwrap();
        assert_eq!(reverted, 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "base\n");
    }

    #[test]
    fn backup_mirror_keeps_pre_edit_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::new(dir.path().to_path_buf(), true);
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "original\n").unwrap();

        let mut edit = FileEdit::new(path.clone());
        edit.replacements
            .push(Replacement::new(1, 1, lines(&["changed"])));
        fm.write_changes(&[edit]).unwrap();

        let backup = dir.path().join(BACKUP_DIR).join("f.txt.backup");
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "original\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "changed\n");
    }

    #[test]
    fn preview_shows_signs() {
        let (dir, fm) = manager();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "keep\nold\n").unwrap();

        let mut edit = FileEdit::new(path.clone());
        edit.replacements
            .push(Replacement::new(2, 2, lines(&["new"])));

        let preview = crate::parsers::display::strip_ansi(&fm.preview(&edit));
        assert!(preview.contains("-old"));
        assert!(preview.contains("+new"));
        assert!(!preview.contains("-keep"));
    }
}
