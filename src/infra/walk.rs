use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::{DirEntry, WalkBuilder};
use std::path::{Path, PathBuf};

/// Gitignore-aware walker with optional extra ignore globs.
/// Extra globs are applied in two places:
///   1) Early: prune directories during traversal (filter_entry).
///   2) Late: filter out files that still slipped through.
pub struct FileWalker {
    /// Compiled set of additional ignore patterns
    ignore_patterns: GlobSet,
}

impl FileWalker {
    /// Build a walker with additional ignore patterns (e.g., "target/**",
    /// "node_modules/**", "**/*.min.js"). These are matched on paths
    /// relative to the walk root.
    pub fn new(additional_ignores: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        for pattern in additional_ignores {
            // Compile each glob; return early on invalid patterns
            let glob = Glob::new(pattern)?;
            builder.add(glob);
        }

        let ignore_patterns = builder.build()?;

        Ok(Self { ignore_patterns })
    }

    /// Traverse files under `root`, respecting .gitignore and extra globs.
    /// Returns a sorted list of file paths for determinism.
    pub fn walk_files<P: AsRef<Path>>(&self, root: P) -> Vec<PathBuf> {
        let root_path = root.as_ref();
        let mut builder = WalkBuilder::new(root.as_ref());

        // Include hidden files; rely on .gitignore for policy
        builder.hidden(false);

        // Respect all gitignore sources (local, global, excludes)
        builder.git_ignore(true);
        builder.git_exclude(true);
        builder.git_global(true);

        // Prune directories that match additional ignore patterns early.
        // This prevents descending into large ignored trees.
        let extra = self.ignore_patterns.clone();
        let prune_root = root_path.to_path_buf();
        builder.filter_entry(move |ent: &DirEntry| {
            let is_dir = ent.file_type().map(|ft| ft.is_dir()).unwrap_or(false);

            if is_dir {
                let rel = ent.path().strip_prefix(&prune_root).unwrap_or(ent.path());
                if extra.is_match(rel) {
                    return false;
                }
            }

            true
        });

        let walker = builder.build();

        let mut out: Vec<PathBuf> = walker
            .filter_map(|res| res.ok())
            // Keep only regular files, skip anything in .git
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .map(|entry| entry.into_path())
            .filter(|path| !path.components().any(|c| c.as_os_str() == ".git"))
            // Apply file-level extra ignore filtering using relative paths
            .filter(|path| {
                let rel_path = path.strip_prefix(root_path).unwrap_or(path);
                !self.ignore_patterns.is_match(rel_path)
            })
            .collect();

        // Deterministic output order (stable context assembly)
        out.sort();

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Create a file with parent dirs as needed
    fn write_file(root: &Path, rel: &str, contents: &str) -> Result<()> {
        let path = root.join(rel);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;

        Ok(())
    }

    #[test]
    fn test_file_walking_simple() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        write_file(root, "test.rs", "fn main() {}")?;
        write_file(root, "README.md", "# Test")?;

        let walker = FileWalker::new(&[])?;
        let files = walker.walk_files(root);

        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|p| p.file_name().unwrap() == "README.md"));
        assert!(files.iter().any(|p| p.file_name().unwrap() == "test.rs"));

        // Sorted determinism
        assert!(files.windows(2).all(|w| w[0] <= w[1]));

        Ok(())
    }

    #[test]
    fn test_respects_gitignore() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        // Gitignore handling requires a repo for the ignore crate
        std::process::Command::new("git")
            .args(["init"])
            .current_dir(root)
            .output()
            .ok();

        write_file(root, ".gitignore", "README.md")?;
        write_file(root, "README.md", "# Ignored by gitignore")?;
        write_file(root, "keep.txt", "keep")?;

        let walker = FileWalker::new(&[])?;
        let files = walker.walk_files(root);

        let user_files: Vec<_> = files
            .iter()
            .filter(|f| f.file_name().and_then(|n| n.to_str()) != Some(".gitignore"))
            .collect();

        assert_eq!(
            user_files.len(),
            1,
            "Expected 1 user file, found: {:?}",
            files
        );
        assert_eq!(user_files[0].file_name().unwrap(), "keep.txt");

        Ok(())
    }

    #[test]
    fn test_additional_globs_prune_and_filter() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        write_file(root, "target/build/a.o", "bin")?;
        write_file(root, "node_modules/pkg/index.js", "js")?;
        write_file(root, "src/lib.rs", "pub fn x() {}")?;

        let ignores = vec!["target/**".to_string(), "node_modules/**".to_string()];
        let walker = FileWalker::new(&ignores)?;
        let files = walker.walk_files(root);

        assert_eq!(files.len(), 1, "unexpected files: {files:?}");
        assert_eq!(
            files[0].strip_prefix(root).unwrap(),
            Path::new("src/lib.rs")
        );

        Ok(())
    }
}
