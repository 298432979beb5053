use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

const MMAP_THRESHOLD: u64 = 1024 * 1024; // 1 MiB

pub enum FileContent {
    Mapped(Mmap),
    Buffered(String),
}

impl AsRef<str> for FileContent {
    fn as_ref(&self) -> &str {
        match self {
            FileContent::Mapped(mmap) => {
                // Non-UTF-8 maps render as empty; callers gate on is_text_file
                std::str::from_utf8(mmap).unwrap_or("")
            }
            FileContent::Buffered(s) => s.as_str(),
        }
    }
}

pub fn read_file_smart<P: AsRef<Path>>(path: P) -> Result<FileContent> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to read metadata for {}", path.display()))?;

    if metadata.len() > MMAP_THRESHOLD {
        // Use memory mapping for large files
        let file =
            File::open(path).with_context(|| format!("Failed to open file {}", path.display()))?;

        // Safety: We're only reading the file, not modifying it
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to memory-map {}", path.display()))?;

        Ok(FileContent::Mapped(mmap))
    } else {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file {}", path.display()))?;

        Ok(FileContent::Buffered(content))
    }
}

/// The ultimate filetype test: a file is text if its bytes decode as UTF-8.
/// Missing or unreadable files are not text.
pub fn is_text_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    if !path.is_file() {
        return false;
    }
    match std::fs::read(path) {
        Ok(bytes) => std::str::from_utf8(&bytes).is_ok(),
        Err(_) => false,
    }
}

/// Read a file and split into lines, without trailing newlines.
/// A trailing '\n' does not produce a phantom empty last line.
pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let content = read_file_smart(path)?;
    Ok(split_lines(content.as_ref()))
}

/// Split text into lines without the trailing-newline phantom line.
pub fn split_lines(content: &str) -> Vec<String> {
    content.lines().map(str::to_string).collect()
}

/// Atomically replace `path` with `content`: write to a temp file in the
/// same directory, then rename over the target. Parent directories are
/// created as needed so file creations work in one call.
pub fn atomic_write<P: AsRef<Path>>(path: P, content: &str) -> Result<()> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create parent dirs for {}", path.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file near {}", path.display()))?;
    use std::io::Write;
    tmp.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Extract inclusive 1-based line ranges as a single String.
/// Ranges must be validated and merged by the caller.
pub fn extract_lines(content: &str, ranges: &[(usize, usize)]) -> Result<String> {
    // Work in bytes; validate once then slice cheaply
    let bytes = content.as_bytes();

    // Build index once per file
    let idx = crate::infra::line_index::NewlineIndex::build(bytes);

    // Short-circuit empty files
    if idx.line_count() == 0 {
        return Ok(String::new());
    }

    let mut out = String::with_capacity(ranges.len() * 60);

    for (i, &(s, e)) in ranges.iter().enumerate() {
        // Validate line bounds
        if s == 0 || s > e || s > idx.line_count() {
            anyhow::bail!("invalid range: {s}-{e}");
        }

        // Clamp end to available lines
        let end = e.min(idx.line_count());

        // Map to byte span (exclusive end)
        let (lo, hi) = idx
            .byte_range_for_lines(s, end, bytes)
            .ok_or_else(|| anyhow::anyhow!("range out of bounds: {s}-{end}"))?;

        out.push_str(&content[lo..hi]);

        // Separate consecutive ranges with a single newline
        if i + 1 != ranges.len() {
            out.push('\n');
        }
    }

    Ok(out)
}

pub fn merge_overlapping_ranges(mut ranges: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    if ranges.is_empty() {
        return ranges;
    }

    // Sort by start position
    ranges.sort_by_key(|&(start, _)| start);

    let mut merged = vec![ranges[0]];

    for &(start, end) in &ranges[1..] {
        let last_idx = merged.len() - 1;
        let (last_start, last_end) = merged[last_idx];

        if start <= last_end + 1 {
            // Overlapping or adjacent ranges - merge them
            merged[last_idx] = (last_start, end.max(last_end));
        } else {
            merged.push((start, end));
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overlapping_ranges() {
        assert_eq!(
            merge_overlapping_ranges(vec![(1, 3), (2, 5), (7, 9)]),
            vec![(1, 5), (7, 9)]
        );

        assert_eq!(
            merge_overlapping_ranges(vec![(1, 2), (3, 4)]),
            vec![(1, 4)] // Adjacent ranges should merge
        );

        assert_eq!(
            merge_overlapping_ranges(vec![(1, 1), (3, 3), (5, 5)]),
            vec![(1, 1), (3, 3), (5, 5)]
        );
    }

    #[test]
    fn test_extract_lines() {
        let content = "line1\nline2\nline3\nline4\nline5";

        let result = extract_lines(content, &[(2, 3)]).unwrap();
        assert_eq!(result, "line2\nline3");

        let result = extract_lines(content, &[(1, 2), (4, 5)]).unwrap();
        assert_eq!(result, "line1\nline2\nline4\nline5");
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deeper/file.txt");

        atomic_write(&target, "hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello\n");

        // Overwrite keeps the path whole
        atomic_write(&target, "replaced\n").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "replaced\n");
    }

    #[test]
    fn test_split_lines_no_phantom_tail() {
        assert_eq!(split_lines("a\nb\n"), vec!["a", "b"]);
        assert_eq!(split_lines("a\nb"), vec!["a", "b"]);
        assert_eq!(split_lines(""), Vec::<String>::new());
    }
}
