//! Code features: scoped views of a file (whole, outline, or line
//! intervals) packaged for the prompt, with deterministic rendering and
//! memoized token counts.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::core::budget::Budgeter;
use crate::core::outline;
use crate::infra::io::{extract_lines, read_file_smart};

/// Verbosity tier of a feature, ordered by descending verbosity:
/// `Code > Interval > CmapFull > Cmap > FileName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodeMessageLevel {
    /// Full file content
    Code,

    /// One or more line intervals
    Interval,

    /// Outline with signatures
    CmapFull,

    /// Outline with symbol kinds and names only
    Cmap,

    /// Path only
    FileName,
}

impl CodeMessageLevel {
    /// Rank for level ordering; lower rank = more verbose.
    pub fn rank(self) -> u8 {
        match self {
            CodeMessageLevel::Code => 0,
            CodeMessageLevel::Interval => 1,
            CodeMessageLevel::CmapFull => 2,
            CodeMessageLevel::Cmap => 3,
            CodeMessageLevel::FileName => 4,
        }
    }
}

/// A 1-indexed line interval, half-closed on end: lines `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
}

impl Interval {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Whole-file sentinel covering every line.
    pub fn whole() -> Self {
        Self {
            start: 1,
            end: usize::MAX,
        }
    }

    pub fn is_whole(&self) -> bool {
        self.start == 1 && self.end == usize::MAX
    }

    pub fn contains(&self, line: usize) -> bool {
        line >= self.start && line < self.end
    }

    pub fn intersects(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Inclusive 1-based pair for line extraction.
    fn inclusive(&self) -> (usize, usize) {
        (self.start, self.end.saturating_sub(1))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_whole() {
            write!(f, "*")
        } else {
            let (s, e) = self.inclusive();
            write!(f, "{s}-{e}")
        }
    }
}

/// Parse "1-10,25-30" into intervals; bare numbers are single lines.
pub fn parse_intervals(spec: &str) -> Option<Vec<Interval>> {
    let mut out = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start, end_incl) = match part.split_once('-') {
            Some((a, b)) => (a.trim().parse().ok()?, b.trim().parse().ok()?),
            None => {
                let line: usize = part.parse().ok()?;
                (line, line)
            }
        };
        if start == 0 || end_incl < start {
            return None;
        }
        out.push(Interval::new(start, end_incl + 1));
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// A reference to a contiguous slice of a source file at a verbosity
/// level. Two features with identical `(path, intervals, level, diff)`
/// are observationally equal.
#[derive(Debug, Clone)]
pub struct CodeFeature {
    /// Absolute, symlink-resolved path
    pub path: PathBuf,

    /// Line intervals; a single whole-interval for file-scoped levels
    pub intervals: Vec<Interval>,

    pub level: CodeMessageLevel,

    /// Diff target name when this feature carries active changes
    pub diff: Option<String>,

    /// Pinned by the user via paths/`/include`; never auto-expanded
    pub user_included: bool,
}

impl PartialEq for CodeFeature {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.intervals == other.intervals
            && self.level == other.level
            && self.diff == other.diff
    }
}

impl Eq for CodeFeature {}

impl CodeFeature {
    pub fn new(path: PathBuf, level: CodeMessageLevel) -> Self {
        Self {
            path,
            intervals: vec![Interval::whole()],
            level,
            diff: None,
            user_included: false,
        }
    }

    pub fn with_intervals(path: PathBuf, intervals: Vec<Interval>) -> Self {
        Self {
            path,
            intervals,
            level: CodeMessageLevel::Interval,
            diff: None,
            user_included: false,
        }
    }

    pub fn user_included(mut self) -> Self {
        self.user_included = true;
        self
    }

    pub fn contains_line(&self, line: usize) -> bool {
        self.intervals.iter().any(|i| i.contains(line))
    }

    pub fn intersects(&self, other: &CodeFeature) -> bool {
        self.path == other.path
            && self
                .intervals
                .iter()
                .any(|a| other.intervals.iter().any(|b| a.intersects(b)))
    }

    /// Repo-relative reference like `src/lib.rs:1-10,25-30`.
    pub fn ref_string(&self, root: &Path) -> String {
        let rel = self
            .path
            .strip_prefix(root)
            .unwrap_or(&self.path)
            .to_string_lossy()
            .to_string();
        let whole = self.intervals.len() == 1 && self.intervals[0].is_whole();
        if whole || self.level != CodeMessageLevel::Interval {
            rel
        } else {
            let ranges = self
                .intervals
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            format!("{rel}:{ranges}")
        }
    }

    /// Header line: `path[:ranges][ (diff vs NAME)]`.
    fn header(&self, root: &Path) -> String {
        let mut header = self.ref_string(root);
        if let Some(name) = &self.diff {
            header.push_str(&format!(" (diff vs {name})"));
        }
        header
    }

    /// The textual block this feature contributes to the prompt: a header
    /// followed by content at the requested level. Deterministic given
    /// file content and level.
    pub fn render(&self, root: &Path) -> Result<String> {
        let header = self.header(root);

        let effective_level = if matches!(
            self.level,
            CodeMessageLevel::Cmap | CodeMessageLevel::CmapFull
        ) && !outline::supports(&self.path)
        {
            CodeMessageLevel::FileName
        } else {
            self.level
        };

        let body = match effective_level {
            CodeMessageLevel::FileName => String::new(),
            CodeMessageLevel::Code => {
                let content = read_file_smart(&self.path)?;
                content.as_ref().trim_end_matches('\n').to_string()
            }
            CodeMessageLevel::Interval => {
                let content = read_file_smart(&self.path)?;
                let content = content.as_ref();
                let line_count = content.lines().count();
                let ranges: Vec<(usize, usize)> = self
                    .intervals
                    .iter()
                    .map(|i| {
                        let (s, e) = i.inclusive();
                        (s, e.min(line_count))
                    })
                    .filter(|&(s, e)| s <= e && s <= line_count)
                    .collect();
                if ranges.is_empty() {
                    String::new()
                } else {
                    extract_lines(content, &ranges)?
                }
            }
            CodeMessageLevel::Cmap | CodeMessageLevel::CmapFull => {
                match outline::extractor_for(&self.path) {
                    Some(extractor) => {
                        let content = read_file_smart(&self.path)?;
                        let symbols = extractor.extract(content.as_ref())?;
                        let full = effective_level == CodeMessageLevel::CmapFull;
                        outline::outline_lines(&symbols, full).join("\n")
                    }
                    None => String::new(),
                }
            }
        };

        if body.is_empty() {
            Ok(header)
        } else {
            Ok(format!("{header}\n{body}"))
        }
    }

    /// Token count of the rendered block. Memoized per rendered content
    /// hash inside the budgeter, so repeated queries are cheap.
    pub fn count_tokens(&self, root: &Path, budgeter: &Budgeter) -> Result<usize> {
        Ok(budgeter.count(&self.render(root)?))
    }
}

/// Partition a file into contiguous interval features aligned to
/// top-level symbol boundaries from the outliner. Files without outline
/// support become a single whole-file interval.
pub fn split_file_into_intervals(path: &Path, user_included: bool) -> Result<Vec<CodeFeature>> {
    let content = read_file_smart(path)?;
    let content = content.as_ref();
    let line_count = content.lines().count().max(1);

    let boundaries: Vec<usize> = match outline::extractor_for(path) {
        Some(extractor) => {
            let symbols = extractor.extract(content)?;
            let mut starts: Vec<usize> = symbols
                .iter()
                .filter(|s| s.scope.is_none())
                .map(|s| s.start_line)
                .filter(|&l| l > 1)
                .collect();
            starts.sort_unstable();
            starts.dedup();
            starts
        }
        None => Vec::new(),
    };

    let mut features = Vec::new();
    let mut start = 1usize;
    for boundary in boundaries {
        if boundary > start {
            let mut f =
                CodeFeature::with_intervals(path.to_path_buf(), vec![Interval::new(start, boundary)]);
            f.user_included = user_included;
            features.push(f);
            start = boundary;
        }
    }
    let mut last = CodeFeature::with_intervals(
        path.to_path_buf(),
        vec![Interval::new(start, line_count + 1)],
    );
    last.user_included = user_included;
    features.push(last);

    Ok(features)
}
