//! Assembles the prompt's code section under a token budget from
//! user-included files plus auto-selected features, with diff tagging
//! and a single-entry cache keyed by everything the output depends on.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use itertools::Itertools;
use owo_colors::OwoColorize;

use crate::core::budget::Budgeter;
use crate::core::features::{
    parse_intervals, split_file_into_intervals, CodeFeature, CodeMessageLevel, Interval,
};
use crate::core::filters::{EmbeddingCache, FeatureFilter, FilterContext};
use crate::core::git;
use crate::infra::io::{extract_lines, is_text_file, read_file_smart};
use crate::infra::walk::FileWalker;
use crate::llm::LlmClient;

const CODE_FILES_HEADER: &str = "Code Files:";
const INTERVAL_GAP_MARKER: &str = "...";

/// The diff configuration for a session: which tree-ish active changes
/// are measured against, and which files currently differ from it.
#[derive(Debug, Clone)]
pub struct DiffContext {
    /// Resolved tree-ish
    pub target: String,

    /// Human-facing name used in feature annotations
    pub name: String,

    /// Files differing from the target, plus untracked text files
    pub files: Vec<PathBuf>,

    /// Changed line intervals per file with the change sign
    pub annotations: Vec<(PathBuf, (usize, usize), char)>,
}

impl DiffContext {
    /// Resolve `--diff` / `--pr-diff` into a concrete target. `pr_diff`
    /// diffs against the common ancestor of HEAD and the given tree-ish.
    pub fn resolve(root: &Path, diff: Option<&str>, pr_diff: Option<&str>) -> Result<Option<Self>> {
        if diff.is_some() && pr_diff.is_some() {
            bail!("Cannot combine --diff and --pr-diff");
        }
        let Some(requested) = diff.or(pr_diff) else {
            return Ok(None);
        };

        if !git::head_exists(root) {
            bail!("Cannot use a diff target in a repository with no commits");
        }

        let (target, name) = if pr_diff.is_some() {
            let base = git::merge_base(root, "HEAD", requested)
                .with_context(|| format!("No merge base between HEAD and {requested}"))?;
            let meta = git::commit_meta(root, &base)?;
            (
                base.clone(),
                format!("merge-base {}: {}", &meta.hexsha[..8], meta.summary),
            )
        } else if requested == "HEAD" {
            ("HEAD".to_string(), "HEAD (last commit)".to_string())
        } else {
            if !git::treeish_exists(root, requested) {
                bail!("Invalid treeish: {requested}");
            }
            let meta = git::commit_meta(root, requested)?;
            (
                requested.to_string(),
                format!("{requested}: {}", meta.summary),
            )
        };

        let files = git::files_in_diff(root, &target)?;
        let annotations = git::diff_annotations(root, &target)?;

        Ok(Some(Self {
            target,
            name,
            files,
            annotations,
        }))
    }
}

/// Knobs the engine needs from session settings.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub auto_context: bool,
    pub auto_tokens: usize,
    pub use_embeddings: bool,
    pub use_llm_selector: bool,
    pub max_file_chars: usize,
    pub ignore_patterns: Vec<String>,
}

/// External capabilities used while assembling a code message.
pub struct EngineDeps<'a> {
    pub budgeter: &'a Budgeter,
    pub llm: &'a LlmClient,
    pub embeddings: &'a EmbeddingCache,
}

/// The context engine: include set, diff configuration, and the
/// budgeted code-message assembly.
pub struct ContextEngine {
    root: PathBuf,
    config: ContextConfig,
    diff: Option<DiffContext>,

    /// User-pinned slices per path; never auto-expanded
    include_files: IndexMap<PathBuf, Vec<CodeFeature>>,

    /// Most recent (key, message); any input change misses
    cache: RefCell<Option<(u64, String)>>,

    /// Features that made it into the last assembled message
    active_features: RefCell<Vec<CodeFeature>>,

    outline_warned: Cell<bool>,
}

impl ContextEngine {
    pub fn new(root: PathBuf, config: ContextConfig, diff: Option<DiffContext>) -> Self {
        Self {
            root,
            config,
            diff,
            include_files: IndexMap::new(),
            cache: RefCell::new(None),
            active_features: RefCell::new(Vec::new()),
            outline_warned: Cell::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn diff(&self) -> Option<&DiffContext> {
        self.diff.as_ref()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn set_auto_context(&mut self, enabled: bool) {
        self.config.auto_context = enabled;
    }

    pub fn include_files(&self) -> &IndexMap<PathBuf, Vec<CodeFeature>> {
        &self.include_files
    }

    pub fn active_features(&self) -> Vec<CodeFeature> {
        self.active_features.borrow().clone()
    }

    /// Pin a path spec: `file`, `dir`, `glob`, optionally `file:ranges`.
    /// Returns one status line per path touched.
    pub fn include(&mut self, spec: &str, exclude_patterns: &[String]) -> Result<Vec<String>> {
        let (path_part, intervals) = split_interval_spec(spec);
        let expanded = shellexpand::tilde(&path_part).to_string();
        let mut messages = Vec::new();

        for path in self.expand_path(&expanded, exclude_patterns)? {
            if !is_text_file(&path) {
                messages.push(format!("{}: not a text file", self.rel(&path)));
                continue;
            }
            let feature = match &intervals {
                Some(ranges) => {
                    CodeFeature::with_intervals(path.clone(), ranges.clone()).user_included()
                }
                None => CodeFeature::new(path.clone(), CodeMessageLevel::Code).user_included(),
            };
            let entry = self.include_files.entry(path.clone()).or_default();
            if entry.contains(&feature) {
                messages.push(format!("{}: already in context", self.rel(&path)));
            } else {
                entry.push(feature);
                messages.push(format!("{}: added to context", self.rel(&path)));
            }
        }

        if messages.is_empty() {
            bail!("No files matched: {spec}");
        }
        Ok(messages)
    }

    /// Unpin a path spec; directories unpin everything beneath them.
    pub fn exclude(&mut self, spec: &str) -> Result<Vec<String>> {
        let (path_part, _) = split_interval_spec(spec);
        let expanded = shellexpand::tilde(&path_part).to_string();
        let target = self.absolute(&expanded);

        let before = self.include_files.len();
        self.include_files
            .retain(|path, _| !(path == &target || path.starts_with(&target)));

        if self.include_files.len() == before {
            bail!("Not in context: {spec}");
        }
        Ok(vec![format!("{}: removed from context", self.rel(&target))])
    }

    /// Wipe include set and cached state (the `/clear` path).
    pub fn clear(&mut self) {
        self.include_files.clear();
        self.cache.replace(None);
        self.active_features.replace(Vec::new());
    }

    fn absolute(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        let joined = if p.is_absolute() {
            p
        } else {
            self.root.join(p)
        };
        dunce::canonicalize(&joined).unwrap_or(joined)
    }

    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn expand_path(&self, spec: &str, exclude_patterns: &[String]) -> Result<Vec<PathBuf>> {
        // Globs walk the tree and match relative paths
        if spec.contains('*') || spec.contains('?') {
            let glob = globset::Glob::new(spec)
                .with_context(|| format!("Invalid glob: {spec}"))?
                .compile_matcher();
            let walker = FileWalker::new(exclude_patterns)?;
            let matched: Vec<PathBuf> = walker
                .walk_files(&self.root)
                .into_iter()
                .filter(|p| {
                    let rel = p.strip_prefix(&self.root).unwrap_or(p);
                    glob.is_match(rel)
                })
                .collect();
            return Ok(matched);
        }

        let path = self.absolute(spec);
        if path.is_dir() {
            let walker = FileWalker::new(exclude_patterns)?;
            return Ok(walker
                .walk_files(&path)
                .into_iter()
                .filter(|p| is_text_file(p))
                .collect());
        }
        if path.is_file() {
            return Ok(vec![path]);
        }
        bail!("Path does not exist: {spec}")
    }

    fn diff_tag(&self, path: &Path) -> Option<String> {
        let diff = self.diff.as_ref()?;
        if diff.files.iter().any(|f| f == path) {
            Some(diff.name.clone())
        } else {
            None
        }
    }

    /// Metadata lines heading every code message.
    fn metadata_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(diff) = &self.diff {
            lines.push(format!("Diff target: {}", diff.name));
        }
        lines.push(CODE_FILES_HEADER.to_string());
        lines
    }

    fn cache_key(&self, prompt: &str, max_tokens: usize) -> u64 {
        use xxhash_rust::xxh64::Xxh64;
        let mut hasher = Xxh64::new(0);
        hasher.update(prompt.as_bytes());
        hasher.update(&max_tokens.to_le_bytes());
        hasher.update(&[self.config.auto_context as u8]);
        hasher.update(&self.config.auto_tokens.to_le_bytes());
        for (path, features) in &self.include_files {
            hasher.update(path.to_string_lossy().as_bytes());
            for f in features {
                hasher.update(f.ref_string(&self.root).as_bytes());
            }
        }
        if let Some(diff) = &self.diff {
            hasher.update(diff.target.as_bytes());
        }
        // File checksums: edits anywhere in the tree invalidate the cache
        if let Ok(fingerprint) = git::working_tree_fingerprint(&self.root) {
            hasher.update(fingerprint.as_bytes());
        }
        hasher.digest()
    }

    /// Assemble the code section of the prompt: at most `max_tokens`
    /// tokens, deterministic for identical inputs, cached on the full
    /// input key with only the latest entry retained.
    pub async fn get_code_message(
        &self,
        prompt: &str,
        max_tokens: usize,
        expected_edits: Option<Vec<String>>,
        deps: &EngineDeps<'_>,
    ) -> Result<String> {
        let key = self.cache_key(prompt, max_tokens);
        if let Some((cached_key, message)) = self.cache.borrow().as_ref() {
            if *cached_key == key {
                return Ok(message.clone());
            }
        }

        let metadata = self.metadata_lines();
        let metadata_text = metadata.join("\n");
        let metadata_tokens = deps.budgeter.count(&metadata_text);
        if metadata_tokens > max_tokens {
            self.active_features.replace(Vec::new());
            self.cache.replace(Some((key, String::new())));
            return Ok(String::new());
        }
        let remaining = max_tokens - metadata_tokens;

        let filter_ctx = FilterContext {
            root: &self.root,
            budgeter: deps.budgeter,
            llm: deps.llm,
            embeddings: deps.embeddings,
        };

        let selected = if self.config.auto_context {
            let candidates = self.auto_candidates()?;
            let budget = remaining.min(self.config.auto_tokens);
            let filter = FeatureFilter::Default {
                max_tokens: budget,
                use_llm: self.config.use_llm_selector,
                use_embeddings: self.config.use_embeddings,
                prompt: prompt.to_string(),
                expected_edits,
            };
            filter.apply(&filter_ctx, candidates).await?
        } else {
            let mut active = self.manual_features();
            let total: usize = {
                let mut sum = 0;
                for f in &active {
                    sum += f.count_tokens(&self.root, deps.budgeter)?;
                }
                sum
            };
            if total > remaining {
                if self.config.use_embeddings && !prompt.is_empty() {
                    let ranker = FeatureFilter::EmbeddingSimilarity {
                        prompt: prompt.to_string(),
                    };
                    active = ranker.apply(&filter_ctx, active).await?;
                }
                let truncate = FeatureFilter::Truncate {
                    max_tokens: remaining,
                    respect_user_include: false,
                };
                active = truncate.apply(&filter_ctx, active).await?;
            }
            active
        };

        let message = self.assemble(&metadata, selected.clone())?;
        self.active_features.replace(selected);
        self.cache.replace(Some((key, message.clone())));
        Ok(message)
    }

    /// The manual-mode active set: user-pinned slices, or the diff's
    /// file list when nothing is pinned but a diff target is set.
    fn manual_features(&self) -> Vec<CodeFeature> {
        if self.include_files.is_empty() {
            if let Some(diff) = &self.diff {
                return diff
                    .files
                    .iter()
                    .filter(|p| is_text_file(p))
                    .map(|p| {
                        let mut f = CodeFeature::new(p.clone(), CodeMessageLevel::Code);
                        f.diff = Some(diff.name.clone());
                        f
                    })
                    .collect();
            }
            return Vec::new();
        }

        let mut out = Vec::new();
        for features in self.include_files.values() {
            for f in features {
                let mut f = f.clone();
                f.diff = self.diff_tag(&f.path);
                out.push(f);
            }
        }
        out
    }

    /// Candidate features for auto mode: every non-ignored text file in
    /// the tree, split into symbol-aligned intervals. User-included
    /// slices ride along as-is; auto intervals overlapping them drop.
    fn auto_candidates(&self) -> Result<Vec<CodeFeature>> {
        let mut files: BTreeSet<PathBuf> = git::tracked_files(&self.root)
            .unwrap_or_default()
            .into_iter()
            .collect();
        files.extend(git::untracked_text_files(&self.root).unwrap_or_default());

        let ignore = FileWalker::new(&self.config.ignore_patterns)?;
        let allowed: BTreeSet<PathBuf> = ignore.walk_files(&self.root).into_iter().collect();

        let mut out = Vec::new();
        for path in files {
            if !allowed.contains(&path) || !is_text_file(&path) {
                continue;
            }
            if let Ok(meta) = std::fs::metadata(&path) {
                if meta.len() as usize > self.config.max_file_chars {
                    continue;
                }
            }

            if !self.outline_warned.get() && !crate::core::outline::supports(&path) {
                self.outline_warned.set(true);
                tracing::warn!(
                    "no outline support for {}; unsupported files degrade to file names",
                    self.rel(&path)
                );
            }

            let user_slices = self.include_files.get(&path);
            let diff_tag = self.diff_tag(&path);

            if let Some(slices) = user_slices {
                for f in slices {
                    let mut f = f.clone();
                    f.diff = diff_tag.clone();
                    out.push(f);
                }
            }

            for mut feature in split_file_into_intervals(&path, false)? {
                // A user slice wins over overlapping auto ranges
                if let Some(slices) = user_slices {
                    if slices.iter().any(|s| s.intersects(&feature)) {
                        continue;
                    }
                }
                feature.diff = diff_tag.clone();
                out.push(feature);
            }
        }

        // Deterministic pre-filter order: path, then first line
        out.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then_with(|| a.intervals[0].start.cmp(&b.intervals[0].start))
        });
        Ok(out)
    }

    /// Render the final message: features sorted by repo-relative path,
    /// intervals ascending within a file, non-adjacent intervals
    /// separated by an ellipsis marker.
    fn assemble(&self, metadata: &[String], mut features: Vec<CodeFeature>) -> Result<String> {
        features.sort_by(|a, b| {
            self.rel(&a.path)
                .cmp(&self.rel(&b.path))
                .then_with(|| a.intervals[0].start.cmp(&b.intervals[0].start))
        });

        let mut lines: Vec<String> = metadata.to_vec();

        for (path, group) in &features.iter().chunk_by(|f| f.path.clone()) {
            let group: Vec<CodeFeature> = group.cloned().collect();
            lines.push(String::new());
            self.assemble_group(&path, &group, &mut lines)?;
        }

        Ok(lines.join("\n"))
    }

    fn assemble_group(
        &self,
        path: &Path,
        group: &[CodeFeature],
        lines: &mut Vec<String>,
    ) -> Result<()> {
        let interval_feats: Vec<&CodeFeature> = group
            .iter()
            .filter(|f| f.level == CodeMessageLevel::Interval && !f.intervals[0].is_whole())
            .collect();

        if interval_feats.is_empty() {
            // File-scoped levels render themselves, most verbose first
            let best = group
                .iter()
                .min_by_key(|f| f.level.rank())
                .expect("group is non-empty");
            lines.push(best.render(&self.root)?);
            return Ok(());
        }

        // Combined header with every range, then contents with gaps marked
        let mut intervals: Vec<Interval> = interval_feats
            .iter()
            .flat_map(|f| f.intervals.clone())
            .collect();
        intervals.sort_by_key(|i| i.start);

        let ranges = intervals
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut header = format!("{}:{ranges}", self.rel(path));
        if let Some(tag) = group.iter().find_map(|f| f.diff.clone()) {
            header.push_str(&format!(" (diff vs {tag})"));
        }
        lines.push(header);

        let content = read_file_smart(path)?;
        let content = content.as_ref();
        let line_count = content.lines().count();

        let mut prev_end: Option<usize> = None;
        for interval in intervals {
            let start = interval.start;
            let end_incl = interval.end.saturating_sub(1).min(line_count);
            if start > end_incl {
                continue;
            }
            if let Some(prev) = prev_end {
                if start > prev + 1 {
                    lines.push(INTERVAL_GAP_MARKER.to_string());
                }
            }
            lines.push(extract_lines(content, &[(start, end_incl)])?);
            prev_end = Some(end_incl);
        }
        Ok(())
    }

    /// The `/context` display: a path tree of included files with
    /// changed files starred.
    pub fn display_context(&self) -> String {
        let mut out = String::new();
        if self.include_files.is_empty() {
            out.push_str(&format!("{}\n", "No files included in context.".red()));
        } else {
            out.push_str(&format!("{}\n", "Files included in context:".green()));
        }
        if self.config.auto_context {
            out.push_str(&format!(
                "{} {} tokens\n",
                "Auto-context budget:".green(),
                self.config.auto_tokens
            ));
        }

        let changed = git::paths_with_diffs(&self.root).unwrap_or_default();
        let rel_paths: Vec<PathBuf> = self
            .include_files
            .keys()
            .map(|p| PathBuf::from(self.rel(p)))
            .collect();

        let mut tree = PathTree::default();
        for path in &rel_paths {
            tree.insert(path);
        }
        let changed_rel: BTreeSet<PathBuf> = changed
            .iter()
            .map(|p| PathBuf::from(self.rel(p)))
            .collect();
        tree.render(&changed_rel, &PathBuf::new(), "", &mut out);
        out
    }
}

fn split_interval_spec(spec: &str) -> (String, Option<Vec<Interval>>) {
    if let Some((path, ranges)) = spec.rsplit_once(':') {
        if let Some(intervals) = parse_intervals(ranges) {
            return (path.to_string(), Some(intervals));
        }
    }
    (spec.to_string(), None)
}

/// Nested directory tree for the context display.
#[derive(Default)]
struct PathTree {
    children: std::collections::BTreeMap<String, PathTree>,
}

impl PathTree {
    fn insert(&mut self, path: &Path) {
        let mut node = self;
        for part in path.components() {
            let key = part.as_os_str().to_string_lossy().to_string();
            node = node.children.entry(key).or_default();
        }
    }

    fn render(&self, changed: &BTreeSet<PathBuf>, cur: &Path, prefix: &str, out: &mut String) {
        let count = self.children.len();
        for (i, (name, child)) in self.children.iter().enumerate() {
            let last = i + 1 == count;
            let (branch, next_prefix) = if last {
                ("└── ", format!("{prefix}    "))
            } else {
                ("├── ", format!("{prefix}│   "))
            };
            let path = cur.join(name);
            let star = if changed.contains(&path) { "* " } else { "" };
            let label = if child.children.is_empty() {
                if star.is_empty() {
                    name.to_string()
                } else {
                    format!("{}", format!("{star}{name}").green())
                }
            } else {
                format!("{}", name.blue())
            };
            out.push_str(&format!("{prefix}{branch}{label}\n"));
            child.render(changed, &path, &next_prefix, out);
        }
    }
}
